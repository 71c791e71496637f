//! 文件树模型
//!
//! 扫描结果是不可变的值类型树：文件夹按名称持有子节点，没有父指针。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// 内容摘要算法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Md5,
    Blake3,
}

/// 带算法标记的内容摘要，只有算法相同才可比较
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentHash {
    pub algorithm: HashAlgorithm,
    pub hex: String,
}

impl ContentHash {
    pub fn new(algorithm: HashAlgorithm, hex: impl Into<String>) -> Self {
        Self {
            algorithm,
            hex: hex.into().to_lowercase(),
        }
    }

    /// 两个摘要是否可比较且相同；算法不同时返回 None
    pub fn matches(&self, other: &ContentHash) -> Option<bool> {
        (self.algorithm == other.algorithm).then(|| self.hex == other.hex)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Folder,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileNode {
    pub name: String,
    pub path: String,
    /// 远程 ID，本地节点为 None
    pub id: Option<String>,
    pub size: u64,
    pub content_hash: Option<ContentHash>,
    pub modified_at: DateTime<Utc>,
    /// 云端原生文档，没有二进制内容
    pub opaque: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderNode {
    pub name: String,
    pub path: String,
    pub id: Option<String>,
    pub folders: BTreeMap<String, FolderNode>,
    pub files: BTreeMap<String, FileNode>,
}

/// 文件或文件夹
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Node {
    File(FileNode),
    Folder(FolderNode),
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::File(f) => &f.name,
            Node::Folder(f) => &f.name,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Node::File(f) => &f.path,
            Node::Folder(f) => &f.path,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Node::File(_) => NodeKind::File,
            Node::Folder(_) => NodeKind::Folder,
        }
    }
}

impl FolderNode {
    pub fn new(name: impl Into<String>, path: impl Into<String>, id: Option<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            id,
            folders: BTreeMap::new(),
            files: BTreeMap::new(),
        }
    }

    /// 子节点路径
    pub fn child_path(&self, name: &str) -> String {
        join_path(&self.path, name)
    }

    pub fn with_file(mut self, file: FileNode) -> Self {
        self.files.insert(file.name.clone(), file);
        self
    }

    pub fn with_folder(mut self, folder: FolderNode) -> Self {
        self.folders.insert(folder.name.clone(), folder);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.folders.is_empty() && self.files.is_empty()
    }

    /// 子树中的文件数量（递归）
    pub fn file_count(&self) -> usize {
        self.files.len() + self.folders.values().map(|f| f.file_count()).sum::<usize>()
    }

    /// 子树中的文件夹数量（不含自身）
    pub fn folder_count(&self) -> usize {
        self.folders.len() + self.folders.values().map(|f| f.folder_count()).sum::<usize>()
    }

    /// 深度优先遍历子树中的所有文件，附带相对本文件夹的路径
    pub fn walk_files(&self) -> Vec<(String, &FileNode)> {
        let mut out = Vec::new();
        self.collect_files("", &mut out);
        out
    }

    fn collect_files<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a FileNode)>) {
        for file in self.files.values() {
            out.push((join_path(prefix, &file.name), file));
        }
        for folder in self.folders.values() {
            folder.collect_files(&join_path(prefix, &folder.name), out);
        }
    }

    /// 先序遍历所有子文件夹（父在子前），附带相对路径
    pub fn walk_folders(&self) -> Vec<(String, &FolderNode)> {
        let mut out = Vec::new();
        self.collect_folders("", &mut out);
        out
    }

    fn collect_folders<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a FolderNode)>) {
        for folder in self.folders.values() {
            let rel = join_path(prefix, &folder.name);
            out.push((rel.clone(), folder));
            folder.collect_folders(&rel, out);
        }
    }
}

/// 一侧（远程或本地）的一棵同步树
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tree {
    pub root: FolderNode,
}

impl Tree {
    pub fn new(root: FolderNode) -> Self {
        Self { root }
    }

    /// 指定路径的空树
    pub fn empty(path: &str, id: Option<String>) -> Self {
        Self::new(FolderNode::new(leaf_name(path), path, id))
    }

    pub fn file_count(&self) -> usize {
        self.root.file_count()
    }

    pub fn folder_count(&self) -> usize {
        self.root.folder_count()
    }
}

/// 用 `/` 连接路径，空父路径表示顶层
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// 路径最后一段
pub fn leaf_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}

/// 父路径，顶层返回空串
pub fn parent_path(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) => "/",
        Some(pos) => &path[..pos],
        None => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str) -> FileNode {
        FileNode {
            name: leaf_name(path).to_string(),
            path: path.to_string(),
            id: None,
            size: 1,
            content_hash: None,
            modified_at: Utc::now(),
            opaque: false,
        }
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(join_path("", "a.txt"), "a.txt");
        assert_eq!(join_path("Docs", "a.txt"), "Docs/a.txt");
        assert_eq!(join_path("/", "home"), "/home");
        assert_eq!(leaf_name("Docs/sub/a.txt"), "a.txt");
        assert_eq!(leaf_name("/home/me/"), "me");
        assert_eq!(parent_path("Docs/sub/a.txt"), "Docs/sub");
        assert_eq!(parent_path("a.txt"), "");
        assert_eq!(parent_path("/home"), "/");
    }

    #[test]
    fn test_walks_are_parent_first_with_relative_paths() {
        let tree = FolderNode::new("B", "B", None)
            .with_file(file("B/y.txt"))
            .with_folder(
                FolderNode::new("c", "B/c", None)
                    .with_file(file("B/c/z.txt"))
                    .with_folder(FolderNode::new("d", "B/c/d", None)),
            );

        let folders: Vec<_> = tree.walk_folders().into_iter().map(|(r, _)| r).collect();
        assert_eq!(folders, vec!["c", "c/d"]);

        let files: Vec<_> = tree.walk_files().into_iter().map(|(r, _)| r).collect();
        assert_eq!(files, vec!["y.txt", "c/z.txt"]);

        assert_eq!(tree.file_count(), 2);
        assert_eq!(tree.folder_count(), 2);
    }

    #[test]
    fn test_hash_comparison_requires_same_algorithm() {
        let a = ContentHash::new(HashAlgorithm::Md5, "ABC");
        let b = ContentHash::new(HashAlgorithm::Md5, "abc");
        let c = ContentHash::new(HashAlgorithm::Blake3, "abc");
        assert_eq!(a.matches(&b), Some(true));
        assert_eq!(a.matches(&c), None);
    }
}
