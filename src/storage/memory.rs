//! 内存中的远程存储
//!
//! ID 由 uuid 生成，与路径无关，行为上接近云端文档存储：同名文件允许并存，
//! 上传时保留本地修改时间，并提供 MD5 校验和。可以按名称注入失败，用于测试容错。

use super::{EntryKind, LocalStore, RemoteEntry, RemoteStore, FOLDER_MIME_TYPE};
use crate::core::tree::HashAlgorithm;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// 顶层文件夹 ID
pub const ROOT_ID: &str = "root";

struct StoredItem {
    entry: RemoteEntry,
    parent: Option<String>,
    content: Vec<u8>,
}

#[derive(Default)]
struct MemoryState {
    items: HashMap<String, StoredItem>,
    failing: HashSet<String>,
    calls: Vec<String>,
}

impl MemoryState {
    fn path_of(&self, id: &str) -> String {
        let mut parts = Vec::new();
        let mut current = Some(id.to_string());
        while let Some(cur) = current {
            match self.items.get(&cur) {
                Some(item) if item.parent.is_some() => {
                    parts.push(item.entry.name.clone());
                    current = item.parent.clone();
                }
                _ => break,
            }
        }
        parts.reverse();
        parts.join("/")
    }

    fn child_by_name(&self, parent_id: &str, name: &str) -> Option<&StoredItem> {
        self.items
            .values()
            .filter(|i| i.parent.as_deref() == Some(parent_id) && i.entry.name == name)
            .min_by(|a, b| a.entry.id.cmp(&b.entry.id))
    }

    fn check_failure(&self, name: &str) -> Result<()> {
        if self.failing.contains(name) {
            bail!("injected failure for '{}'", name);
        }
        Ok(())
    }

    fn insert(&mut self, parent_id: &str, entry: RemoteEntry, content: Vec<u8>) -> Result<RemoteEntry> {
        match self.items.get(parent_id) {
            Some(p) if p.entry.is_folder() => {}
            Some(_) => bail!("parent '{}' is not a folder", parent_id),
            None => bail!("parent '{}' not found", parent_id),
        }
        self.items.insert(
            entry.id.clone(),
            StoredItem {
                entry: entry.clone(),
                parent: Some(parent_id.to_string()),
                content,
            },
        );
        Ok(entry)
    }
}

pub struct MemoryRemote {
    state: Mutex<MemoryState>,
    name: String,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        let mut state = MemoryState::default();
        state.items.insert(
            ROOT_ID.to_string(),
            StoredItem {
                entry: RemoteEntry {
                    id: ROOT_ID.to_string(),
                    name: String::new(),
                    kind: EntryKind::Folder,
                    mime_type: Some(FOLDER_MIME_TYPE.to_string()),
                    size: 0,
                    modified_at: Utc::now(),
                    checksum: None,
                },
                parent: None,
                content: Vec::new(),
            },
        );
        Self {
            state: Mutex::new(state),
            name: "memory".to_string(),
        }
    }

    fn new_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn md5_hex(data: &[u8]) -> String {
        format!("{:x}", md5::compute(data))
    }

    /// 添加文件夹，返回 ID
    pub fn add_folder(&self, parent_id: &str, name: &str) -> Result<String> {
        let entry = RemoteEntry {
            id: Self::new_id(),
            name: name.to_string(),
            kind: EntryKind::Folder,
            mime_type: Some(FOLDER_MIME_TYPE.to_string()),
            size: 0,
            modified_at: Utc::now(),
            checksum: None,
        };
        Ok(self.state.lock().insert(parent_id, entry, Vec::new())?.id)
    }

    /// 添加文件，返回 ID
    pub fn add_file(
        &self,
        parent_id: &str,
        name: &str,
        content: &[u8],
        modified_at: DateTime<Utc>,
    ) -> Result<String> {
        let entry = RemoteEntry {
            id: Self::new_id(),
            name: name.to_string(),
            kind: EntryKind::File,
            mime_type: Some("application/octet-stream".to_string()),
            size: content.len() as u64,
            modified_at,
            checksum: Some(Self::md5_hex(content)),
        };
        Ok(self.state.lock().insert(parent_id, entry, content.to_vec())?.id)
    }

    /// 添加云端原生文档（无二进制内容）
    pub fn add_document(&self, parent_id: &str, name: &str, mime_type: &str) -> Result<String> {
        let entry = RemoteEntry {
            id: Self::new_id(),
            name: name.to_string(),
            kind: EntryKind::File,
            mime_type: Some(mime_type.to_string()),
            size: 0,
            modified_at: Utc::now(),
            checksum: None,
        };
        Ok(self.state.lock().insert(parent_id, entry, Vec::new())?.id)
    }

    /// 对指定名称的条目注入失败（列出、下载、上传、更新、创建）
    pub fn fail_on(&self, name: &str) {
        self.state.lock().failing.insert(name.to_string());
    }

    pub fn content(&self, id: &str) -> Option<Vec<u8>> {
        self.state.lock().items.get(id).map(|i| i.content.clone())
    }

    pub fn entry(&self, id: &str) -> Option<RemoteEntry> {
        self.state.lock().items.get(id).map(|i| i.entry.clone())
    }

    /// 按路径查找条目
    pub fn find(&self, path: &str) -> Option<RemoteEntry> {
        let state = self.state.lock();
        let mut current = ROOT_ID.to_string();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = state.child_by_name(&current, part)?.entry.id.clone();
        }
        state.items.get(&current).map(|i| i.entry.clone())
    }

    /// 同名文件数量（用于检查是否产生了重复副本）
    pub fn count_named(&self, name: &str) -> usize {
        self.state
            .lock()
            .items
            .values()
            .filter(|i| i.entry.name == name)
            .count()
    }

    /// 已执行的写操作，格式为 `操作:路径`
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn list_children(&self, folder_id: &str) -> Result<Vec<RemoteEntry>> {
        let state = self.state.lock();
        let folder = state
            .items
            .get(folder_id)
            .ok_or_else(|| anyhow!("folder '{}' not found", folder_id))?;
        state.check_failure(&folder.entry.name)?;

        let mut children: Vec<_> = state
            .items
            .values()
            .filter(|i| i.parent.as_deref() == Some(folder_id))
            .map(|i| i.entry.clone())
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    async fn get_metadata(&self, id: &str) -> Result<RemoteEntry> {
        self.entry(id).ok_or_else(|| anyhow!("item '{}' not found", id))
    }

    async fn download(&self, id: &str, dest_path: &Path) -> Result<()> {
        let content = {
            let mut state = self.state.lock();
            let path = state.path_of(id);
            let item = state
                .items
                .get(id)
                .ok_or_else(|| anyhow!("item '{}' not found", id))?;
            state.check_failure(&item.entry.name)?;
            if item.entry.is_folder() || item.entry.is_opaque() {
                bail!("'{}' has no binary content", item.entry.name);
            }
            let content = item.content.clone();
            state.calls.push(format!("download:{}", path));
            content
        };

        LocalStore::write_atomic(dest_path, content).await
    }

    async fn upload(&self, local_path: &Path, parent_id: &str, name: &str) -> Result<RemoteEntry> {
        self.state.lock().check_failure(name)?;

        let content = tokio::fs::read(local_path).await?;
        let modified_at: DateTime<Utc> = tokio::fs::metadata(local_path).await?.modified()?.into();

        let entry = RemoteEntry {
            id: Self::new_id(),
            name: name.to_string(),
            kind: EntryKind::File,
            mime_type: Some("application/octet-stream".to_string()),
            size: content.len() as u64,
            modified_at,
            checksum: Some(Self::md5_hex(&content)),
        };

        let mut state = self.state.lock();
        let entry = state.insert(parent_id, entry, content)?;
        let path = state.path_of(&entry.id);
        state.calls.push(format!("upload:{}", path));
        Ok(entry)
    }

    async fn update_content(&self, id: &str, local_path: &Path) -> Result<RemoteEntry> {
        let name = self
            .entry(id)
            .ok_or_else(|| anyhow!("item '{}' not found", id))?
            .name;
        self.state.lock().check_failure(&name)?;

        let content = tokio::fs::read(local_path).await?;
        let modified_at: DateTime<Utc> = tokio::fs::metadata(local_path).await?.modified()?.into();

        let mut state = self.state.lock();
        let path = state.path_of(id);
        let item = state
            .items
            .get_mut(id)
            .ok_or_else(|| anyhow!("item '{}' not found", id))?;
        item.entry.size = content.len() as u64;
        item.entry.modified_at = modified_at;
        item.entry.checksum = Some(Self::md5_hex(&content));
        item.content = content;
        let entry = item.entry.clone();
        state.calls.push(format!("update:{}", path));
        Ok(entry)
    }

    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<RemoteEntry> {
        let mut state = self.state.lock();
        state.check_failure(name)?;

        let entry = RemoteEntry {
            id: Self::new_id(),
            name: name.to_string(),
            kind: EntryKind::Folder,
            mime_type: Some(FOLDER_MIME_TYPE.to_string()),
            size: 0,
            modified_at: Utc::now(),
            checksum: None,
        };
        let entry = state.insert(parent_id, entry, Vec::new())?;
        let path = state.path_of(&entry.id);
        state.calls.push(format!("create_folder:{}", path));
        Ok(entry)
    }

    async fn resolve_path_to_id(&self, path: &str) -> Result<Option<String>> {
        let state = self.state.lock();
        let mut current = ROOT_ID.to_string();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            match state.child_by_name(&current, part) {
                Some(item) => current = item.entry.id.clone(),
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    async fn delete_by_id(&self, id: &str) -> Result<()> {
        if id == ROOT_ID {
            bail!("cannot delete the root folder");
        }

        let mut state = self.state.lock();
        let path = state.path_of(id);
        let mut pending = vec![id.to_string()];
        while let Some(current) = pending.pop() {
            state.items.remove(&current);
            pending.extend(
                state
                    .items
                    .values()
                    .filter(|i| i.parent.as_deref() == Some(current.as_str()))
                    .map(|i| i.entry.id.clone()),
            );
        }
        state.calls.push(format!("delete:{}", path));
        Ok(())
    }

    fn checksum_algorithm(&self) -> Option<HashAlgorithm> {
        Some(HashAlgorithm::Md5)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_and_list() {
        let remote = MemoryRemote::new();
        let docs = remote.add_folder(ROOT_ID, "Docs").unwrap();
        remote.add_file(&docs, "a.txt", b"abc", Utc::now()).unwrap();
        remote
            .add_document(&docs, "Plan", "application/vnd.google-apps.document")
            .unwrap();

        assert_eq!(remote.resolve_path_to_id("").await.unwrap().as_deref(), Some(ROOT_ID));
        assert_eq!(remote.resolve_path_to_id("/Docs/").await.unwrap(), Some(docs.clone()));
        assert_eq!(remote.resolve_path_to_id("Docs/missing").await.unwrap(), None);

        let children = remote.list_children(&docs).await.unwrap();
        let names: Vec<_> = children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Plan", "a.txt"]);
        assert!(children[0].is_opaque());
        assert_eq!(
            children[1].checksum.as_deref(),
            Some("900150983cd24fb0d6963f7d28e17f72")
        );
    }

    #[tokio::test]
    async fn test_injected_failure_and_delete() {
        let remote = MemoryRemote::new();
        let docs = remote.add_folder(ROOT_ID, "Docs").unwrap();
        let file = remote.add_file(&docs, "bad.bin", b"x", Utc::now()).unwrap();
        remote.fail_on("bad.bin");

        let dir = tempfile::tempdir().unwrap();
        assert!(remote.download(&file, &dir.path().join("bad.bin")).await.is_err());

        remote.delete_by_id(&docs).await.unwrap();
        assert!(remote.entry(&file).is_none());
        assert_eq!(remote.calls(), vec!["delete:Docs".to_string()]);
    }
}
