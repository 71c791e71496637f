//! 同步计划

use crate::core::tree::{FileNode, FolderNode, Node};
use serde::Serialize;
use std::fmt;

/// 计划中的单个文件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedFile {
    pub node: FileNode,
    /// 源端规范路径
    pub source_path: String,
    /// 映射后的目标路径，映射失败时为 None
    pub dest_path: Option<String>,
    /// 被覆盖的远程文件 ID（本地较新且按策略上传时）
    pub replaces_id: Option<String>,
}

/// 只存在于一侧、需要整体同步的文件夹
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedFolder {
    pub node: FolderNode,
    pub source_path: String,
    pub dest_path: Option<String>,
}

/// 内容不同且未被策略自动解决的文件对
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub remote: FileNode,
    pub local: FileNode,
    pub remote_newer: bool,
}

impl Conflict {
    pub fn newer_side(&self) -> &'static str {
        if self.remote_newer {
            "remote"
        } else {
            "local"
        }
    }
}

/// 同名条目在一侧是文件、另一侧是文件夹
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeConflict {
    pub remote: Node,
    pub local: Node,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPlan {
    pub to_download: Vec<PlannedFile>,
    pub to_upload: Vec<PlannedFile>,
    pub conflicts: Vec<Conflict>,
    pub remote_only_folders: Vec<PlannedFolder>,
    pub local_only_folders: Vec<PlannedFolder>,
    pub type_conflicts: Vec<TypeConflict>,
}

impl SyncPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// 合并另一对根目录的计划
    pub fn merge(&mut self, other: SyncPlan) {
        self.to_download.extend(other.to_download);
        self.to_upload.extend(other.to_upload);
        self.conflicts.extend(other.conflicts);
        self.remote_only_folders.extend(other.remote_only_folders);
        self.local_only_folders.extend(other.local_only_folders);
        self.type_conflicts.extend(other.type_conflicts);
    }

    pub fn is_empty(&self) -> bool {
        self.to_download.is_empty()
            && self.to_upload.is_empty()
            && self.conflicts.is_empty()
            && self.remote_only_folders.is_empty()
            && self.local_only_folders.is_empty()
            && self.type_conflicts.is_empty()
    }

    pub fn summary(&self) -> PlanSummary {
        let folder_files = |folders: &[PlannedFolder]| -> (usize, u64) {
            folders
                .iter()
                .flat_map(|f| f.node.walk_files())
                .filter(|(_, file)| !file.opaque)
                .fold((0, 0), |(n, bytes), (_, file)| (n + 1, bytes + file.size))
        };
        let (remote_folder_files, remote_folder_bytes) = folder_files(&self.remote_only_folders);
        let (local_folder_files, local_folder_bytes) = folder_files(&self.local_only_folders);

        PlanSummary {
            download_files: self.to_download.len() + remote_folder_files,
            download_bytes: self.to_download.iter().map(|f| f.node.size).sum::<u64>()
                + remote_folder_bytes,
            upload_files: self.to_upload.len() + local_folder_files,
            upload_bytes: self.to_upload.iter().map(|f| f.node.size).sum::<u64>()
                + local_folder_bytes,
            conflicts: self.conflicts.len(),
            remote_only_folders: self.remote_only_folders.len(),
            local_only_folders: self.local_only_folders.len(),
            type_conflicts: self.type_conflicts.len(),
        }
    }
}

/// 计划统计（包含整体同步的文件夹中的文件）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub download_files: usize,
    pub download_bytes: u64,
    pub upload_files: usize,
    pub upload_bytes: u64,
    pub conflicts: usize,
    pub remote_only_folders: usize,
    pub local_only_folders: usize,
    pub type_conflicts: usize,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "下载 {} 个文件 ({}), 上传 {} 个文件 ({}), 冲突 {}, 仅远程文件夹 {}, 仅本地文件夹 {}, 类型冲突 {}",
            self.download_files,
            crate::core::executor::format_size(self.download_bytes),
            self.upload_files,
            crate::core::executor::format_size(self.upload_bytes),
            self.conflicts,
            self.remote_only_folders,
            self.local_only_folders,
            self.type_conflicts
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn planned(path: &str, size: u64) -> PlannedFile {
        PlannedFile {
            node: FileNode {
                name: crate::core::tree::leaf_name(path).to_string(),
                path: path.to_string(),
                id: None,
                size,
                content_hash: None,
                modified_at: Utc::now(),
                opaque: false,
            },
            source_path: path.to_string(),
            dest_path: None,
            replaces_id: None,
        }
    }

    #[test]
    fn test_merge_and_summary_include_captured_folders() {
        let mut plan = SyncPlan::new();
        assert!(plan.is_empty());

        let mut other = SyncPlan::new();
        other.to_download.push(planned("Docs/a.txt", 10));
        other.local_only_folders.push(PlannedFolder {
            node: FolderNode::new("B", "/l/B", None).with_file(planned("/l/B/y.txt", 5).node),
            source_path: "/l/B".to_string(),
            dest_path: Some("Docs/B".to_string()),
        });
        plan.merge(other);

        let summary = plan.summary();
        assert!(!plan.is_empty());
        assert_eq!(summary.download_files, 1);
        assert_eq!(summary.download_bytes, 10);
        assert_eq!(summary.upload_files, 1);
        assert_eq!(summary.upload_bytes, 5);
        assert_eq!(summary.local_only_folders, 1);
    }
}
