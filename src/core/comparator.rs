use crate::config::ConflictPolicy;
use crate::core::path_map::PathMapper;
use crate::core::plan::{Conflict, PlannedFile, PlannedFolder, SyncPlan, TypeConflict};
use crate::core::tree::{FileNode, FolderNode, Node, Tree};
use crate::error::SyncError;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 文件比较结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRelation {
    /// 内容相同
    Equal,
    /// 远程更新
    RemoteNewer,
    /// 本地更新（时间相同也算本地更新）
    LocalNewer,
}

/// 比较两棵树并生成同步计划
pub struct DiffEngine {
    policy: ConflictPolicy,
    tolerance_ms: i64,
    cancel: Option<CancellationToken>,
}

impl DiffEngine {
    pub fn new(policy: ConflictPolicy, tolerance: Duration) -> Self {
        Self {
            policy,
            tolerance_ms: tolerance.as_millis().min(i64::MAX as u128) as i64,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// 比较两个文件
    ///
    /// 摘要（同一算法）优先；否则比较大小；大小相同时修改时间差超过容差才算不同。
    pub fn compare_files(&self, remote: &FileNode, local: &FileNode) -> FileRelation {
        let different = match (&remote.content_hash, &local.content_hash) {
            (Some(r), Some(l)) if r.matches(l).is_some() => r.matches(l) == Some(false),
            _ if remote.size != local.size => {
                debug!(
                    "文件大小不同: {} (remote={}, local={})",
                    remote.path, remote.size, local.size
                );
                true
            }
            _ => {
                let diff_ms = (remote.modified_at.timestamp_millis()
                    - local.modified_at.timestamp_millis())
                .abs();
                if diff_ms > self.tolerance_ms {
                    debug!("文件时间不同: {} (diff={}ms)", remote.path, diff_ms);
                }
                diff_ms > self.tolerance_ms
            }
        };

        if !different {
            FileRelation::Equal
        } else if remote.modified_at > local.modified_at {
            FileRelation::RemoteNewer
        } else {
            FileRelation::LocalNewer
        }
    }

    /// 比较一对根目录的远程树和本地树
    pub fn diff(
        &self,
        remote: &Tree,
        local: &Tree,
        mapper: &PathMapper,
    ) -> Result<SyncPlan, SyncError> {
        let mut plan = SyncPlan::new();
        self.compare_folders(&remote.root, &local.root, mapper, &mut plan)?;

        debug!(
            "比较完成: {} -> {}: {}",
            remote.root.path,
            local.root.path,
            plan.summary()
        );
        Ok(plan)
    }

    fn compare_folders(
        &self,
        remote: &FolderNode,
        local: &FolderNode,
        mapper: &PathMapper,
        plan: &mut SyncPlan,
    ) -> Result<(), SyncError> {
        if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Err(SyncError::Cancelled);
        }

        // 同名但类型不同
        let mut clashing = BTreeSet::new();
        for (name, file) in &remote.files {
            if let Some(folder) = local.folders.get(name) {
                warn!("类型冲突: 远程文件 {} / 本地文件夹 {}", file.path, folder.path);
                clashing.insert(name.as_str());
                plan.type_conflicts.push(TypeConflict {
                    remote: Node::File(file.clone()),
                    local: Node::Folder(folder.clone()),
                });
            }
        }
        for (name, folder) in &remote.folders {
            if let Some(file) = local.files.get(name) {
                warn!("类型冲突: 远程文件夹 {} / 本地文件 {}", folder.path, file.path);
                clashing.insert(name.as_str());
                plan.type_conflicts.push(TypeConflict {
                    remote: Node::Folder(folder.clone()),
                    local: Node::File(file.clone()),
                });
            }
        }

        for (name, file) in &remote.files {
            if clashing.contains(name.as_str()) {
                continue;
            }
            match local.files.get(name) {
                None if file.opaque => debug!("跳过云端原生文档: {}", file.path),
                None => plan.to_download.push(self.download_item(file, mapper)),
                Some(_) if file.opaque => debug!("跳过云端原生文档: {}", file.path),
                Some(local_file) => self.resolve_pair(file, local_file, mapper, plan),
            }
        }

        for (name, file) in &local.files {
            if !clashing.contains(name.as_str()) && !remote.files.contains_key(name) {
                plan.to_upload.push(self.upload_item(file, mapper));
            }
        }

        for (name, folder) in &remote.folders {
            if clashing.contains(name.as_str()) {
                continue;
            }
            match local.folders.get(name) {
                Some(local_folder) => self.compare_folders(folder, local_folder, mapper, plan)?,
                None => plan.remote_only_folders.push(PlannedFolder {
                    node: folder.clone(),
                    source_path: folder.path.clone(),
                    dest_path: map_or_warn(mapper.remote_to_local(&folder.path)),
                }),
            }
        }

        for (name, folder) in &local.folders {
            if !clashing.contains(name.as_str()) && !remote.folders.contains_key(name) {
                plan.local_only_folders.push(PlannedFolder {
                    node: folder.clone(),
                    source_path: folder.path.clone(),
                    dest_path: map_or_warn(mapper.local_to_remote(&folder.path)),
                });
            }
        }

        Ok(())
    }

    fn resolve_pair(
        &self,
        remote: &FileNode,
        local: &FileNode,
        mapper: &PathMapper,
        plan: &mut SyncPlan,
    ) {
        match (self.compare_files(remote, local), self.policy) {
            (FileRelation::Equal, _) => {}
            (FileRelation::RemoteNewer, ConflictPolicy::Remote) => {
                plan.to_download.push(self.download_item(remote, mapper))
            }
            (FileRelation::LocalNewer, ConflictPolicy::Local) => plan.to_upload.push(PlannedFile {
                replaces_id: remote.id.clone(),
                ..self.upload_item(local, mapper)
            }),
            (relation, _) => plan.conflicts.push(Conflict {
                remote: remote.clone(),
                local: local.clone(),
                remote_newer: relation == FileRelation::RemoteNewer,
            }),
        }
    }

    fn download_item(&self, file: &FileNode, mapper: &PathMapper) -> PlannedFile {
        PlannedFile {
            node: file.clone(),
            source_path: file.path.clone(),
            dest_path: map_or_warn(mapper.remote_to_local(&file.path)),
            replaces_id: None,
        }
    }

    fn upload_item(&self, file: &FileNode, mapper: &PathMapper) -> PlannedFile {
        PlannedFile {
            node: file.clone(),
            source_path: file.path.clone(),
            dest_path: map_or_warn(mapper.local_to_remote(&file.path)),
            replaces_id: None,
        }
    }
}

fn map_or_warn<E: std::fmt::Display>(result: Result<String, E>) -> Option<String> {
    result.map_err(|e| warn!("{}", e)).ok()
}
