//! 树扫描器
//!
//! 远程扫描通过 `list_children` 递归列出文件夹；本地扫描用 walkdir 遍历目录并流式计算摘要。
//! 无法列出或读取的子树记录警告后按空处理，扫描继续。

use crate::core::path_map::{normalize_local_root, normalize_remote_root};
use crate::core::tree::{leaf_name, ContentHash, FileNode, FolderNode, HashAlgorithm, Tree};
use crate::error::{ConfigError, ScanError, SyncError};
use crate::storage::{RemoteEntry, RemoteStore};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 流式计算摘要的块大小
const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// 按名称匹配的排除规则
///
/// 支持 `*`、`?` 和 `[...]`（`[!...]` 取反），区分大小写。
#[derive(Debug, Clone)]
pub struct ExclusionFilter {
    set: GlobSet,
}

impl Default for ExclusionFilter {
    fn default() -> Self {
        Self {
            set: GlobSet::empty(),
        }
    }
}

impl ExclusionFilter {
    pub fn new(patterns: &[String]) -> Result<Self, ConfigError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern).map_err(|e| ConfigError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.kind().to_string(),
            })?;
            builder.add(glob);
        }

        let set = builder.build().map_err(|e| ConfigError::InvalidPattern {
            pattern: e.glob().unwrap_or_default().to_string(),
            reason: e.kind().to_string(),
        })?;

        Ok(Self { set })
    }

    /// 名称是否匹配任一排除规则
    pub fn is_excluded(&self, name: &str) -> bool {
        self.set.is_match(name)
    }
}

/// 流式计算文件摘要
pub fn hash_file(path: &Path, algorithm: HashAlgorithm) -> io::Result<ContentHash> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];

    let hex = match algorithm {
        HashAlgorithm::Md5 => {
            let mut ctx = md5::Context::new();
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                ctx.consume(&buf[..n]);
            }
            format!("{:x}", ctx.compute())
        }
        HashAlgorithm::Blake3 => {
            let mut hasher = blake3::Hasher::new();
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            hasher.finalize().to_hex().to_string()
        }
    };

    Ok(ContentHash::new(algorithm, hex))
}

/// 远程树扫描器
pub struct RemoteScanner<'a> {
    store: &'a dyn RemoteStore,
    filter: &'a ExclusionFilter,
    cancel: &'a CancellationToken,
    op_timeout: Duration,
}

impl<'a> RemoteScanner<'a> {
    pub fn new(
        store: &'a dyn RemoteStore,
        filter: &'a ExclusionFilter,
        cancel: &'a CancellationToken,
        op_timeout: Duration,
    ) -> Self {
        Self {
            store,
            filter,
            cancel,
            op_timeout,
        }
    }

    /// 扫描远程根目录，根不存在时返回空树
    pub async fn scan(&self, root: &str) -> Result<Tree, SyncError> {
        let root = normalize_remote_root(root);
        info!("扫描远程目录: {}:{}", self.store.name(), display_root(&root));

        let resolved =
            tokio::time::timeout(self.op_timeout, self.store.resolve_path_to_id(&root)).await;

        let root_id = match resolved {
            Ok(Ok(Some(id))) => id,
            Ok(Ok(None)) => {
                info!("远程根目录不存在，按空树处理: {}", display_root(&root));
                return Ok(Tree::empty(&root, None));
            }
            Ok(Err(e)) => {
                warn!("{}", ScanError::RemoteList {
                    path: display_root(&root).to_string(),
                    reason: e.to_string(),
                });
                return Ok(Tree::empty(&root, None));
            }
            Err(_) => {
                warn!("{}", ScanError::RemoteList {
                    path: display_root(&root).to_string(),
                    reason: format!("timed out after {}s", self.op_timeout.as_secs()),
                });
                return Ok(Tree::empty(&root, None));
            }
        };

        let folder = self
            .scan_folder(root_id, root.clone(), leaf_name(&root).to_string())
            .await?;
        let tree = Tree::new(folder);

        info!(
            "远程扫描完成: {} 个文件, {} 个文件夹",
            tree.file_count(),
            tree.folder_count()
        );
        Ok(tree)
    }

    fn scan_folder(
        &self,
        id: String,
        path: String,
        name: String,
    ) -> BoxFuture<'_, Result<FolderNode, SyncError>> {
        Box::pin(async move {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let mut folder = FolderNode::new(name, path, Some(id.clone()));

            let children = match tokio::time::timeout(self.op_timeout, self.store.list_children(&id)).await {
                Ok(Ok(children)) => children,
                Ok(Err(e)) => {
                    warn!("{}", ScanError::RemoteList {
                        path: display_root(&folder.path).to_string(),
                        reason: e.to_string(),
                    });
                    return Ok(folder);
                }
                Err(_) => {
                    warn!("{}", ScanError::RemoteList {
                        path: display_root(&folder.path).to_string(),
                        reason: format!("timed out after {}s", self.op_timeout.as_secs()),
                    });
                    return Ok(folder);
                }
            };

            for entry in children {
                if self.filter.is_excluded(&entry.name) {
                    debug!("排除: {}", folder.child_path(&entry.name));
                    continue;
                }

                let child_path = folder.child_path(&entry.name);

                if entry.is_folder() {
                    if folder.folders.contains_key(&entry.name) {
                        warn!("重复的远程文件夹名，忽略: {}", child_path);
                        continue;
                    }
                    let child = self
                        .scan_folder(entry.id.clone(), child_path, entry.name.clone())
                        .await?;
                    folder.folders.insert(entry.name.clone(), child);
                } else {
                    if folder.files.contains_key(&entry.name) {
                        warn!("重复的远程文件名，忽略: {}", child_path);
                        continue;
                    }
                    let file = self.file_node(entry, child_path);
                    folder.files.insert(file.name.clone(), file);
                }
            }

            Ok(folder)
        })
    }

    fn file_node(&self, entry: RemoteEntry, path: String) -> FileNode {
        let opaque = entry.is_opaque();
        let content_hash = match (self.store.checksum_algorithm(), entry.checksum) {
            (Some(algorithm), Some(hex)) if !opaque => Some(ContentHash::new(algorithm, hex)),
            _ => None,
        };

        FileNode {
            name: entry.name,
            path,
            id: Some(entry.id),
            size: entry.size,
            content_hash,
            modified_at: entry.modified_at,
            opaque,
        }
    }
}

fn display_root(path: &str) -> &str {
    if path.is_empty() {
        "/"
    } else {
        path
    }
}

/// 本地树扫描器
#[derive(Clone)]
pub struct LocalScanner {
    filter: ExclusionFilter,
    algorithm: Option<HashAlgorithm>,
    cancel: CancellationToken,
}

impl LocalScanner {
    /// `algorithm` 为 None 时不计算摘要
    pub fn new(
        filter: ExclusionFilter,
        algorithm: Option<HashAlgorithm>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            filter,
            algorithm,
            cancel,
        }
    }

    /// 扫描本地根目录，根不存在时返回空树
    pub async fn scan(&self, root: &str) -> Result<Tree, SyncError> {
        let root = normalize_local_root(root);
        info!("扫描本地目录: {}", root);

        let scanner = self.clone();
        let walk_root = root.clone();

        // 使用 spawn_blocking 避免阻塞 async runtime
        let tree = tokio::task::spawn_blocking(move || scanner.scan_blocking(&walk_root))
            .await
            .map_err(|e| SyncError::ScanAborted(e.to_string()))??;

        info!(
            "本地扫描完成: {} 个文件, {} 个文件夹",
            tree.file_count(),
            tree.folder_count()
        );
        Ok(tree)
    }

    fn scan_blocking(&self, root: &str) -> Result<Tree, SyncError> {
        let root_path = PathBuf::from(root);

        match std::fs::metadata(&root_path) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                warn!("{}", ScanError::LocalRead {
                    path: root.to_string(),
                    reason: "not a directory".to_string(),
                });
                return Ok(Tree::empty(root, None));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("本地根目录不存在，按空树处理: {}", root);
                return Ok(Tree::empty(root, None));
            }
            Err(e) => {
                warn!("{}", ScanError::LocalRead {
                    path: root.to_string(),
                    reason: e.to_string(),
                });
                return Ok(Tree::empty(root, None));
            }
        }

        let mut tree_root = FolderNode::new(leaf_name(root), root, None);

        let walker = WalkDir::new(&root_path)
            .follow_links(false)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0 || !self.filter.is_excluded(&e.file_name().to_string_lossy())
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e
                        .path()
                        .map(|p| p.to_string_lossy().replace('\\', "/"))
                        .unwrap_or_else(|| root.to_string());
                    warn!("{}", ScanError::LocalRead {
                        path,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let Some(components) = relative_components(&root_path, entry.path()) else {
                continue;
            };
            let Some((name, parents)) = components.split_last() else {
                continue;
            };
            let Some(parent) = folder_mut(&mut tree_root, parents) else {
                // 父目录读取失败已被跳过
                continue;
            };

            let file_type = entry.file_type();
            if file_type.is_dir() {
                if self.cancel.is_cancelled() {
                    return Err(SyncError::Cancelled);
                }
                let path = parent.child_path(name);
                parent
                    .folders
                    .insert(name.clone(), FolderNode::new(name.clone(), path, None));
            } else if file_type.is_file() {
                let path = parent.child_path(name);
                match self.file_node(entry.path(), name, &path) {
                    Ok(file) => {
                        parent.files.insert(name.clone(), file);
                    }
                    Err(e) => warn!("{}", ScanError::LocalRead {
                        path,
                        reason: e.to_string(),
                    }),
                }
            } else {
                debug!("跳过非常规文件: {}", entry.path().display());
            }
        }

        Ok(Tree::new(tree_root))
    }

    fn file_node(&self, fs_path: &Path, name: &str, path: &str) -> io::Result<FileNode> {
        let meta = std::fs::metadata(fs_path)?;
        let modified_at: DateTime<Utc> = meta.modified().map(Into::into).unwrap_or_default();

        let content_hash = self.algorithm.and_then(|algorithm| {
            hash_file(fs_path, algorithm)
                .map_err(|e| warn!("计算摘要失败 {}: {}", path, e))
                .ok()
        });

        Ok(FileNode {
            name: name.to_string(),
            path: path.to_string(),
            id: None,
            size: meta.len(),
            content_hash,
            modified_at,
            opaque: false,
        })
    }
}

fn relative_components(root: &Path, path: &Path) -> Option<Vec<String>> {
    let rel = path.strip_prefix(root).ok()?;
    Some(
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect(),
    )
}

fn folder_mut<'a>(root: &'a mut FolderNode, parents: &[String]) -> Option<&'a mut FolderNode> {
    let mut current = root;
    for name in parents {
        current = current.folders.get_mut(name)?;
    }
    Some(current)
}
