pub mod local;
pub mod memory;
pub mod operator;

use crate::config::RemoteConfig;
use crate::core::tree::HashAlgorithm;
use crate::error::ConfigError;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

pub use local::LocalStore;
pub use memory::MemoryRemote;
pub use operator::OperatorRemote;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- list, stat, create 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- download, upload 等
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 文件夹的 MIME 类型
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// 没有二进制内容的云端原生文档类型
const OPAQUE_MIME_TYPES: &[&str] = &[
    "application/vnd.google-apps.document",
    "application/vnd.google-apps.spreadsheet",
    "application/vnd.google-apps.presentation",
    "application/vnd.google-apps.drawing",
    "application/vnd.google-apps.form",
    "application/vnd.google-apps.script",
];

/// 是否为云端原生文档
pub fn is_opaque_document(mime_type: Option<&str>) -> bool {
    mime_type.is_some_and(|m| OPAQUE_MIME_TYPES.contains(&m))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Folder,
}

/// 远程条目信息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub id: String,
    pub name: String,
    pub kind: EntryKind,
    pub mime_type: Option<String>,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    /// 存储提供的内容校验和（十六进制）
    pub checksum: Option<String>,
}

impl RemoteEntry {
    pub fn is_folder(&self) -> bool {
        self.kind == EntryKind::Folder
    }

    pub fn is_opaque(&self) -> bool {
        !self.is_folder() && is_opaque_document(self.mime_type.as_deref())
    }
}

/// 远程存储接口，条目通过不透明 ID 寻址
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// 列出文件夹的直接子条目
    async fn list_children(&self, folder_id: &str) -> Result<Vec<RemoteEntry>>;

    /// 获取条目元数据
    async fn get_metadata(&self, id: &str) -> Result<RemoteEntry>;

    /// 下载文件内容到本地路径
    async fn download(&self, id: &str, dest_path: &Path) -> Result<()>;

    /// 在父文件夹下新建文件
    async fn upload(&self, local_path: &Path, parent_id: &str, name: &str) -> Result<RemoteEntry>;

    /// 原地更新已有文件的内容（保持 ID 不变）
    async fn update_content(&self, id: &str, local_path: &Path) -> Result<RemoteEntry>;

    /// 创建文件夹
    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<RemoteEntry>;

    /// 将规范路径解析为 ID，空串表示顶层；不存在返回 None
    async fn resolve_path_to_id(&self, path: &str) -> Result<Option<String>>;

    /// 删除条目
    async fn delete_by_id(&self, id: &str) -> Result<()>;

    /// 存储提供的校验和算法，None 表示不提供
    fn checksum_algorithm(&self) -> Option<HashAlgorithm> {
        Some(HashAlgorithm::Md5)
    }

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 根据配置创建远程存储实例
pub async fn create_remote(config: &RemoteConfig) -> Result<Arc<dyn RemoteStore>, ConfigError> {
    let remote = match config {
        RemoteConfig::Fs { root } => {
            tracing::info!("初始化本地目录作为远程存储: {}", root);
            OperatorRemote::fs(root)
        }
        RemoteConfig::Webdav {
            endpoint,
            username,
            password,
            root,
        } => {
            tracing::info!("创建WebDAV存储: endpoint={}, root={:?}", endpoint, root);
            OperatorRemote::webdav(endpoint, username, password, root.clone()).await
        }
        RemoteConfig::S3 {
            bucket,
            region,
            access_key,
            secret_key,
            endpoint,
            prefix,
        } => {
            tracing::info!("初始化S3存储: bucket={}, region={}", bucket, region);
            OperatorRemote::s3(
                bucket,
                region,
                access_key,
                secret_key,
                endpoint.clone(),
                prefix.clone(),
            )
        }
    };

    remote
        .map(|r| Arc::new(r) as Arc<dyn RemoteStore>)
        .map_err(|e| ConfigError::Remote(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opaque_detection() {
        assert!(is_opaque_document(Some("application/vnd.google-apps.document")));
        assert!(!is_opaque_document(Some(FOLDER_MIME_TYPE)));
        assert!(!is_opaque_document(Some("text/plain")));
        assert!(!is_opaque_document(None));
    }
}
