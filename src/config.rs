//! 应用配置模块

use crate::core::path_map::{normalize_local_root, normalize_remote_root};
use crate::core::scanner::ExclusionFilter;
use crate::error::ConfigError;
use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// 一对同步根目录：远程路径 -> 本地路径
///
/// 远程路径为 `"root"` 或 `"/"` 时表示云端顶层目录。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootPair {
    pub remote: String,
    pub local: String,
}

impl RootPair {
    pub fn new(remote: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            local: local.into(),
        }
    }
}

/// 冲突时优先保留的一方
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    #[default]
    #[serde(alias = "drive")]
    Remote,
    Local,
}

impl std::fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictPolicy::Remote => write!(f, "remote"),
            ConflictPolicy::Local => write!(f, "local"),
        }
    }
}

/// 远程存储配置（由 `storage::create_remote` 使用）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RemoteConfig {
    Fs {
        root: String,
    },
    #[serde(rename_all = "camelCase")]
    Webdav {
        endpoint: String,
        username: String,
        password: String,
        #[serde(default)]
        root: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    S3 {
        bucket: String,
        region: String,
        access_key: String,
        secret_key: String,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        prefix: Option<String>,
    },
}

/// 同步配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// 根目录对，按配置顺序
    pub sync_folders: Vec<RootPair>,
    #[serde(default)]
    pub conflict_resolution: ConflictPolicy,
    /// 排除规则（按名称匹配的 glob）
    #[serde(default)]
    pub exclusions: Vec<String>,
    /// 修改时间容差（秒）
    #[serde(default = "default_mtime_tolerance")]
    pub mtime_tolerance_secs: u64,
    /// 最大并发传输数
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_transfers: usize,
    /// 最大重试次数（默认不重试）
    #[serde(default)]
    pub max_retries: u32,
    /// 重试基础延迟（毫秒）
    #[serde(default = "default_retry_delay")]
    pub retry_base_delay_ms: u64,
    /// 非 IO 操作超时（秒）
    #[serde(default = "default_op_timeout")]
    pub op_timeout_secs: u64,
    /// IO 操作超时（秒）
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_mtime_tolerance() -> u64 {
    60
}

fn default_max_concurrent() -> usize {
    4
}

fn default_retry_delay() -> u64 {
    2000
}

fn default_op_timeout() -> u64 {
    crate::storage::OP_TIMEOUT_SECS
}

fn default_io_timeout() -> u64 {
    crate::storage::IO_TIMEOUT_SECS
}

impl SyncConfig {
    /// 使用默认值创建配置
    pub fn new(sync_folders: Vec<RootPair>) -> Self {
        Self {
            sync_folders,
            conflict_resolution: ConflictPolicy::default(),
            exclusions: Vec::new(),
            mtime_tolerance_secs: default_mtime_tolerance(),
            max_concurrent_transfers: default_max_concurrent(),
            max_retries: 0,
            retry_base_delay_ms: default_retry_delay(),
            op_timeout_secs: default_op_timeout(),
            io_timeout_secs: default_io_timeout(),
            remote: None,
            log: LogConfig::default(),
        }
    }

    /// 从配置文件加载并校验
    pub fn load(config_path: &Path) -> Result<Self, ConfigError> {
        tracing::info!("加载配置: {}", config_path.display());

        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path.display().to_string()));
        }

        let content = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
            path: config_path.display().to_string(),
            source,
        })?;

        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// 结构校验，必须在扫描前调用
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync_folders.is_empty() {
            return Err(ConfigError::NoRootPairs);
        }

        let mut remotes = HashSet::new();
        let mut locals = HashSet::new();

        for (index, pair) in self.sync_folders.iter().enumerate() {
            if pair.remote.trim().is_empty() {
                return Err(ConfigError::EmptyRoot {
                    index,
                    side: "remote",
                });
            }
            if pair.local.trim().is_empty() {
                return Err(ConfigError::EmptyRoot {
                    index,
                    side: "local",
                });
            }
            if !remotes.insert(normalize_remote_root(&pair.remote)) {
                return Err(ConfigError::DuplicateRemoteRoot(pair.remote.clone()));
            }
            if !locals.insert(normalize_local_root(&pair.local)) {
                return Err(ConfigError::DuplicateLocalRoot(pair.local.clone()));
            }
        }

        if self.max_concurrent_transfers == 0 {
            return Err(ConfigError::ZeroValue("maxConcurrentTransfers"));
        }
        if self.op_timeout_secs == 0 {
            return Err(ConfigError::ZeroValue("opTimeoutSecs"));
        }
        if self.io_timeout_secs == 0 {
            return Err(ConfigError::ZeroValue("ioTimeoutSecs"));
        }

        ExclusionFilter::new(&self.exclusions)?;

        Ok(())
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}
