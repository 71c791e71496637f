//! 错误类型
//!
//! 单个条目的失败（扫描、路径映射、传输）由调用方记录并计数，不会中断整个运行；
//! 只有 [`ConfigError`] 和取消会终止同步。

use thiserror::Error;

/// 子树无法列出或读取，该子树按空处理
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("cannot list remote folder '{path}': {reason}")]
    RemoteList { path: String, reason: String },

    #[error("cannot read local entry '{path}': {reason}")]
    LocalRead { path: String, reason: String },
}

/// 没有任何已配置的根目录对覆盖该路径
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PathMappingError {
    #[error("remote path '{0}' is not under any configured sync root")]
    RemoteNotMappable(String),

    #[error("local path '{0}' is not under any configured sync root")]
    LocalNotMappable(String),
}

/// 单个条目的存储调用失败
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("download of '{path}' failed: {reason}")]
    Download { path: String, reason: String },

    #[error("upload of '{path}' failed: {reason}")]
    Upload { path: String, reason: String },

    #[error("update of remote copy '{path}' failed: {reason}")]
    Update { path: String, reason: String },

    #[error("cannot create folder '{path}': {reason}")]
    CreateFolder { path: String, reason: String },

    #[error("'{path}' has no remote id")]
    MissingRemoteId { path: String },

    #[error("{operation} on '{path}' timed out after {secs}s")]
    Timeout {
        operation: &'static str,
        path: String,
        secs: u64,
    },
}

/// 配置结构无效（在扫描开始前报告，致命错误）
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(String),

    #[error("cannot read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no sync folders configured")]
    NoRootPairs,

    #[error("sync folder #{index} has an empty {side} root")]
    EmptyRoot { index: usize, side: &'static str },

    #[error("remote root '{0}' is configured more than once")]
    DuplicateRemoteRoot(String),

    #[error("local root '{0}' is configured more than once")]
    DuplicateLocalRoot(String),

    #[error("invalid exclusion pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),

    #[error("remote store setup failed: {0}")]
    Remote(String),

    #[error("phase {phase} requires {required} to run before it")]
    PhaseOrder {
        phase: &'static str,
        required: &'static str,
    },
}

/// 终止整个运行的引擎级错误
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("sync cancelled")]
    Cancelled,

    #[error("scan task aborted: {0}")]
    ScanAborted(String),
}

/// 条目失败原因，记录在运行报告中
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ItemError {
    #[error(transparent)]
    Mapping(#[from] PathMappingError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("worker task failed: {0}")]
    Worker(String),
}
