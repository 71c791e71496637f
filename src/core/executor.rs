//! 计划执行器
//!
//! 执行按阶段进行，每个阶段声明它依赖的前置阶段，流水线在构造时校验。
//! 单个条目的失败只记录在报告中，不会中断后续条目；传输在有界的工作池中并发执行。

use crate::config::ConflictPolicy;
use crate::core::engine::SyncContext;
use crate::core::plan::{PlannedFile, PlannedFolder, SyncPlan};
use crate::core::tree::{join_path, leaf_name, parent_path, FileNode};
use crate::error::{ConfigError, ItemError, PathMappingError, TransferError};
use crate::storage::{LocalStore, RemoteStore};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// 同步方向
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    /// 远程 -> 本地
    #[default]
    Down,
    /// 本地 -> 远程
    Up,
    /// 先下载再上传
    Both,
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "down" => Ok(Direction::Down),
            "up" => Ok(Direction::Up),
            "both" => Ok(Direction::Both),
            other => Err(format!(
                "unknown direction '{}', expected down, up or both",
                other
            )),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Down => write!(f, "down"),
            Direction::Up => write!(f, "up"),
            Direction::Both => write!(f, "both"),
        }
    }
}

/// 执行阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    CreateLocalFolders,
    Download,
    ResolveConflictsLocally,
    CreateRemoteFolders,
    Upload,
    ResolveConflictsRemotely,
}

impl Phase {
    /// 必须先于本阶段运行的阶段
    pub fn requires(self) -> &'static [Phase] {
        match self {
            Phase::CreateLocalFolders | Phase::CreateRemoteFolders => &[],
            Phase::Download | Phase::ResolveConflictsLocally => &[Phase::CreateLocalFolders],
            Phase::Upload | Phase::ResolveConflictsRemotely => &[Phase::CreateRemoteFolders],
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::CreateLocalFolders => "create-local-folders",
            Phase::Download => "download",
            Phase::ResolveConflictsLocally => "resolve-conflicts-locally",
            Phase::CreateRemoteFolders => "create-remote-folders",
            Phase::Upload => "upload",
            Phase::ResolveConflictsRemotely => "resolve-conflicts-remotely",
        }
    }
}

const DOWN_PHASES: [Phase; 3] = [
    Phase::CreateLocalFolders,
    Phase::Download,
    Phase::ResolveConflictsLocally,
];

const UP_PHASES: [Phase; 3] = [
    Phase::CreateRemoteFolders,
    Phase::Upload,
    Phase::ResolveConflictsRemotely,
];

/// 已校验的阶段序列
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    phases: Vec<Phase>,
}

impl Pipeline {
    /// 校验每个阶段的前置阶段都已出现在它之前
    pub fn new(phases: Vec<Phase>) -> Result<Self, ConfigError> {
        for (index, phase) in phases.iter().enumerate() {
            for required in phase.requires() {
                if !phases[..index].contains(required) {
                    return Err(ConfigError::PhaseOrder {
                        phase: phase.name(),
                        required: required.name(),
                    });
                }
            }
        }
        Ok(Self { phases })
    }

    pub fn for_direction(direction: Direction) -> Result<Self, ConfigError> {
        let phases = match direction {
            Direction::Down => DOWN_PHASES.to_vec(),
            Direction::Up => UP_PHASES.to_vec(),
            Direction::Both => DOWN_PHASES.iter().chain(UP_PHASES.iter()).copied().collect(),
        };
        Self::new(phases)
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }
}

/// 条目动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemAction {
    CreateLocalFolder,
    CreateRemoteFolder,
    Download,
    Upload,
    UpdateRemote,
}

impl fmt::Display for ItemAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemAction::CreateLocalFolder => "create-local-folder",
            ItemAction::CreateRemoteFolder => "create-remote-folder",
            ItemAction::Download => "download",
            ItemAction::Upload => "upload",
            ItemAction::UpdateRemote => "update-remote",
        };
        write!(f, "{}", name)
    }
}

/// 单个条目的执行结果
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Done { bytes: u64 },
    Skipped(String),
    Failed(ItemError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemReport {
    pub action: ItemAction,
    /// 源端规范路径
    pub path: String,
    pub outcome: ItemOutcome,
}

/// 一次执行的统计
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub run_id: String,
    pub direction: Direction,
    pub dry_run: bool,
    pub downloaded_files: u64,
    pub downloaded_bytes: u64,
    pub uploaded_files: u64,
    pub uploaded_bytes: u64,
    pub created_local_folders: u64,
    pub created_remote_folders: u64,
    pub conflicts: usize,
    pub type_conflicts: usize,
    pub errors: u64,
    pub skipped: u64,
    /// 前置阶段未完成而被跳过的阶段
    pub skipped_phases: Vec<Phase>,
    pub elapsed: Duration,
    pub items: Vec<ItemReport>,
}

impl SyncStats {
    pub fn is_success(&self) -> bool {
        self.errors == 0
    }

    pub fn failed_items(&self) -> impl Iterator<Item = &ItemReport> {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, ItemOutcome::Failed(_)))
    }
}

impl fmt::Display for SyncStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}下载 {} 个文件 ({}), 上传 {} 个文件 ({}), 新建本地文件夹 {}, 新建远程文件夹 {}, 冲突 {}, 类型冲突 {}, 错误 {}, 跳过 {}, 耗时 {:.1}s",
            if self.dry_run { "[dry-run] " } else { "" },
            self.downloaded_files,
            format_size(self.downloaded_bytes),
            self.uploaded_files,
            format_size(self.uploaded_bytes),
            self.created_local_folders,
            self.created_remote_folders,
            self.conflicts,
            self.type_conflicts,
            self.errors,
            self.skipped,
            self.elapsed.as_secs_f64()
        )
    }
}

/// 格式化字节数
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}

/// dry-run 中尚未创建的远程文件夹的占位 ID 前缀
const DRY_RUN_ID_PREFIX: &str = "dry-run:";

/// 执行统计（原子计数，供工作任务并发更新）
#[derive(Default)]
struct Counters {
    downloaded_files: AtomicU64,
    downloaded_bytes: AtomicU64,
    uploaded_files: AtomicU64,
    uploaded_bytes: AtomicU64,
    created_local_folders: AtomicU64,
    created_remote_folders: AtomicU64,
    errors: AtomicU64,
    skipped: AtomicU64,
}

/// 一个待执行的传输
struct TransferJob {
    action: ItemAction,
    source_path: String,
    dest: Result<String, PathMappingError>,
    remote_id: Option<String>,
    size: u64,
    modified_at: DateTime<Utc>,
}

impl TransferJob {
    fn download(file: &FileNode, dest: Result<String, PathMappingError>) -> Self {
        Self {
            action: ItemAction::Download,
            source_path: file.path.clone(),
            dest,
            remote_id: file.id.clone(),
            size: file.size,
            modified_at: file.modified_at,
        }
    }

    fn upload(file: &FileNode, dest: Result<String, PathMappingError>) -> Self {
        Self {
            action: ItemAction::Upload,
            source_path: file.path.clone(),
            dest,
            remote_id: None,
            size: file.size,
            modified_at: file.modified_at,
        }
    }

    fn update_remote(file: &FileNode, remote_path: String, remote_id: Option<String>) -> Self {
        Self {
            action: ItemAction::UpdateRemote,
            source_path: file.path.clone(),
            dest: Ok(remote_path),
            remote_id,
            size: file.size,
            modified_at: file.modified_at,
        }
    }
}

/// 计划执行器
pub struct PlanExecutor {
    ctx: SyncContext,
    remote: Arc<dyn RemoteStore>,
}

impl PlanExecutor {
    pub fn new(ctx: SyncContext, remote: Arc<dyn RemoteStore>) -> Self {
        Self { ctx, remote }
    }

    /// 按方向执行计划；dry-run 不产生任何副作用，只统计将要执行的操作
    pub async fn execute(&self, plan: &SyncPlan, direction: Direction, dry_run: bool) -> SyncStats {
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!(
            parent: &self.ctx.span,
            "execute",
            run_id = %run_id,
            direction = %direction,
            dry_run
        );

        let run = Arc::new(Run {
            remote: self.remote.clone(),
            ctx: self.ctx.clone(),
            dry_run,
            counters: Counters::default(),
            reports: parking_lot::Mutex::new(Vec::new()),
            folder_cache: Mutex::new(HashMap::new()),
        });

        async move {
            let start = Instant::now();
            info!("开始执行: {}", plan.summary());

            let phases = match Pipeline::for_direction(direction) {
                Ok(pipeline) => pipeline.phases,
                Err(e) => {
                    error!("执行流水线无效: {}", e);
                    run.counters.errors.fetch_add(1, Ordering::Relaxed);
                    Vec::new()
                }
            };

            let mut completed: HashSet<Phase> = HashSet::new();
            let mut skipped_phases = Vec::new();

            for phase in phases {
                if let Some(missing) = phase.requires().iter().find(|r| !completed.contains(*r)) {
                    warn!("跳过阶段 {}: 前置阶段 {} 未完成", phase.name(), missing.name());
                    run.skip_phase(phase, plan, &format!("{} did not complete", missing.name()));
                    skipped_phases.push(phase);
                    continue;
                }

                let before = run.reports.lock().len();
                run.run_phase(phase, plan).await;
                let after = run.reports.lock().len();

                // 被取消的阶段不算完成
                if run.cancelled() {
                    warn!("阶段 {} 被取消: {} 个条目", phase.name(), after - before);
                } else {
                    completed.insert(phase);
                    info!("阶段 {} 完成: {} 个条目", phase.name(), after - before);
                }
            }

            let counters = &run.counters;
            let stats = SyncStats {
                run_id,
                direction,
                dry_run,
                downloaded_files: counters.downloaded_files.load(Ordering::Relaxed),
                downloaded_bytes: counters.downloaded_bytes.load(Ordering::Relaxed),
                uploaded_files: counters.uploaded_files.load(Ordering::Relaxed),
                uploaded_bytes: counters.uploaded_bytes.load(Ordering::Relaxed),
                created_local_folders: counters.created_local_folders.load(Ordering::Relaxed),
                created_remote_folders: counters.created_remote_folders.load(Ordering::Relaxed),
                conflicts: plan.conflicts.len(),
                type_conflicts: plan.type_conflicts.len(),
                errors: counters.errors.load(Ordering::Relaxed),
                skipped: counters.skipped.load(Ordering::Relaxed),
                skipped_phases,
                elapsed: start.elapsed(),
                items: std::mem::take(&mut *run.reports.lock()),
            };

            if stats.is_success() {
                info!("执行完成: {}", stats);
            } else {
                warn!("执行完成（有错误）: {}", stats);
            }
            stats
        }
        .instrument(span)
        .await
    }
}

/// 单次执行的共享状态
struct Run {
    remote: Arc<dyn RemoteStore>,
    ctx: SyncContext,
    dry_run: bool,
    counters: Counters,
    reports: parking_lot::Mutex<Vec<ItemReport>>,
    /// 远程路径 -> 文件夹 ID
    folder_cache: Mutex<HashMap<String, String>>,
}

impl Run {
    fn policy(&self) -> ConflictPolicy {
        self.ctx.config.conflict_resolution
    }

    fn record(&self, action: ItemAction, path: &str, outcome: ItemOutcome) {
        let c = &self.counters;
        match &outcome {
            ItemOutcome::Done { bytes } => {
                match action {
                    ItemAction::Download => {
                        c.downloaded_files.fetch_add(1, Ordering::Relaxed);
                        c.downloaded_bytes.fetch_add(*bytes, Ordering::Relaxed);
                    }
                    ItemAction::Upload | ItemAction::UpdateRemote => {
                        c.uploaded_files.fetch_add(1, Ordering::Relaxed);
                        c.uploaded_bytes.fetch_add(*bytes, Ordering::Relaxed);
                    }
                    ItemAction::CreateLocalFolder => {
                        c.created_local_folders.fetch_add(1, Ordering::Relaxed);
                    }
                    ItemAction::CreateRemoteFolder => {
                        c.created_remote_folders.fetch_add(1, Ordering::Relaxed);
                    }
                }
                debug!("{} 完成: {} ({})", action, path, format_size(*bytes));
            }
            ItemOutcome::Skipped(reason) => {
                c.skipped.fetch_add(1, Ordering::Relaxed);
                debug!("{} 跳过: {} ({})", action, path, reason);
            }
            ItemOutcome::Failed(e) => {
                c.errors.fetch_add(1, Ordering::Relaxed);
                error!("{} 失败: {}: {}", action, path, e);
            }
        }

        self.reports.lock().push(ItemReport {
            action,
            path: path.to_string(),
            outcome,
        });
    }

    fn cancelled(&self) -> bool {
        self.ctx.cancel.is_cancelled()
    }

    async fn run_phase(self: &Arc<Self>, phase: Phase, plan: &SyncPlan) {
        match phase {
            Phase::CreateLocalFolders => {
                for folder in &plan.remote_only_folders {
                    self.create_local_folders(folder).await;
                }
            }
            Phase::CreateRemoteFolders => {
                for folder in &plan.local_only_folders {
                    self.create_remote_folders(folder).await;
                }
            }
            Phase::Download => {
                let mut jobs: Vec<_> = plan
                    .to_download
                    .iter()
                    .map(|f| {
                        let dest = planned_dest(f.dest_path.as_ref(), || {
                            PathMappingError::RemoteNotMappable(f.source_path.clone())
                        });
                        TransferJob::download(&f.node, dest)
                    })
                    .collect();
                jobs.extend(self.folder_jobs(&plan.remote_only_folders, ItemAction::Download));
                self.run_transfers(jobs).await;
            }
            Phase::Upload => {
                let mut jobs: Vec<_> = plan.to_upload.iter().map(|f| self.upload_job(f)).collect();
                jobs.extend(self.folder_jobs(&plan.local_only_folders, ItemAction::Upload));
                self.run_transfers(jobs).await;
            }
            Phase::ResolveConflictsLocally => {
                if plan.conflicts.is_empty() || self.policy() != ConflictPolicy::Remote {
                    return;
                }
                info!("按远程优先解决 {} 个冲突", plan.conflicts.len());
                let jobs = plan
                    .conflicts
                    .iter()
                    .map(|c| TransferJob::download(&c.remote, Ok(c.local.path.clone())))
                    .collect();
                self.run_transfers(jobs).await;
            }
            Phase::ResolveConflictsRemotely => {
                if plan.conflicts.is_empty() || self.policy() != ConflictPolicy::Local {
                    return;
                }
                info!("按本地优先解决 {} 个冲突", plan.conflicts.len());
                let jobs = plan
                    .conflicts
                    .iter()
                    .map(|c| {
                        TransferJob::update_remote(&c.local, c.remote.path.clone(), c.remote.id.clone())
                    })
                    .collect();
                self.run_transfers(jobs).await;
            }
        }
    }

    /// 把阶段内的所有条目记为跳过
    fn skip_phase(&self, phase: Phase, plan: &SyncPlan, reason: &str) {
        let transferable = |folders: &[PlannedFolder]| -> Vec<String> {
            folders
                .iter()
                .flat_map(|f| f.node.walk_files())
                .filter(|(_, file)| !file.opaque)
                .map(|(_, file)| file.path.clone())
                .collect()
        };

        let (action, paths): (ItemAction, Vec<String>) = match phase {
            Phase::CreateLocalFolders => (
                ItemAction::CreateLocalFolder,
                plan.remote_only_folders.iter().map(|f| f.source_path.clone()).collect(),
            ),
            Phase::CreateRemoteFolders => (
                ItemAction::CreateRemoteFolder,
                plan.local_only_folders.iter().map(|f| f.source_path.clone()).collect(),
            ),
            Phase::Download => (
                ItemAction::Download,
                plan.to_download
                    .iter()
                    .map(|f| f.source_path.clone())
                    .chain(transferable(&plan.remote_only_folders))
                    .collect(),
            ),
            Phase::Upload => (
                ItemAction::Upload,
                plan.to_upload
                    .iter()
                    .map(|f| f.source_path.clone())
                    .chain(transferable(&plan.local_only_folders))
                    .collect(),
            ),
            Phase::ResolveConflictsLocally if self.policy() == ConflictPolicy::Remote => (
                ItemAction::Download,
                plan.conflicts.iter().map(|c| c.remote.path.clone()).collect(),
            ),
            Phase::ResolveConflictsRemotely if self.policy() == ConflictPolicy::Local => (
                ItemAction::UpdateRemote,
                plan.conflicts.iter().map(|c| c.local.path.clone()).collect(),
            ),
            Phase::ResolveConflictsLocally | Phase::ResolveConflictsRemotely => return,
        };

        for path in paths {
            self.record(action, &path, ItemOutcome::Skipped(reason.to_string()));
        }
    }

    fn upload_job(&self, file: &PlannedFile) -> TransferJob {
        let dest = planned_dest(file.dest_path.as_ref(), || {
            PathMappingError::LocalNotMappable(file.source_path.clone())
        });
        match (&file.replaces_id, dest) {
            (Some(id), Ok(dest)) => TransferJob::update_remote(&file.node, dest, Some(id.clone())),
            (_, dest) => TransferJob::upload(&file.node, dest),
        }
    }

    /// 展开整体同步的文件夹中的文件
    fn folder_jobs(&self, folders: &[PlannedFolder], action: ItemAction) -> Vec<TransferJob> {
        let mut jobs = Vec::new();

        for folder in folders {
            for (rel, file) in folder.node.walk_files() {
                if file.opaque {
                    self.record(action, &file.path, ItemOutcome::Skipped("opaque document".into()));
                    continue;
                }

                let dest = match &folder.dest_path {
                    Some(d) => Ok(join_path(d, &rel)),
                    None if action == ItemAction::Download => {
                        Err(PathMappingError::RemoteNotMappable(file.path.clone()))
                    }
                    None => Err(PathMappingError::LocalNotMappable(file.path.clone())),
                };

                jobs.push(if action == ItemAction::Download {
                    TransferJob::download(file, dest)
                } else {
                    TransferJob::upload(file, dest)
                });
            }
        }

        jobs
    }

    fn folder_targets(folder: &PlannedFolder, dest: &str) -> Vec<String> {
        std::iter::once(dest.to_string())
            .chain(
                folder
                    .node
                    .walk_folders()
                    .into_iter()
                    .map(|(rel, _)| join_path(dest, &rel)),
            )
            .collect()
    }

    async fn create_local_folders(&self, folder: &PlannedFolder) {
        let action = ItemAction::CreateLocalFolder;
        let dest = match planned_dest(folder.dest_path.as_ref(), || {
            PathMappingError::RemoteNotMappable(folder.source_path.clone())
        }) {
            Ok(dest) => dest,
            Err(e) => return self.record(action, &folder.source_path, ItemOutcome::Failed(e.into())),
        };

        for target in Self::folder_targets(folder, &dest) {
            if self.cancelled() {
                self.record(action, &target, ItemOutcome::Skipped("cancelled".into()));
                continue;
            }
            if self.dry_run {
                let exists = tokio::fs::metadata(LocalStore::fs_path(&target))
                    .await
                    .is_ok_and(|m| m.is_dir());
                if !exists {
                    self.record(action, &target, ItemOutcome::Done { bytes: 0 });
                }
                continue;
            }

            match LocalStore::create_folder(&LocalStore::fs_path(&target)).await {
                Ok(true) => self.record(action, &target, ItemOutcome::Done { bytes: 0 }),
                Ok(false) => debug!("本地文件夹已存在: {}", target),
                Err(e) => self.record(
                    action,
                    &target,
                    ItemOutcome::Failed(
                        TransferError::CreateFolder {
                            path: target.clone(),
                            reason: e.to_string(),
                        }
                        .into(),
                    ),
                ),
            }
        }
    }

    async fn create_remote_folders(&self, folder: &PlannedFolder) {
        let action = ItemAction::CreateRemoteFolder;
        let dest = match planned_dest(folder.dest_path.as_ref(), || {
            PathMappingError::LocalNotMappable(folder.source_path.clone())
        }) {
            Ok(dest) => dest,
            Err(e) => return self.record(action, &folder.source_path, ItemOutcome::Failed(e.into())),
        };

        for target in Self::folder_targets(folder, &dest) {
            if self.cancelled() {
                self.record(action, &target, ItemOutcome::Skipped("cancelled".into()));
                continue;
            }
            if let Err(e) = self.ensure_remote_folder(&target).await {
                self.record(action, &target, ItemOutcome::Failed(e.into()));
            }
        }
    }

    /// 确保远程文件夹存在，返回其 ID
    ///
    /// 逐级解析路径，缺失的层级依次创建；同一路径在一次执行中只创建一次。
    /// dry-run 只解析并记录将要创建的层级，缓存中放入占位 ID。
    async fn ensure_remote_folder(&self, path: &str) -> Result<String, TransferError> {
        let mut cache = self.folder_cache.lock().await;
        if let Some(id) = cache.get(path) {
            return Ok(id.clone());
        }

        let mut current = String::new();
        let mut parent_id = match cache.get("") {
            Some(id) => id.clone(),
            None => {
                let id = self
                    .timed(self.ctx.config.op_timeout(), "resolve", "", self.remote.resolve_path_to_id(""))
                    .await?
                    .map_err(|e| create_folder_error("/", e))?
                    .ok_or_else(|| TransferError::MissingRemoteId {
                        path: "/".to_string(),
                    })?;
                cache.insert(String::new(), id.clone());
                id
            }
        };

        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = join_path(&current, part);
            if let Some(id) = cache.get(&current) {
                parent_id = id.clone();
                continue;
            }

            // 父级尚未创建时，子级必然不存在
            let existing = if parent_id.starts_with(DRY_RUN_ID_PREFIX) {
                None
            } else {
                self.timed(
                    self.ctx.config.op_timeout(),
                    "resolve",
                    &current,
                    self.remote.resolve_path_to_id(&current),
                )
                .await?
                .map_err(|e| create_folder_error(&current, e))?
            };

            let id = match existing {
                Some(id) => id,
                None if self.dry_run => {
                    self.record(
                        ItemAction::CreateRemoteFolder,
                        &current,
                        ItemOutcome::Done { bytes: 0 },
                    );
                    format!("{}{}", DRY_RUN_ID_PREFIX, current)
                }
                None => {
                    let created = self
                        .timed(
                            self.ctx.config.op_timeout(),
                            "create folder",
                            &current,
                            self.remote.create_folder(part, &parent_id),
                        )
                        .await?
                        .map_err(|e| create_folder_error(&current, e))?;
                    self.record(
                        ItemAction::CreateRemoteFolder,
                        &current,
                        ItemOutcome::Done { bytes: 0 },
                    );
                    created.id
                }
            };

            cache.insert(current.clone(), id.clone());
            parent_id = id;
        }

        Ok(parent_id)
    }

    async fn run_transfers(self: &Arc<Self>, jobs: Vec<TransferJob>) {
        if jobs.is_empty() {
            return;
        }

        let semaphore = Arc::new(Semaphore::new(self.ctx.config.max_concurrent_transfers));
        let mut handles = Vec::new();

        for job in jobs {
            if self.cancelled() {
                self.record(job.action, &job.source_path, ItemOutcome::Skipped("cancelled".into()));
                continue;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    self.record(
                        job.action,
                        &job.source_path,
                        ItemOutcome::Failed(ItemError::Worker(e.to_string())),
                    );
                    continue;
                }
            };

            let run = self.clone();
            let action = job.action;
            let path = job.source_path.clone();
            let handle = tokio::spawn(
                async move {
                    let _permit = permit;
                    let outcome = run.execute_job(&job).await;
                    run.record(job.action, &job.source_path, outcome);
                }
                .in_current_span(),
            );
            handles.push((action, path, handle));
        }

        for (action, path, handle) in handles {
            if let Err(e) = handle.await {
                self.record(action, &path, ItemOutcome::Failed(ItemError::Worker(e.to_string())));
            }
        }
    }

    async fn execute_job(&self, job: &TransferJob) -> ItemOutcome {
        let dest = match &job.dest {
            Ok(dest) => dest.clone(),
            Err(e) => return ItemOutcome::Failed(e.clone().into()),
        };

        if self.cancelled() {
            return ItemOutcome::Skipped("cancelled".into());
        }
        if self.dry_run {
            if job.action == ItemAction::Upload {
                if let Err(e) = self.ensure_remote_folder(parent_path(&dest)).await {
                    return ItemOutcome::Failed(e.into());
                }
            }
            return ItemOutcome::Done { bytes: job.size };
        }

        match self.with_retry(&job.source_path, || self.transfer(job, &dest)).await {
            Ok(bytes) => ItemOutcome::Done { bytes },
            Err(e) => ItemOutcome::Failed(e.into()),
        }
    }

    async fn with_retry<F, Fut>(&self, path: &str, mut op: F) -> Result<u64, TransferError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<u64, TransferError>>,
    {
        let max_retries = self.ctx.config.max_retries;
        let base_delay_ms = self.ctx.config.retry_base_delay_ms;
        let mut attempt = 0u32;

        loop {
            match op().await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if attempt < max_retries && !self.cancelled() => {
                    // 指数退避
                    let delay = base_delay_ms.saturating_mul(2u64.saturating_pow(attempt));
                    warn!(
                        "操作失败，{}ms 后重试 ({}/{}): {}: {}",
                        delay,
                        attempt + 1,
                        max_retries,
                        path,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn transfer(&self, job: &TransferJob, dest: &str) -> Result<u64, TransferError> {
        let io_timeout = self.ctx.config.io_timeout();
        let path = job.source_path.as_str();

        match job.action {
            ItemAction::Download => {
                let id = job.remote_id.as_deref().ok_or_else(|| TransferError::MissingRemoteId {
                    path: path.to_string(),
                })?;
                let dest_path = LocalStore::fs_path(dest);

                self.timed(io_timeout, "download", path, self.remote.download(id, &dest_path))
                    .await?
                    .map_err(|e| TransferError::Download {
                        path: path.to_string(),
                        reason: e.to_string(),
                    })?;

                if let Err(e) = LocalStore::set_modified(&dest_path, job.modified_at) {
                    warn!("设置修改时间失败 {}: {}", dest, e);
                }
            }
            ItemAction::Upload => {
                let parent_id = self.ensure_remote_folder(parent_path(dest)).await?;
                let local_path = LocalStore::fs_path(path);

                self.timed(
                    io_timeout,
                    "upload",
                    path,
                    self.remote.upload(&local_path, &parent_id, leaf_name(dest)),
                )
                .await?
                .map_err(|e| TransferError::Upload {
                    path: path.to_string(),
                    reason: e.to_string(),
                })?;
            }
            ItemAction::UpdateRemote => {
                let id = job.remote_id.as_deref().ok_or_else(|| TransferError::MissingRemoteId {
                    path: dest.to_string(),
                })?;
                let local_path = LocalStore::fs_path(path);

                self.timed(
                    io_timeout,
                    "update",
                    path,
                    self.remote.update_content(id, &local_path),
                )
                .await?
                .map_err(|e| TransferError::Update {
                    path: dest.to_string(),
                    reason: e.to_string(),
                })?;
            }
            ItemAction::CreateLocalFolder | ItemAction::CreateRemoteFolder => {}
        }

        Ok(job.size)
    }

    /// 带超时执行存储调用；超时返回外层错误
    async fn timed<T>(
        &self,
        limit: Duration,
        operation: &'static str,
        path: &str,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<anyhow::Result<T>, TransferError> {
        tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| TransferError::Timeout {
                operation,
                path: path.to_string(),
                secs: limit.as_secs(),
            })
    }
}

/// 计划中的目标路径；比较阶段映射失败的条目没有目标
fn planned_dest(
    planned: Option<&String>,
    unmapped: impl FnOnce() -> PathMappingError,
) -> Result<String, PathMappingError> {
    planned.cloned().ok_or_else(unmapped)
}

fn create_folder_error(path: &str, e: anyhow::Error) -> TransferError {
    TransferError::CreateFolder {
        path: path.to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RootPair, SyncConfig};
    use crate::core::plan::Conflict;
    use crate::core::tree::FolderNode;
    use crate::storage::memory::ROOT_ID;
    use crate::storage::MemoryRemote;
    use chrono::TimeZone;
    use std::path::Path;

    struct Fixture {
        _dir: tempfile::TempDir,
        local_root: String,
        remote: Arc<MemoryRemote>,
        docs_id: String,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let local_root = LocalStore::normalize_path(&dir.path().join("Docs"));
            std::fs::create_dir_all(&local_root).unwrap();
            let remote = Arc::new(MemoryRemote::new());
            let docs_id = remote.add_folder(ROOT_ID, "Docs").unwrap();
            Self {
                _dir: dir,
                local_root,
                remote,
                docs_id,
            }
        }

        fn config(&self, policy: ConflictPolicy) -> SyncConfig {
            let mut config = SyncConfig::new(vec![RootPair::new("Docs", self.local_root.as_str())]);
            config.conflict_resolution = policy;
            config
        }

        fn executor(&self, config: SyncConfig) -> PlanExecutor {
            let ctx = SyncContext::new(config);
            PlanExecutor::new(ctx, self.remote.clone())
        }

        fn local(&self, rel: &str) -> String {
            join_path(&self.local_root, rel)
        }

        fn remote_file(&self, name: &str, content: &[u8], secs: i64) -> FileNode {
            let id = self.remote.add_file(&self.docs_id, name, content, at(secs)).unwrap();
            FileNode {
                name: name.to_string(),
                path: format!("Docs/{}", name),
                id: Some(id),
                size: content.len() as u64,
                content_hash: None,
                modified_at: at(secs),
                opaque: false,
            }
        }

        fn local_file(&self, rel: &str, content: &[u8]) -> FileNode {
            let path = self.local(rel);
            std::fs::create_dir_all(Path::new(&path).parent().unwrap()).unwrap();
            std::fs::write(&path, content).unwrap();
            FileNode {
                name: leaf_name(rel).to_string(),
                path,
                id: None,
                size: content.len() as u64,
                content_hash: None,
                modified_at: Utc::now(),
                opaque: false,
            }
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn planned(node: FileNode, dest: Option<String>) -> PlannedFile {
        PlannedFile {
            source_path: node.path.clone(),
            node,
            dest_path: dest,
            replaces_id: None,
        }
    }

    #[test]
    fn test_direction_parsing() {
        assert_eq!("down".parse::<Direction>().unwrap(), Direction::Down);
        assert_eq!("UP".parse::<Direction>().unwrap(), Direction::Up);
        assert_eq!("both".parse::<Direction>().unwrap(), Direction::Both);
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn test_pipelines_are_validated() {
        for direction in [Direction::Down, Direction::Up, Direction::Both] {
            let pipeline = Pipeline::for_direction(direction).unwrap();
            for (index, phase) in pipeline.phases().iter().enumerate() {
                for required in phase.requires() {
                    assert!(pipeline.phases()[..index].contains(required));
                }
            }
        }

        let both = Pipeline::for_direction(Direction::Both).unwrap();
        assert_eq!(both.phases().first(), Some(&Phase::CreateLocalFolders));
        assert_eq!(both.phases().last(), Some(&Phase::ResolveConflictsRemotely));

        assert!(matches!(
            Pipeline::new(vec![Phase::Upload, Phase::CreateRemoteFolders]),
            Err(ConfigError::PhaseOrder {
                phase: "upload",
                required: "create-remote-folders"
            })
        ));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
    }

    #[tokio::test]
    async fn test_failed_item_does_not_stop_later_items() {
        let fx = Fixture::new();
        let mut plan = SyncPlan::new();
        for name in ["a.txt", "b.txt", "c.txt"] {
            let node = fx.remote_file(name, name.as_bytes(), 0);
            plan.to_download.push(planned(node, Some(fx.local(name))));
        }
        fx.remote.fail_on("b.txt");

        let mut config = fx.config(ConflictPolicy::Remote);
        config.max_concurrent_transfers = 1;
        let stats = fx.executor(config).execute(&plan, Direction::Down, false).await;

        assert_eq!(stats.errors, 1);
        assert_eq!(stats.downloaded_files, 2);
        assert!(!stats.is_success());
        assert_eq!(stats.failed_items().count(), 1);
        assert_eq!(stats.failed_items().next().unwrap().path, "Docs/b.txt");
        assert!(Path::new(&fx.local("a.txt")).exists());
        assert!(!Path::new(&fx.local("b.txt")).exists());
        assert!(Path::new(&fx.local("c.txt")).exists());
    }

    #[tokio::test]
    async fn test_download_sets_remote_mtime() {
        let fx = Fixture::new();
        let node = fx.remote_file("a.txt", b"hello", 42);
        let mut plan = SyncPlan::new();
        plan.to_download.push(planned(node, Some(fx.local("a.txt"))));

        let stats = fx
            .executor(fx.config(ConflictPolicy::Remote))
            .execute(&plan, Direction::Down, false)
            .await;

        assert_eq!(stats.downloaded_bytes, 5);
        let modified: DateTime<Utc> = std::fs::metadata(fx.local("a.txt"))
            .unwrap()
            .modified()
            .unwrap()
            .into();
        assert_eq!(modified, at(42));
    }

    #[tokio::test]
    async fn test_unmappable_item_counts_as_error() {
        let fx = Fixture::new();
        let mut node = fx.remote_file("a.txt", b"x", 0);
        node.path = "Elsewhere/a.txt".to_string();
        let mut plan = SyncPlan::new();
        plan.to_download.push(planned(node, None));

        let stats = fx
            .executor(fx.config(ConflictPolicy::Remote))
            .execute(&plan, Direction::Down, false)
            .await;

        assert_eq!(stats.errors, 1);
        assert!(matches!(
            stats.items[0].outcome,
            ItemOutcome::Failed(ItemError::Mapping(PathMappingError::RemoteNotMappable(_)))
        ));
    }

    #[tokio::test]
    async fn test_local_only_folder_is_created_remotely_before_upload() {
        let fx = Fixture::new();
        let y = fx.local_file("B/y.txt", b"yy");
        let z = fx.local_file("B/c/z.txt", b"zzz");
        let mut plan = SyncPlan::new();
        plan.local_only_folders.push(PlannedFolder {
            node: FolderNode::new("B", fx.local("B"), None)
                .with_file(y)
                .with_folder(FolderNode::new("c", fx.local("B/c"), None).with_file(z)),
            source_path: fx.local("B"),
            dest_path: Some("Docs/B".to_string()),
        });

        let stats = fx
            .executor(fx.config(ConflictPolicy::Remote))
            .execute(&plan, Direction::Up, false)
            .await;

        assert!(stats.is_success());
        assert_eq!(stats.created_remote_folders, 2);
        assert_eq!(stats.uploaded_files, 2);
        assert_eq!(stats.uploaded_bytes, 5);

        let calls = fx.remote.calls();
        let folder_at = calls.iter().position(|c| c == "create_folder:Docs/B").unwrap();
        let upload_at = calls.iter().position(|c| c == "upload:Docs/B/y.txt").unwrap();
        assert!(folder_at < upload_at);
        assert_eq!(calls.iter().filter(|c| c.starts_with("create_folder")).count(), 2);
        assert_eq!(fx.remote.find("Docs/B/c/z.txt").unwrap().size, 3);
    }

    #[tokio::test]
    async fn test_upload_creates_missing_parents_once() {
        let fx = Fixture::new();
        let mut plan = SyncPlan::new();
        for name in ["n1.txt", "n2.txt", "n3.txt"] {
            let node = fx.local_file(&format!("new/{}", name), b"1");
            plan.to_upload.push(planned(node, Some(format!("Docs/new/deeper/{}", name))));
        }

        let stats = fx
            .executor(fx.config(ConflictPolicy::Remote))
            .execute(&plan, Direction::Up, false)
            .await;

        assert!(stats.is_success());
        assert_eq!(stats.uploaded_files, 3);
        assert_eq!(stats.created_remote_folders, 2);
        assert_eq!(fx.remote.count_named("new"), 1);
        assert_eq!(fx.remote.count_named("deeper"), 1);
    }

    #[tokio::test]
    async fn test_remote_only_folder_is_downloaded_whole() {
        let fx = Fixture::new();
        let a_id = fx.remote.add_folder(&fx.docs_id, "A").unwrap();
        let x_id = fx.remote.add_file(&a_id, "x.txt", b"xx", at(0)).unwrap();
        let doc_id = fx
            .remote
            .add_document(&a_id, "Plan", "application/vnd.google-apps.document")
            .unwrap();

        let x = FileNode {
            name: "x.txt".into(),
            path: "Docs/A/x.txt".into(),
            id: Some(x_id),
            size: 2,
            content_hash: None,
            modified_at: at(0),
            opaque: false,
        };
        let plan_doc = FileNode {
            name: "Plan".into(),
            path: "Docs/A/Plan".into(),
            id: Some(doc_id),
            size: 0,
            content_hash: None,
            modified_at: at(0),
            opaque: true,
        };

        let mut plan = SyncPlan::new();
        plan.remote_only_folders.push(PlannedFolder {
            node: FolderNode::new("A", "Docs/A", Some(a_id))
                .with_file(x)
                .with_file(plan_doc)
                .with_folder(FolderNode::new("empty", "Docs/A/empty", Some("e".into()))),
            source_path: "Docs/A".into(),
            dest_path: Some(fx.local("A")),
        });

        let stats = fx
            .executor(fx.config(ConflictPolicy::Remote))
            .execute(&plan, Direction::Down, false)
            .await;

        assert!(stats.is_success());
        assert_eq!(stats.created_local_folders, 2);
        assert_eq!(stats.downloaded_files, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(std::fs::read(fx.local("A/x.txt")).unwrap(), b"xx");
        assert!(Path::new(&fx.local("A/empty")).is_dir());
        assert!(!Path::new(&fx.local("A/Plan")).exists());
    }

    #[tokio::test]
    async fn test_dry_run_has_no_side_effects() {
        let fx = Fixture::new();
        let mut plan = SyncPlan::new();
        let node = fx.remote_file("a.txt", b"abc", 0);
        plan.to_download.push(planned(node, Some(fx.local("a.txt"))));
        let up = fx.local_file("b.txt", b"hello");
        plan.to_upload.push(planned(up, Some("Docs/sub/b.txt".into())));
        plan.remote_only_folders.push(PlannedFolder {
            node: FolderNode::new("R", "Docs/R", Some("r".into())),
            source_path: "Docs/R".into(),
            dest_path: Some(fx.local("R")),
        });

        let stats = fx
            .executor(fx.config(ConflictPolicy::Remote))
            .execute(&plan, Direction::Both, true)
            .await;

        assert!(stats.dry_run);
        assert_eq!(stats.downloaded_files, 1);
        assert_eq!(stats.downloaded_bytes, 3);
        assert_eq!(stats.uploaded_files, 1);
        assert_eq!(stats.uploaded_bytes, 5);
        assert_eq!(stats.created_local_folders, 1);
        assert_eq!(stats.created_remote_folders, 1);
        assert!(stats.skipped_phases.is_empty());
        assert!(fx.remote.calls().is_empty());
        assert!(!Path::new(&fx.local("a.txt")).exists());
        assert!(!Path::new(&fx.local("R")).exists());

        // 实际执行的统计与 dry-run 一致
        let real = fx
            .executor(fx.config(ConflictPolicy::Remote))
            .execute(&plan, Direction::Both, false)
            .await;
        assert!(real.is_success());
        assert_eq!(real.downloaded_files, stats.downloaded_files);
        assert_eq!(real.uploaded_files, stats.uploaded_files);
        assert_eq!(real.created_local_folders, stats.created_local_folders);
        assert_eq!(real.created_remote_folders, stats.created_remote_folders);
    }

    #[tokio::test]
    async fn test_local_policy_updates_existing_remote_copy() {
        let fx = Fixture::new();
        let remote = fx.remote_file("a.txt", b"old", 500);
        let local = fx.local_file("a.txt", b"newer local");
        let remote_id = remote.id.clone().unwrap();

        let mut plan = SyncPlan::new();
        plan.conflicts.push(Conflict {
            remote,
            local,
            remote_newer: true,
        });

        let stats = fx
            .executor(fx.config(ConflictPolicy::Local))
            .execute(&plan, Direction::Both, false)
            .await;

        assert!(stats.is_success());
        assert_eq!(stats.conflicts, 1);
        assert_eq!(stats.uploaded_files, 1);
        assert_eq!(stats.downloaded_files, 0);
        assert_eq!(fx.remote.count_named("a.txt"), 1);
        assert_eq!(fx.remote.content(&remote_id).unwrap(), b"newer local");
    }

    #[tokio::test]
    async fn test_remote_policy_downloads_conflict_over_local() {
        let fx = Fixture::new();
        let remote = fx.remote_file("a.txt", b"remote copy", 0);
        let local = fx.local_file("a.txt", b"local");

        let mut plan = SyncPlan::new();
        plan.conflicts.push(Conflict {
            remote,
            local,
            remote_newer: false,
        });

        let stats = fx
            .executor(fx.config(ConflictPolicy::Remote))
            .execute(&plan, Direction::Down, false)
            .await;

        assert_eq!(stats.downloaded_files, 1);
        assert_eq!(std::fs::read(fx.local("a.txt")).unwrap(), b"remote copy");
    }

    #[tokio::test]
    async fn test_auto_resolved_upload_replaces_in_place() {
        let fx = Fixture::new();
        let remote = fx.remote_file("a.txt", b"old", 0);
        let local = fx.local_file("a.txt", b"fresh");
        let mut item = planned(local, Some("Docs/a.txt".into()));
        item.replaces_id = remote.id.clone();

        let mut plan = SyncPlan::new();
        plan.to_upload.push(item);

        let stats = fx
            .executor(fx.config(ConflictPolicy::Local))
            .execute(&plan, Direction::Up, false)
            .await;

        assert!(stats.is_success());
        assert_eq!(fx.remote.count_named("a.txt"), 1);
        assert_eq!(fx.remote.calls(), vec!["update:Docs/a.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_items() {
        let fx = Fixture::new();
        let mut plan = SyncPlan::new();
        let node = fx.remote_file("a.txt", b"abc", 0);
        plan.to_download.push(planned(node, Some(fx.local("a.txt"))));

        let ctx = SyncContext::new(fx.config(ConflictPolicy::Remote));
        ctx.cancel.cancel();
        let stats = PlanExecutor::new(ctx, fx.remote.clone())
            .execute(&plan, Direction::Down, false)
            .await;

        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.errors, 0);
        assert!(fx.remote.calls().is_empty());
        assert_eq!(
            stats.skipped_phases,
            vec![Phase::Download, Phase::ResolveConflictsLocally]
        );
        assert!(matches!(
            &stats.items[0].outcome,
            ItemOutcome::Skipped(reason) if reason.contains("create-local-folders")
        ));
    }

    #[tokio::test]
    async fn test_retry_is_opt_in() {
        let fx = Fixture::new();
        let mut plan = SyncPlan::new();
        let node = fx.remote_file("a.txt", b"abc", 0);
        plan.to_download.push(planned(node, Some(fx.local("a.txt"))));
        fx.remote.fail_on("a.txt");

        let mut config = fx.config(ConflictPolicy::Remote);
        config.max_retries = 2;
        config.retry_base_delay_ms = 1;
        let stats = fx.executor(config).execute(&plan, Direction::Down, false).await;

        // 持续失败：重试耗尽后只记一次错误
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.items.len(), 1);
    }
}
