use crate::config::SyncConfig;
use crate::core::comparator::DiffEngine;
use crate::core::executor::{Direction, PlanExecutor, SyncStats};
use crate::core::path_map::PathMapper;
use crate::core::plan::SyncPlan;
use crate::core::scanner::{ExclusionFilter, LocalScanner, RemoteScanner};
use crate::error::{ConfigError, SyncError};
use crate::storage::RemoteStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument, Span};

/// 一次同步会话的上下文，在扫描、比较和执行之间传递
#[derive(Clone)]
pub struct SyncContext {
    pub config: Arc<SyncConfig>,
    pub cancel: CancellationToken,
    pub span: Span,
}

impl SyncContext {
    pub fn new(config: SyncConfig) -> Self {
        let span = info_span!("sync", roots = config.sync_folders.len());
        Self {
            config: Arc::new(config),
            cancel: CancellationToken::new(),
            span,
        }
    }
}

/// 同步引擎
pub struct SyncEngine {
    ctx: SyncContext,
    remote: Arc<dyn RemoteStore>,
    filter: ExclusionFilter,
}

impl SyncEngine {
    /// 校验配置后创建引擎，配置无效时不会开始任何扫描
    pub fn new(config: SyncConfig, remote: Arc<dyn RemoteStore>) -> Result<Self, ConfigError> {
        config.validate()?;
        let filter = ExclusionFilter::new(&config.exclusions)?;

        Ok(Self {
            ctx: SyncContext::new(config),
            remote,
            filter,
        })
    }

    /// 取消同步
    pub fn cancel(&self) {
        self.ctx.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.ctx.cancel.clone()
    }

    /// 扫描并比较所有根目录对，合并为一个计划
    pub async fn create_sync_plan(&self) -> Result<SyncPlan, SyncError> {
        async {
            let config = &self.ctx.config;
            let cancel = &self.ctx.cancel;
            let diff = DiffEngine::new(
                config.conflict_resolution,
                Duration::from_secs(config.mtime_tolerance_secs),
            )
            .with_cancel(cancel.clone());

            let mut plan = SyncPlan::new();

            for pair in &config.sync_folders {
                if cancel.is_cancelled() {
                    return Err(SyncError::Cancelled);
                }
                info!("处理同步对: {} <-> {}", pair.remote, pair.local);

                let remote_tree = RemoteScanner::new(
                    self.remote.as_ref(),
                    &self.filter,
                    cancel,
                    config.op_timeout(),
                )
                .scan(&pair.remote)
                .await?;

                let local_tree = LocalScanner::new(
                    self.filter.clone(),
                    self.remote.checksum_algorithm(),
                    cancel.clone(),
                )
                .scan(&pair.local)
                .await?;

                // 只按当前同步对映射，嵌套的根目录不会把条目交给另一对
                let mapper = PathMapper::for_pair(pair);
                let pair_plan = diff.diff(&remote_tree, &local_tree, &mapper)?;
                info!("同步对计划: {}", pair_plan.summary());
                plan.merge(pair_plan);
            }

            info!("同步计划: {}", plan.summary());
            Ok(plan)
        }
        .instrument(self.ctx.span.clone())
        .await
    }

    /// 执行计划
    pub async fn execute_plan(&self, plan: &SyncPlan, direction: Direction, dry_run: bool) -> SyncStats {
        PlanExecutor::new(self.ctx.clone(), self.remote.clone())
            .execute(plan, direction, dry_run)
            .await
    }
}
