use crate::pipeline::storage::RunStorage;
use crate::types::{RasterError, RasterResult};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

/// Log target of all pipeline records
pub const LOG_TARGET: &str = "rasterflow::pipeline";

/// Run-scoped logging context. Every record carries the run id and, inside a
/// stage, the stage name.
#[derive(Debug, Clone, PartialEq)]
pub struct RunLog {
    run_id: String,
    stage: Option<String>,
}

impl RunLog {
    pub fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            stage: None,
        }
    }

    /// Context for records emitted while `stage` runs
    pub fn for_stage(&self, stage: &str) -> Self {
        Self {
            run_id: self.run_id.clone(),
            stage: Some(stage.to_string()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn stage(&self) -> Option<&str> {
        self.stage.as_deref()
    }

    pub fn info(&self, message: fmt::Arguments<'_>) {
        log::info!(target: LOG_TARGET, "[{}] {}", self, message);
    }

    pub fn debug(&self, message: fmt::Arguments<'_>) {
        log::debug!(target: LOG_TARGET, "[{}] {}", self, message);
    }

    pub fn warn(&self, message: fmt::Arguments<'_>) {
        log::warn!(target: LOG_TARGET, "[{}] {}", self, message);
    }

    pub fn error(&self, message: fmt::Arguments<'_>) {
        log::error!(target: LOG_TARGET, "[{}] {}", self, message);
    }
}

impl fmt::Display for RunLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.stage {
            Some(stage) => write!(f, "run={} stage={}", self.run_id, stage),
            None => write!(f, "run={}", self.run_id),
        }
    }
}

/// Cooperative cancellation flag shared between the caller, the sequencer
/// and running stages
#[derive(Debug, Clone)]
pub struct CancellationToken {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once the token is cancelled
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as `self`, so the wait cannot fail
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

/// Everything a stage attempt gets from the sequencer
#[derive(Debug, Clone)]
pub struct StageContext {
    pub log: RunLog,
    pub storage: RunStorage,
    pub stage: String,
    pub attempt: u32,
    /// Upper bound on worker threads used inside the stage
    pub concurrency: usize,
    run_cancel: CancellationToken,
    attempt_cancel: CancellationToken,
}

impl StageContext {
    pub fn new(
        storage: RunStorage,
        stage: &str,
        attempt: u32,
        concurrency: usize,
        run_cancel: CancellationToken,
        attempt_cancel: CancellationToken,
    ) -> Self {
        Self {
            log: RunLog::new(storage.run_id()).for_stage(stage),
            storage,
            stage: stage.to_string(),
            attempt,
            concurrency: concurrency.max(1),
            run_cancel,
            attempt_cancel,
        }
    }

    /// Fails with `Cancelled` once the run was cancelled or this attempt was
    /// abandoned after a timeout
    pub fn checkpoint(&self) -> RasterResult<()> {
        if self.run_cancel.is_cancelled() || self.attempt_cancel.is_cancelled() {
            self.log.debug(format_args!("attempt {} stopping at checkpoint", self.attempt));
            return Err(RasterError::Cancelled);
        }
        Ok(())
    }

    /// Output directory of this stage, created on demand
    pub fn stage_dir(&self) -> RasterResult<PathBuf> {
        self.storage.prepare_stage(&self.stage)
    }

    /// Worker pool bounded by the configured concurrency
    pub fn thread_pool(&self) -> RasterResult<rayon::ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.concurrency)
            .build()
            .map_err(|e| RasterError::Config(format!("Failed to build worker pool: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_run_log_prefix() {
        let log = RunLog::new("run-7");
        assert_eq!(log.to_string(), "run=run-7");
        assert_eq!(log.for_stage("mosaic").to_string(), "run=run-7 stage=mosaic");
        assert_eq!(log.for_stage("mosaic").run_id(), "run-7");
    }

    #[test]
    fn test_token_clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_resolves() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();

        // Already-cancelled tokens resolve immediately
        token.cancelled().await;
    }

    #[test]
    fn test_checkpoint_sees_either_token() {
        let storage = RunStorage::new("/tmp/rasterflow", "run-1").unwrap();
        let run = CancellationToken::new();
        let attempt = CancellationToken::new();
        let ctx = StageContext::new(storage, "rescale", 1, 0, run.clone(), attempt.clone());

        assert_eq!(ctx.concurrency, 1);
        assert!(ctx.checkpoint().is_ok());
        attempt.cancel();
        assert!(matches!(ctx.checkpoint(), Err(RasterError::Cancelled)));

        let ctx = StageContext::new(ctx.storage.clone(), "rescale", 2, 4, run.clone(), CancellationToken::new());
        run.cancel();
        assert!(matches!(ctx.checkpoint(), Err(RasterError::Cancelled)));
    }
}
