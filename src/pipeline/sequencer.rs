use crate::config::PipelineConfig;
use crate::pipeline::context::{CancellationToken, RunLog, StageContext};
use crate::pipeline::retry::{JitterSource, RandomJitter, RetryPolicy, Sleeper, TokioSleeper};
use crate::pipeline::stages::{Stage, StageOutput};
use crate::pipeline::storage::RunStorage;
use crate::types::{Locator, PipelineStageResult, RasterError, RasterResult};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Observable state of a run
#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    Pending,
    Running { stage: String, attempt: u32 },
    Completed,
    Failed { stage: String, error: String },
}

/// A run that reached `Completed`
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    /// Outputs of the last stage
    pub outputs: Vec<Locator>,
    /// Results of every completed stage, in order
    pub results: Vec<PipelineStageResult>,
    pub states: Vec<RunState>,
}

/// A run that reached `Failed`
#[derive(Debug, thiserror::Error)]
#[error("Run {run_id} failed in stage '{failed_stage}': {error}")]
pub struct RunFailure {
    pub run_id: String,
    pub failed_stage: String,
    pub last_completed_stage: Option<String>,
    pub completed: Vec<PipelineStageResult>,
    pub states: Vec<RunState>,
    #[source]
    pub error: RasterError,
}

/// Chains stages with retry, timeout and cancellation.
///
/// Stages run strictly in order, each attempt on the blocking pool under a
/// timeout. Retryable failures back off exponentially with jitter; anything
/// else fails the run at once. Completed results are recorded in the run
/// storage, which is what `resume` restarts from.
pub struct Sequencer<S = TokioSleeper, J = RandomJitter> {
    stages: Vec<Arc<dyn Stage>>,
    storage_root: PathBuf,
    retry: RetryPolicy,
    stage_timeout: Duration,
    concurrency: usize,
    retain_intermediates: bool,
    sleeper: S,
    jitter: J,
}

impl Sequencer {
    /// Empty sequencer using the tokio timer and random jitter
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            stages: Vec::new(),
            storage_root: config.storage_root.clone(),
            retry: config.retry_policy(),
            stage_timeout: config.stage_timeout(),
            concurrency: config.concurrency,
            retain_intermediates: config.retain_intermediates,
            sleeper: TokioSleeper,
            jitter: RandomJitter,
        }
    }
}

impl<S: Sleeper, J: JitterSource> Sequencer<S, J> {
    /// Replace the backoff sleeper
    pub fn with_sleeper<T: Sleeper>(self, sleeper: T) -> Sequencer<T, J> {
        Sequencer {
            stages: self.stages,
            storage_root: self.storage_root,
            retry: self.retry,
            stage_timeout: self.stage_timeout,
            concurrency: self.concurrency,
            retain_intermediates: self.retain_intermediates,
            sleeper,
            jitter: self.jitter,
        }
    }

    /// Replace the jitter source
    pub fn with_jitter<K: JitterSource>(self, jitter: K) -> Sequencer<S, K> {
        Sequencer {
            stages: self.stages,
            storage_root: self.storage_root,
            retry: self.retry,
            stage_timeout: self.stage_timeout,
            concurrency: self.concurrency,
            retain_intermediates: self.retain_intermediates,
            sleeper: self.sleeper,
            jitter,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    /// Append a stage
    pub fn add_stage<T: Stage + 'static>(&mut self, stage: T) -> &mut Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Storage of `run_id` under the configured root
    pub fn storage(&self, run_id: &str) -> RasterResult<RunStorage> {
        RunStorage::new(&self.storage_root, run_id)
    }

    /// Run every stage in order, starting from `inputs`
    pub async fn run(
        &self,
        run_id: &str,
        inputs: Vec<Locator>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, RunFailure> {
        let first = self.stages.first().map(|s| s.name().to_string()).unwrap_or_default();
        let storage = self.storage(run_id).map_err(|error| Self::early_failure(run_id, &first, error))?;
        self.execute(storage, 0, inputs, Vec::new(), cancel).await
    }

    /// Restart `run_id` at `stage`, feeding it the recorded outputs of the
    /// stage before it (or, for the first stage, its recorded inputs)
    pub async fn resume(&self, run_id: &str, stage: &str, cancel: &CancellationToken) -> Result<RunOutcome, RunFailure> {
        let fail = |error: RasterError| Self::early_failure(run_id, stage, error);

        let storage = self.storage(run_id).map_err(fail)?;
        let index = self
            .stages
            .iter()
            .position(|s| s.name() == stage)
            .ok_or_else(|| fail(RasterError::Config(format!("no stage named '{}'", stage))))?;

        let mut completed = Vec::with_capacity(index);
        for earlier in &self.stages[..index] {
            let result = Self::recorded(&storage, earlier.name()).map_err(fail)?;
            completed.push(result);
        }

        let inputs = match completed.last() {
            Some(previous) => previous.outputs.clone(),
            None => Self::recorded(&storage, stage).map_err(fail)?.inputs,
        };

        RunLog::new(run_id).info(format_args!("Resuming at stage '{}' with {} inputs", stage, inputs.len()));
        self.execute(storage, index, inputs, completed, cancel).await
    }

    fn recorded(storage: &RunStorage, stage: &str) -> RasterResult<PipelineStageResult> {
        storage
            .load(stage)?
            .ok_or_else(|| RasterError::Config(format!("no recorded result for stage '{}' in run {}", stage, storage.run_id())))
    }

    fn early_failure(run_id: &str, stage: &str, error: RasterError) -> RunFailure {
        RunFailure {
            run_id: run_id.to_string(),
            failed_stage: stage.to_string(),
            last_completed_stage: None,
            completed: Vec::new(),
            states: vec![
                RunState::Pending,
                RunState::Failed {
                    stage: stage.to_string(),
                    error: error.to_string(),
                },
            ],
            error,
        }
    }

    async fn execute(
        &self,
        storage: RunStorage,
        start: usize,
        mut inputs: Vec<Locator>,
        mut completed: Vec<PipelineStageResult>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, RunFailure> {
        let log = RunLog::new(storage.run_id());
        let mut states = vec![RunState::Pending];

        log.info(format_args!(
            "Starting run with stages {:?} from '{}'",
            self.stage_names(),
            self.stages.get(start).map(|s| s.name()).unwrap_or("")
        ));

        for (index, stage) in self.stages.iter().enumerate().skip(start) {
            let outcome = match self.run_stage(stage, &inputs, &storage, cancel, &mut states).await {
                Ok(result) => storage.record(&result).map(|_| result),
                Err(error) => Err(error),
            };

            let result = match outcome {
                Ok(result) => result,
                Err(error) => {
                    log.for_stage(stage.name()).error(format_args!("{}", error));
                    states.push(RunState::Failed {
                        stage: stage.name().to_string(),
                        error: error.to_string(),
                    });
                    return Err(RunFailure {
                        run_id: storage.run_id().to_string(),
                        failed_stage: stage.name().to_string(),
                        last_completed_stage: completed.last().map(|r| r.stage.clone()),
                        completed,
                        states,
                        error,
                    });
                }
            };

            if !self.retain_intermediates && index > 0 {
                let previous = self.stages[index - 1].name();
                if let Err(e) = storage.discard_outputs(previous) {
                    log.warn(format_args!("Could not discard outputs of '{}': {}", previous, e));
                }
            }

            inputs = result.outputs.clone();
            completed.push(result);
        }

        states.push(RunState::Completed);
        log.info(format_args!("Run completed with {} outputs", inputs.len()));
        Ok(RunOutcome {
            run_id: storage.run_id().to_string(),
            outputs: inputs,
            results: completed,
            states,
        })
    }

    /// Attempt `stage` until it succeeds, fails permanently or runs out of
    /// attempts
    async fn run_stage(
        &self,
        stage: &Arc<dyn Stage>,
        inputs: &[Locator],
        storage: &RunStorage,
        cancel: &CancellationToken,
        states: &mut Vec<RunState>,
    ) -> RasterResult<PipelineStageResult> {
        let log = RunLog::new(storage.run_id()).for_stage(stage.name());
        let attempts = self.retry.attempts();

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(RasterError::Cancelled);
            }
            states.push(RunState::Running {
                stage: stage.name().to_string(),
                attempt,
            });
            log.info(format_args!("Attempt {}/{}", attempt, attempts));

            let error = match self.attempt(stage, inputs, storage, attempt, cancel).await {
                Ok(output) => {
                    for warning in &output.warnings {
                        log.warn(format_args!("{}", warning));
                    }
                    return Ok(PipelineStageResult {
                        stage: stage.name().to_string(),
                        attempt,
                        inputs: inputs.to_vec(),
                        outputs: output.outputs,
                        warnings: output.warnings,
                        completed_at: Utc::now(),
                    });
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                return Err(error);
            }
            if attempt == attempts {
                return Err(RasterError::RetriesExhausted {
                    stage: stage.name().to_string(),
                    attempts,
                    last: Box::new(error),
                });
            }

            let delay = self.retry.delay_for(attempt, self.jitter.sample());
            log.warn(format_args!("Attempt {} failed: {}. Retrying in {:.2} seconds...", attempt, error, delay.as_secs_f64()));
            tokio::select! {
                _ = self.sleeper.sleep(delay) => {}
                _ = cancel.cancelled() => return Err(RasterError::Cancelled),
            }
        }

        Err(RasterError::Cancelled)
    }

    /// One attempt on the blocking pool. A timeout or run cancellation
    /// cancels the attempt's own token; the abandoned task stops at its next
    /// checkpoint.
    async fn attempt(
        &self,
        stage: &Arc<dyn Stage>,
        inputs: &[Locator],
        storage: &RunStorage,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> RasterResult<StageOutput> {
        let attempt_cancel = CancellationToken::new();
        let ctx = StageContext::new(
            storage.clone(),
            stage.name(),
            attempt,
            self.concurrency,
            cancel.clone(),
            attempt_cancel.clone(),
        );
        let task_stage = Arc::clone(stage);
        let task_inputs = inputs.to_vec();
        let handle = tokio::task::spawn_blocking(move || task_stage.run(&task_inputs, &ctx));

        tokio::select! {
            joined = tokio::time::timeout(self.stage_timeout, handle) => match joined {
                Ok(Ok(result)) => result,
                Ok(Err(join_error)) => Err(RasterError::Collaborator(anyhow::anyhow!(
                    "stage '{}' attempt {} aborted: {}",
                    stage.name(),
                    attempt,
                    join_error
                ))),
                Err(_) => {
                    attempt_cancel.cancel();
                    Err(RasterError::StageTimeout {
                        stage: stage.name().to_string(),
                        timeout: self.stage_timeout,
                    })
                }
            },
            _ = cancel.cancelled() => {
                attempt_cancel.cancel();
                Err(RasterError::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::retry::FixedJitter;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct RecordingSleeper {
        delays: Arc<Mutex<Vec<Duration>>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            self.delays.lock().unwrap().push(duration);
            std::future::ready(())
        }
    }

    /// Fails with the produced error for the first `failures` attempts
    struct Flaky {
        name: &'static str,
        failures: u32,
        calls: Arc<AtomicU32>,
        error: fn() -> RasterError,
    }

    impl Stage for Flaky {
        fn name(&self) -> &str {
            self.name
        }

        fn run(&self, inputs: &[Locator], _ctx: &StageContext) -> RasterResult<StageOutput> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err((self.error)());
            }
            let mut outputs = inputs.to_vec();
            outputs.push(Locator::new(format!("{}-out", self.name)));
            Ok(StageOutput {
                outputs,
                warnings: Vec::new(),
            })
        }
    }

    fn flaky(name: &'static str, failures: u32, error: fn() -> RasterError) -> (Flaky, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Flaky {
                name,
                failures,
                calls: calls.clone(),
                error,
            },
            calls,
        )
    }

    fn io_error() -> RasterError {
        RasterError::unreadable("/remote/file.tif", "connection reset")
    }

    fn sequencer(root: &TempDir) -> (Sequencer<RecordingSleeper, FixedJitter>, RecordingSleeper) {
        let config = PipelineConfig {
            storage_root: root.path().to_path_buf(),
            ..PipelineConfig::default()
        };
        let sleeper = RecordingSleeper::default();
        let sequencer = Sequencer::new(&config).with_sleeper(sleeper.clone()).with_jitter(FixedJitter(0.0));
        (sequencer, sleeper)
    }

    #[tokio::test]
    async fn test_stages_chain_outputs() {
        let root = TempDir::new().unwrap();
        let (mut seq, _) = sequencer(&root);
        seq.add_stage(flaky("a", 0, io_error).0).add_stage(flaky("b", 0, io_error).0);

        let outcome = seq.run("run-1", vec![Locator::new("seed")], &CancellationToken::new()).await.unwrap();
        assert_eq!(
            outcome.outputs,
            vec![Locator::new("seed"), Locator::new("a-out"), Locator::new("b-out")]
        );
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.states.first(), Some(&RunState::Pending));
        assert_eq!(outcome.states.last(), Some(&RunState::Completed));
        assert!(seq.storage("run-1").unwrap().load("b").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_retryable_failures_back_off() {
        let root = TempDir::new().unwrap();
        let (mut seq, sleeper) = sequencer(&root);
        let (stage, calls) = flaky("fetch", 3, io_error);
        seq.add_stage(stage);

        let outcome = seq.run("run-1", Vec::new(), &CancellationToken::new()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(outcome.results[0].attempt, 4);
        assert_eq!(
            *sleeper.delays.lock().unwrap(),
            vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]
        );
    }

    #[tokio::test]
    async fn test_jitter_added_to_delay() {
        let root = TempDir::new().unwrap();
        let (seq, sleeper) = sequencer(&root);
        let mut seq = seq.with_jitter(FixedJitter(0.5));
        seq.add_stage(flaky("fetch", 1, io_error).0);

        seq.run("run-1", Vec::new(), &CancellationToken::new()).await.unwrap();
        assert_eq!(*sleeper.delays.lock().unwrap(), vec![Duration::from_millis(1250)]);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let root = TempDir::new().unwrap();
        let (seq, sleeper) = sequencer(&root);
        let mut seq = seq.with_retry(RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        });
        let (stage, calls) = flaky("fetch", u32::MAX, io_error);
        seq.add_stage(stage);

        let failure = seq.run("run-1", Vec::new(), &CancellationToken::new()).await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(sleeper.delays.lock().unwrap().len(), 2);
        match failure.error {
            RasterError::RetriesExhausted { stage, attempts, last } => {
                assert_eq!(stage, "fetch");
                assert_eq!(attempts, 3);
                assert!(matches!(*last, RasterError::UnreadableSource { .. }));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let root = TempDir::new().unwrap();
        let (mut seq, sleeper) = sequencer(&root);
        let (first, _) = flaky("acquire", 0, io_error);
        let (mosaic, calls) = flaky("mosaic", 1, || RasterError::EmptyMosaicInput);
        let (publish, publish_calls) = flaky("publish", 0, io_error);
        seq.add_stage(first).add_stage(mosaic).add_stage(publish);

        let failure = seq.run("run-1", Vec::new(), &CancellationToken::new()).await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(publish_calls.load(Ordering::SeqCst), 0);
        assert!(sleeper.delays.lock().unwrap().is_empty());
        assert!(matches!(failure.error, RasterError::EmptyMosaicInput));
        assert_eq!(failure.failed_stage, "mosaic");
        assert_eq!(failure.last_completed_stage.as_deref(), Some("acquire"));
        assert_eq!(failure.completed.len(), 1);
        assert!(matches!(failure.states.last(), Some(RunState::Failed { .. })));
    }

    struct Slow;

    impl Stage for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn run(&self, _inputs: &[Locator], ctx: &StageContext) -> RasterResult<StageOutput> {
            loop {
                ctx.checkpoint()?;
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }

    #[tokio::test]
    async fn test_timeout_is_retryable_and_reported() {
        let root = TempDir::new().unwrap();
        let (seq, sleeper) = sequencer(&root);
        let mut seq = seq
            .with_stage_timeout(Duration::from_millis(50))
            .with_retry(RetryPolicy {
                max_attempts: 2,
                ..RetryPolicy::default()
            });
        seq.add_stage(Slow);

        let failure = seq.run("run-1", Vec::new(), &CancellationToken::new()).await.unwrap_err();
        assert_eq!(sleeper.delays.lock().unwrap().len(), 1);
        match failure.error {
            RasterError::RetriesExhausted { attempts, last, .. } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, RasterError::StageTimeout { .. }));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let root = TempDir::new().unwrap();
        let (mut seq, _) = sequencer(&root);
        let (stage, calls) = flaky("a", 0, io_error);
        seq.add_stage(stage);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let failure = seq.run("run-1", Vec::new(), &cancel).await.unwrap_err();
        assert!(matches!(failure.error, RasterError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_returns_promptly() {
        let root = TempDir::new().unwrap();
        let config = PipelineConfig {
            storage_root: root.path().to_path_buf(),
            ..PipelineConfig::default()
        };
        let mut seq = Sequencer::new(&config).with_jitter(FixedJitter(0.0)).with_retry(RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(3600),
            ..RetryPolicy::default()
        });
        seq.add_stage(flaky("fetch", u32::MAX, io_error).0);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let failure = tokio::time::timeout(Duration::from_secs(5), seq.run("run-1", Vec::new(), &cancel))
            .await
            .expect("cancellation should interrupt the backoff")
            .unwrap_err();
        assert!(matches!(failure.error, RasterError::Cancelled));
    }

    #[tokio::test]
    async fn test_resume_uses_recorded_outputs() {
        let root = TempDir::new().unwrap();
        let (mut seq, _) = sequencer(&root);
        let (a, a_calls) = flaky("a", 0, io_error);
        let (b, b_calls) = flaky("b", 1, || RasterError::InvalidParameter("bad".to_string()));
        seq.add_stage(a).add_stage(b);

        let failure = seq.run("run-1", vec![Locator::new("seed")], &CancellationToken::new()).await.unwrap_err();
        assert_eq!(failure.failed_stage, "b");

        let outcome = seq.resume("run-1", "b", &CancellationToken::new()).await.unwrap();
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(
            outcome.outputs,
            vec![Locator::new("seed"), Locator::new("a-out"), Locator::new("b-out")]
        );

        // Re-running from the first stage reuses its recorded inputs
        let outcome = seq.resume("run-1", "a", &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.outputs[0], Locator::new("seed"));
    }

    #[tokio::test]
    async fn test_resume_unknown_stage() {
        let root = TempDir::new().unwrap();
        let (mut seq, _) = sequencer(&root);
        seq.add_stage(flaky("a", 0, io_error).0);

        let failure = seq.resume("run-1", "zzz", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(failure.error, RasterError::Config(_)));
        let failure = seq.resume("run-1", "a", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(failure.error, RasterError::Config(_)));
    }
}
