//! Periodic job runner
//!
//! One tokio task per job. The task sleeps for an interval, runs one cycle and
//! repeats until cancelled. Cancellation is only observed between cycles, and
//! [`JobRunner::stop`] waits for the task, so no cycle is still running once
//! it returns.

use super::{JobError, JobResult, PeriodicJob};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct JobRunner {
    name: String,
    token: CancellationToken,
    handle: Option<JoinHandle<JobResult<()>>>,
    cycles: Arc<AtomicU64>,
}

impl JobRunner {
    /// Spawn `job`, first cycle after one `interval`
    pub fn start<J: PeriodicJob>(job: J, interval: Duration) -> Self {
        let name = job.name().to_string();
        let token = CancellationToken::new();
        let cycles = Arc::new(AtomicU64::new(0));

        let handle = tokio::spawn(run(job, interval, token.clone(), cycles.clone()));
        info!(job = %name, interval_ms = interval.as_millis() as u64, "Job started");

        Self {
            name,
            token,
            handle: Some(handle),
            cycles,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Completed cycles, successful or not
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancel the job and wait for it to finish
    ///
    /// Returns the error that terminated the job, if any. Calling it again
    /// returns `Ok(())`.
    pub async fn stop(&mut self) -> JobResult<()> {
        self.token.cancel();
        self.join().await
    }

    /// Wait for the job to finish on its own
    pub async fn join(&mut self) -> JobResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(JobError::Unrecognized(anyhow::anyhow!("job task failed: {}", e))),
        };
        debug!(job = %self.name, "Job joined");
        result
    }
}

impl Drop for JobRunner {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl std::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRunner")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .field("cycles", &self.cycles())
            .finish()
    }
}

async fn run<J: PeriodicJob>(
    mut job: J,
    interval: Duration,
    token: CancellationToken,
    cycles: Arc<AtomicU64>,
) -> JobResult<()> {
    let started = job.on_start().await;
    if let ControlFlow::Break(e) = check(job.name(), started) {
        job.on_finish().await;
        return Err(e);
    }

    loop {
        let wait = job.next_interval().unwrap_or(interval);
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            () = tokio::time::sleep(wait) => {}
        }

        let started = Instant::now();
        let result = job.execute_job().await;
        cycles.fetch_add(1, Ordering::Relaxed);
        debug!(
            job = %job.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "Job cycle finished"
        );

        if let ControlFlow::Break(e) = check(job.name(), result) {
            job.on_finish().await;
            return Err(e);
        }
    }

    job.on_finish().await;
    info!(job = %job.name(), "Job stopped");
    Ok(())
}

fn check(name: &str, result: JobResult<()>) -> ControlFlow<JobError> {
    match result {
        Ok(()) => ControlFlow::Continue(()),
        Err(e @ (JobError::TrustStore(_) | JobError::Runtime(_) | JobError::Logic(_))) => {
            warn!(job = %name, error = %e, "Job cycle failed");
            ControlFlow::Continue(())
        }
        Err(e @ JobError::Unrecognized(_)) => {
            error!(job = %name, error = %e, "Job failed with an unrecognized error; stopping");
            ControlFlow::Break(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Events(Mutex<Vec<&'static str>>);

    impl Events {
        fn push(&self, event: &'static str) {
            self.0.lock().unwrap().push(event);
        }

        fn list(&self) -> Vec<&'static str> {
            self.0.lock().unwrap().clone()
        }
    }

    struct ScriptedJob {
        events: Arc<Events>,
        failures: Vec<JobError>,
    }

    #[async_trait]
    impl PeriodicJob for ScriptedJob {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn on_start(&mut self) -> JobResult<()> {
            self.events.push("start");
            Ok(())
        }

        async fn execute_job(&mut self) -> JobResult<()> {
            self.events.push("execute");
            match self.failures.pop() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        async fn on_finish(&mut self) {
            self.events.push("finish");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recoverable_errors_keep_running() {
        let events = Arc::new(Events::default());
        let job = ScriptedJob {
            events: events.clone(),
            failures: vec![JobError::Logic("bad".into()), JobError::Runtime(crate::Error::PoolShutdown)],
        };

        let mut runner = JobRunner::start(job, Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(3500)).await;

        assert!(runner.is_running());
        assert_eq!(runner.cycles(), 3);
        runner.stop().await.unwrap();

        assert_eq!(events.list(), vec!["start", "execute", "execute", "execute", "finish"]);
        assert!(!runner.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecognized_error_stops_runner() {
        let events = Arc::new(Events::default());
        let job = ScriptedJob {
            events: events.clone(),
            failures: vec![JobError::Unrecognized(anyhow::anyhow!("corrupt state"))],
        };

        let mut runner = JobRunner::start(job, Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert_eq!(runner.cycles(), 1);
        let result = runner.stop().await;
        assert!(matches!(result, Err(JobError::Unrecognized(_))));
        assert_eq!(events.list(), vec!["start", "execute", "finish"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_first_cycle() {
        let events = Arc::new(Events::default());
        let job = ScriptedJob {
            events: events.clone(),
            failures: Vec::new(),
        };

        let mut runner = JobRunner::start(job, Duration::from_secs(60));
        tokio::task::yield_now().await;
        runner.stop().await.unwrap();
        runner.stop().await.unwrap();

        assert_eq!(runner.cycles(), 0);
        assert_eq!(events.list(), vec!["start", "finish"]);
    }

    struct BackoffJob {
        failed: bool,
    }

    #[async_trait]
    impl PeriodicJob for BackoffJob {
        fn name(&self) -> &str {
            "backoff"
        }

        async fn execute_job(&mut self) -> JobResult<()> {
            self.failed = true;
            Err(JobError::Logic("always fails".into()))
        }

        fn next_interval(&self) -> Option<Duration> {
            self.failed.then_some(Duration::from_secs(1))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_interval_override() {
        let mut runner = JobRunner::start(BackoffJob { failed: false }, Duration::from_secs(10));

        tokio::time::sleep(Duration::from_millis(12500)).await;
        // one cycle at 10s, then every second
        assert_eq!(runner.cycles(), 3);
        runner.stop().await.unwrap();
    }
}
