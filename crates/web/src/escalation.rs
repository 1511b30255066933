use std::sync::Arc;

use pushbuild_core::models::{RunLog, TimeStamp};
use pushbuild_db::LogStore;
use pushbuild_github::IncidentReporter;
use tokio::sync::watch;

/// Lifecycle of the webhook endpoint. Only escalation leaves `Serving`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Lifecycle {
    Serving,
    /// The listener is closing; no new events are accepted.
    Draining,
    Terminated,
}

/// Ends the process after an escalation.
pub trait Exit: Send + Sync {
    fn exit(&self, code: i32);
}

pub struct ProcessExit;

impl Exit for ProcessExit {
    fn exit(&self, code: i32) { std::process::exit(code) }
}

/// Terminal failure handling: stop serving, persist the log, report the
/// incident and exit with status 1.
pub struct Escalation {
    lifecycle: watch::Sender<Lifecycle>,
    store: Arc<dyn LogStore>,
    reporter: Arc<dyn IncidentReporter>,
    exit: Arc<dyn Exit>,
}

impl Escalation {
    pub fn new(
        store: Arc<dyn LogStore>,
        reporter: Arc<dyn IncidentReporter>,
        exit: Arc<dyn Exit>,
    ) -> Self {
        let (lifecycle, _) = watch::channel(Lifecycle::Serving);
        Self { lifecycle, store, reporter, exit }
    }

    pub fn lifecycle(&self) -> Lifecycle { *self.lifecycle.borrow() }

    /// Resolves once an escalation has started; used to close the listener.
    pub async fn draining(&self) {
        let mut rx = self.lifecycle.subscribe();
        // The sender lives as long as `self`, so this only returns on a state change.
        let _ = rx.wait_for(|state| *state != Lifecycle::Serving).await;
    }

    /// Run the escalation sequence for `error`.
    ///
    /// Every step is attempted even if an earlier one failed. Secondary
    /// failures go to the process's own diagnostics together with the original
    /// error. Ends by exiting with status 1.
    pub async fn escalate(&self, log: &RunLog, timestamp: TimeStamp, error: anyhow::Error) {
        let detail = format!("{error:#}");
        tracing::error!("Escalating failure for event {}: {}", timestamp, detail);

        let closed = self.lifecycle.send_if_modified(|state| {
            if *state == Lifecycle::Serving {
                *state = Lifecycle::Draining;
                true
            } else {
                false
            }
        });
        if closed {
            tracing::info!("Closing listener");
        }

        log.error(detail.clone());
        if let Err(e) = self.store.flush(timestamp, log).await {
            tracing::error!("Failed to flush run log for event {}: {:?}", timestamp, e);
        }

        if let Err(e) = self.reporter.report(timestamp, &detail).await {
            tracing::error!(
                "Failed to report incident for event {}: {:?}\nOriginal error: {}",
                timestamp,
                e,
                detail
            );
        }

        self.lifecycle.send_replace(Lifecycle::Terminated);
        self.exit.exit(1);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use anyhow::{Result, anyhow, bail};
    use async_trait::async_trait;
    use pushbuild_core::models::LogEntry;

    use super::*;

    /// Shared, ordered record of what the fakes observed.
    pub type Journal = Arc<Mutex<Vec<String>>>;

    pub struct FakeStore {
        pub journal: Journal,
        pub flushed: Mutex<Vec<(TimeStamp, Vec<LogEntry>)>>,
        pub fail: bool,
    }

    #[async_trait]
    impl LogStore for FakeStore {
        async fn flush(&self, timestamp: TimeStamp, log: &RunLog) -> Result<()> {
            self.journal.lock().unwrap().push(format!("flush {timestamp}"));
            if self.fail {
                bail!("disk full");
            }
            self.flushed.lock().unwrap().push((timestamp, log.entries()));
            Ok(())
        }
    }

    pub struct FakeReporter {
        pub journal: Journal,
        pub fail: bool,
    }

    #[async_trait]
    impl IncidentReporter for FakeReporter {
        async fn report(&self, timestamp: TimeStamp, detail: &str) -> Result<()> {
            self.journal.lock().unwrap().push(format!("report {timestamp}: {detail}"));
            if self.fail {
                bail!("issue tracker unavailable");
            }
            Ok(())
        }
    }

    pub struct FakeExit {
        pub journal: Journal,
    }

    impl Exit for FakeExit {
        fn exit(&self, code: i32) { self.journal.lock().unwrap().push(format!("exit {code}")) }
    }

    pub struct Fakes {
        pub journal: Journal,
        pub store: Arc<FakeStore>,
        pub escalation: Arc<Escalation>,
    }

    pub fn fakes(store_fails: bool, reporter_fails: bool) -> Fakes {
        let journal = Journal::default();
        let store = Arc::new(FakeStore {
            journal: journal.clone(),
            flushed: Mutex::default(),
            fail: store_fails,
        });
        let reporter = Arc::new(FakeReporter { journal: journal.clone(), fail: reporter_fails });
        let exit = Arc::new(FakeExit { journal: journal.clone() });
        let escalation = Arc::new(Escalation::new(store.clone(), reporter, exit));
        Fakes { journal, store, escalation }
    }

    impl Fakes {
        pub fn journal(&self) -> Vec<String> { self.journal.lock().unwrap().clone() }
    }

    #[tokio::test]
    async fn test_escalation_order() {
        let fakes = fakes(false, false);
        let log = RunLog::new();
        log.info("Push to refs/heads/main accepted");
        let timestamp = TimeStamp::from_millis(42);
        assert_eq!(fakes.escalation.lifecycle(), Lifecycle::Serving);

        fakes.escalation.escalate(&log, timestamp, anyhow!("publish failed")).await;

        assert_eq!(fakes.journal(), vec![
            "flush 42".to_string(),
            "report 42: publish failed".to_string(),
            "exit 1".to_string(),
        ]);
        assert_eq!(fakes.escalation.lifecycle(), Lifecycle::Terminated);
        let flushed = fakes.store.flushed.lock().unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].1.len(), 2);
        assert_eq!(flushed[0].1[1].message, "publish failed");
    }

    #[tokio::test]
    async fn test_escalation_survives_secondary_failures() {
        let fakes = fakes(true, true);
        fakes.escalation.escalate(&RunLog::new(), TimeStamp::from_millis(1), anyhow!("boom")).await;
        assert_eq!(fakes.journal(), vec![
            "flush 1".to_string(),
            "report 1: boom".to_string(),
            "exit 1".to_string(),
        ]);
    }

    #[tokio::test]
    async fn test_draining_resolves_on_escalation() {
        let fakes = fakes(false, false);
        let escalation = fakes.escalation.clone();
        let draining = tokio::spawn(async move { escalation.draining().await });
        tokio::task::yield_now().await;
        assert!(!draining.is_finished());

        fakes.escalation.escalate(&RunLog::new(), TimeStamp::from_millis(1), anyhow!("boom")).await;
        draining.await.unwrap();
    }
}
