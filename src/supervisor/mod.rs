//! Singleton supervision of the agent process.
//!
//! The sandbox owns the process table and offers no cross-request mutual
//! exclusion, so the supervisor works by optimistic concurrency: decide
//! "absent" from a (possibly stale) list, then re-check immediately before
//! the mutating start call. Callers within this gateway instance are
//! additionally serialized through a local start lock; a concurrent start
//! from elsewhere shows up as an "already running" rejection and is folded
//! back into the wait path rather than treated as fatal.
//!
//! Every wait is a bounded poll. Cancellation is caller-driven: dropping
//! the request future stops the polling, but start/kill commands already
//! issued against the sandbox are not rolled back — the process's
//! existence is independent of any one caller's interest in it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::{AgentConfig, SupervisorConfig};
use crate::error::{SandboxError, SupervisorError};
use crate::sandbox::{ProcessLogs, ProcessRecord, SandboxProcesses};

/// Supervises the one agent process inside the sandbox.
pub struct Supervisor {
    sandbox: Arc<dyn SandboxProcesses>,
    agent: AgentConfig,
    config: SupervisorConfig,
    /// Serializes the absent-then-start critical section for callers inside
    /// this gateway instance. Cross-instance races are handled by the
    /// re-list plus already-running folding.
    start_lock: Mutex<()>,
}

impl Supervisor {
    pub fn new(
        sandbox: Arc<dyn SandboxProcesses>,
        agent: AgentConfig,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            sandbox,
            agent,
            config,
            start_lock: Mutex::new(()),
        }
    }

    pub fn sandbox(&self) -> &Arc<dyn SandboxProcesses> {
        &self.sandbox
    }

    /// Find a ready agent process, starting one if absent. The primary
    /// entry point for every handler that needs the agent.
    pub async fn ensure_running(&self) -> Result<ProcessRecord, SupervisorError> {
        if let Some(record) = self.find_alive().await? {
            // Fast path: wait_for_port returns immediately when the port is
            // already reachable, so a satisfied readiness costs one probe.
            return self.wait_ready(record).await;
        }

        let _guard = self.start_lock.lock().await;

        // Re-verify absence right before mutating: another caller (or
        // another gateway instance) may have started the agent since the
        // first, possibly stale, read.
        if let Some(record) = self.find_alive().await? {
            return self.wait_ready(record).await;
        }

        let record = match self.sandbox.start_process(&self.agent.command).await {
            Ok(record) => record,
            Err(SandboxError::StartRejected { message }) if is_already_running(&message) => {
                tracing::debug!(message, "start rejected as already running, re-listing");
                self.find_alive()
                    .await?
                    .ok_or(SupervisorError::StartFailed(SandboxError::StartRejected {
                        message,
                    }))?
            }
            Err(e) => return Err(SupervisorError::StartFailed(e)),
        };

        tracing::info!(process_id = %record.id, "started agent process");
        self.wait_ready(record).await
    }

    /// Kill any existing agent process and start a fresh one. Idempotent:
    /// the kill path tolerates already-gone processes and the start path
    /// goes through the same race check as `ensure_running`.
    pub async fn restart(&self) -> Result<ProcessRecord, SupervisorError> {
        let records = self
            .sandbox
            .list_processes()
            .await
            .map_err(SupervisorError::from_sandbox)?;

        let mut killed = 0usize;
        for record in records
            .iter()
            .filter(|r| r.matches(&self.agent.command) && r.status.is_alive())
        {
            self.sandbox
                .kill_process(&record.id)
                .await
                .map_err(SupervisorError::from_sandbox)?;
            killed += 1;
        }

        if killed > 0 {
            tracing::info!(killed, "killed agent process for restart");
            self.await_termination().await?;
        }

        self.ensure_running().await
    }

    /// Read-only lookup: is an agent process alive right now? Never starts
    /// anything. Any sandbox error is swallowed and reported as absent —
    /// callers cannot distinguish "definitely not running" from "could not
    /// tell", which is a known ambiguity of this surface.
    pub async fn find_running(&self) -> Option<ProcessRecord> {
        match self.sandbox.list_processes().await {
            Ok(records) => records
                .into_iter()
                .find(|r| r.matches(&self.agent.command) && r.status.is_alive()),
            Err(e) => {
                tracing::debug!(error = %e, "process lookup failed, reporting absent");
                None
            }
        }
    }

    /// Captured logs of the current agent process, if one exists.
    pub async fn agent_logs(&self) -> Option<ProcessLogs> {
        let record = self.find_running().await?;
        self.sandbox.process_logs(&record.id).await.ok()
    }

    async fn find_alive(&self) -> Result<Option<ProcessRecord>, SupervisorError> {
        let records = self
            .sandbox
            .list_processes()
            .await
            .map_err(SupervisorError::from_sandbox)?;
        Ok(records
            .into_iter()
            .find(|r| r.matches(&self.agent.command) && r.status.is_alive()))
    }

    /// Block until the agent's port is reachable, bounded by the configured
    /// timeout. A failed wait is classified by re-listing: a record that
    /// reached a terminal status is reported with its exit information,
    /// anything else is a readiness timeout. Neither is retried here.
    async fn wait_ready(&self, record: ProcessRecord) -> Result<ProcessRecord, SupervisorError> {
        match self
            .sandbox
            .wait_for_port(self.agent.port, self.config.ready_timeout)
            .await
        {
            Ok(()) => Ok(self.refreshed(record).await),
            Err(SandboxError::PortTimeout { waited_ms, .. }) => {
                Err(self.classify_wait_failure(&record, waited_ms).await)
            }
            Err(e) => Err(SupervisorError::from_sandbox(e)),
        }
    }

    async fn classify_wait_failure(&self, record: &ProcessRecord, waited_ms: u64) -> SupervisorError {
        let current = match self.sandbox.list_processes().await {
            Ok(records) => records.into_iter().find(|r| r.id == record.id),
            Err(e) => return SupervisorError::from_sandbox(e),
        };

        match current {
            Some(r) if r.status.is_alive() => SupervisorError::ReadyTimeout { waited_ms },
            other => {
                // Exited (or vanished) during startup. Capture what we can
                // for the operator; log retrieval is best-effort.
                let exit_code = other.and_then(|r| r.exit_code);
                let stderr = self
                    .sandbox
                    .process_logs(&record.id)
                    .await
                    .map(|logs| logs.stderr)
                    .unwrap_or_default();
                SupervisorError::ProcessExited { exit_code, stderr }
            }
        }
    }

    /// Re-read the record after a successful readiness wait so callers see
    /// the `running` status. A lookup hiccup here does not fail the call —
    /// the port is confirmed reachable, which is what matters.
    async fn refreshed(&self, record: ProcessRecord) -> ProcessRecord {
        match self.sandbox.list_processes().await {
            Ok(records) => records
                .into_iter()
                .find(|r| r.id == record.id)
                .unwrap_or(record),
            Err(_) => record,
        }
    }

    /// Poll the process table until no alive matching record remains.
    async fn await_termination(&self) -> Result<(), SupervisorError> {
        let deadline = Instant::now() + self.config.ready_timeout;
        loop {
            if self.find_alive().await?.is_none() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SupervisorError::ShutdownTimeout {
                    waited_ms: self.config.ready_timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

/// Whether a start rejection message means the process already exists. The
/// process-execution interface offers no structured code for this, so the
/// message text is the only signal.
fn is_already_running(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("already running") || message.contains("already exists")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::error::SandboxError;
    use crate::sandbox::{ProcessLogs, ProcessStatus, SandboxProcesses};

    use super::*;

    const AGENT_COMMAND: &str = "agent serve --port 4100";

    /// Scripted in-memory sandbox.
    struct MockSandbox {
        table: std::sync::Mutex<Vec<ProcessRecord>>,
        start_calls: AtomicUsize,
        /// Every list fails (simulates an unreachable sandbox).
        fail_lists: AtomicBool,
        /// Every list fails with a control API error (sandbox reachable,
        /// request refused).
        api_fail_lists: AtomicBool,
        /// Return an empty table for the first N list calls even when
        /// records exist (simulates stale reads).
        hide_first_lists: AtomicUsize,
        /// Reject every start with an "already running" message.
        reject_starts: AtomicBool,
        /// When true, waiting for the port succeeds as soon as an alive
        /// matching record exists (and flips it to running).
        port_comes_ready: AtomicBool,
        next_id: AtomicUsize,
    }

    impl MockSandbox {
        fn new() -> Self {
            Self {
                table: std::sync::Mutex::new(Vec::new()),
                start_calls: AtomicUsize::new(0),
                fail_lists: AtomicBool::new(false),
                api_fail_lists: AtomicBool::new(false),
                hide_first_lists: AtomicUsize::new(0),
                reject_starts: AtomicBool::new(false),
                port_comes_ready: AtomicBool::new(true),
                next_id: AtomicUsize::new(1),
            }
        }

        fn record(&self, status: ProcessStatus) -> ProcessRecord {
            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            ProcessRecord {
                id: format!("p-{n}"),
                command: AGENT_COMMAND.to_string(),
                status,
                exit_code: None,
                started_at: Utc::now(),
                finished_at: None,
            }
        }

        fn insert(&self, status: ProcessStatus) -> ProcessRecord {
            let record = self.record(status);
            self.table.lock().unwrap().push(record.clone());
            record
        }

        fn alive_count(&self) -> usize {
            self.table
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.status.is_alive())
                .count()
        }
    }

    #[async_trait]
    impl SandboxProcesses for MockSandbox {
        async fn start_process(&self, command: &str) -> Result<ProcessRecord, SandboxError> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            if self.reject_starts.load(Ordering::SeqCst) {
                return Err(SandboxError::StartRejected {
                    message: "process already running".to_string(),
                });
            }
            let mut record = self.record(ProcessStatus::Starting);
            record.command = command.to_string();
            self.table.lock().unwrap().push(record.clone());
            Ok(record)
        }

        async fn list_processes(&self) -> Result<Vec<ProcessRecord>, SandboxError> {
            if self.fail_lists.load(Ordering::SeqCst) {
                return Err(SandboxError::Unreachable("connection refused".to_string()));
            }
            if self.api_fail_lists.load(Ordering::SeqCst) {
                return Err(SandboxError::Api("control API returned 500".to_string()));
            }
            let hidden = self.hide_first_lists.load(Ordering::SeqCst);
            if hidden > 0 {
                self.hide_first_lists.store(hidden - 1, Ordering::SeqCst);
                return Ok(Vec::new());
            }
            Ok(self.table.lock().unwrap().clone())
        }

        async fn kill_process(&self, id: &str) -> Result<(), SandboxError> {
            let mut table = self.table.lock().unwrap();
            if let Some(record) = table.iter_mut().find(|r| r.id == id) {
                record.status = ProcessStatus::Completed;
                record.exit_code = Some(0);
                record.finished_at = Some(Utc::now());
            }
            Ok(())
        }

        async fn process_logs(&self, _id: &str) -> Result<ProcessLogs, SandboxError> {
            Ok(ProcessLogs {
                stdout: String::new(),
                stderr: "boom".to_string(),
            })
        }

        async fn wait_for_port(
            &self,
            port: u16,
            timeout: Duration,
        ) -> Result<(), SandboxError> {
            if self.port_comes_ready.load(Ordering::SeqCst) {
                let mut table = self.table.lock().unwrap();
                if let Some(record) = table
                    .iter_mut()
                    .find(|r| r.matches(AGENT_COMMAND) && r.status.is_alive())
                {
                    record.status = ProcessStatus::Running;
                    return Ok(());
                }
            }
            Err(SandboxError::PortTimeout {
                port,
                waited_ms: timeout.as_millis() as u64,
            })
        }
    }

    fn supervisor(sandbox: Arc<MockSandbox>) -> Supervisor {
        Supervisor::new(
            sandbox,
            AgentConfig::default(),
            SupervisorConfig {
                ready_timeout: Duration::from_millis(100),
                poll_interval: Duration::from_millis(5),
            },
        )
    }

    #[tokio::test]
    async fn test_fast_path_returns_running_without_start() {
        let sandbox = Arc::new(MockSandbox::new());
        let existing = sandbox.insert(ProcessStatus::Running);
        let sup = supervisor(sandbox.clone());

        let record = sup.ensure_running().await.unwrap();
        assert_eq!(record.id, existing.id);
        assert_eq!(sandbox.start_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_starting_record_is_awaited_not_duplicated() {
        let sandbox = Arc::new(MockSandbox::new());
        let existing = sandbox.insert(ProcessStatus::Starting);
        let sup = supervisor(sandbox.clone());

        let record = sup.ensure_running().await.unwrap();
        assert_eq!(record.id, existing.id);
        assert_eq!(record.status, ProcessStatus::Running);
        assert_eq!(sandbox.start_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_absent_starts_one_process() {
        let sandbox = Arc::new(MockSandbox::new());
        let sup = supervisor(sandbox.clone());

        let record = sup.ensure_running().await.unwrap();
        assert_eq!(record.status, ProcessStatus::Running);
        assert_eq!(sandbox.start_calls.load(Ordering::SeqCst), 1);
        assert_eq!(sandbox.alive_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_converge_on_one_process() {
        let sandbox = Arc::new(MockSandbox::new());
        let sup = Arc::new(supervisor(sandbox.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sup = Arc::clone(&sup);
            handles.push(tokio::spawn(async move { sup.ensure_running().await }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().id);
        }

        assert_eq!(sandbox.start_calls.load(Ordering::SeqCst), 1);
        ids.dedup();
        assert_eq!(ids.len(), 1, "all callers must see the same process");
    }

    #[tokio::test]
    async fn test_already_running_rejection_folds_into_wait() {
        let sandbox = Arc::new(MockSandbox::new());
        // Another gateway instance wins the race: our stale lists see an
        // empty table, our start is rejected, and the re-list reveals the
        // competitor's record.
        let competitor = sandbox.insert(ProcessStatus::Starting);
        sandbox.hide_first_lists.store(2, Ordering::SeqCst);
        sandbox.reject_starts.store(true, Ordering::SeqCst);
        let sup = supervisor(sandbox.clone());

        let record = sup.ensure_running().await.unwrap();
        assert_eq!(record.id, competitor.id);
        assert_eq!(sandbox.start_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ready_timeout_when_process_stays_starting() {
        let sandbox = Arc::new(MockSandbox::new());
        sandbox.insert(ProcessStatus::Starting);
        sandbox.port_comes_ready.store(false, Ordering::SeqCst);
        let sup = supervisor(sandbox.clone());

        let err = sup.ensure_running().await.unwrap_err();
        assert!(matches!(err, SupervisorError::ReadyTimeout { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_exit_during_startup_reported_with_exit_info() {
        let sandbox = Arc::new(MockSandbox::new());
        sandbox.port_comes_ready.store(false, Ordering::SeqCst);
        let record = sandbox.insert(ProcessStatus::Starting);
        {
            let mut table = sandbox.table.lock().unwrap();
            let r = table.iter_mut().find(|r| r.id == record.id).unwrap();
            r.status = ProcessStatus::Failed;
            r.exit_code = Some(1);
        }
        let sup = supervisor(sandbox.clone());

        let err = sup.wait_ready(record).await.unwrap_err();
        match err {
            SupervisorError::ProcessExited { exit_code, stderr } => {
                assert_eq!(exit_code, Some(1));
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected ProcessExited, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_restart_kills_existing_then_starts_fresh() {
        let sandbox = Arc::new(MockSandbox::new());
        let old = sandbox.insert(ProcessStatus::Running);
        let sup = supervisor(sandbox.clone());

        let fresh = sup.restart().await.unwrap();
        assert_ne!(fresh.id, old.id, "identifiers are never reused");
        assert_eq!(sandbox.alive_count(), 1);
    }

    #[tokio::test]
    async fn test_restart_twice_never_leaves_two_running() {
        let sandbox = Arc::new(MockSandbox::new());
        sandbox.insert(ProcessStatus::Running);
        let sup = supervisor(sandbox.clone());

        sup.restart().await.unwrap();
        sup.restart().await.unwrap();
        assert_eq!(sandbox.alive_count(), 1);
    }

    #[tokio::test]
    async fn test_restart_with_no_existing_process_just_starts() {
        let sandbox = Arc::new(MockSandbox::new());
        let sup = supervisor(sandbox.clone());

        let record = sup.restart().await.unwrap();
        assert_eq!(record.status, ProcessStatus::Running);
        assert_eq!(sandbox.start_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_find_running_swallows_lookup_errors() {
        let sandbox = Arc::new(MockSandbox::new());
        sandbox.insert(ProcessStatus::Running);
        sandbox.fail_lists.store(true, Ordering::SeqCst);
        let sup = supervisor(sandbox.clone());

        // Lookup failure and genuine absence are indistinguishable here.
        assert!(sup.find_running().await.is_none());
    }

    #[tokio::test]
    async fn test_find_running_never_starts() {
        let sandbox = Arc::new(MockSandbox::new());
        let sup = supervisor(sandbox.clone());

        assert!(sup.find_running().await.is_none());
        assert_eq!(sandbox.start_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sandbox_unreachable_during_ensure_is_surfaced() {
        let sandbox = Arc::new(MockSandbox::new());
        sandbox.fail_lists.store(true, Ordering::SeqCst);
        let sup = supervisor(sandbox.clone());

        let err = sup.ensure_running().await.unwrap_err();
        assert!(matches!(err, SupervisorError::SandboxUnreachable(_)), "{err}");
    }

    #[tokio::test]
    async fn test_control_api_error_is_not_reported_as_unreachable() {
        let sandbox = Arc::new(MockSandbox::new());
        sandbox.api_fail_lists.store(true, Ordering::SeqCst);
        let sup = supervisor(sandbox.clone());

        let err = sup.ensure_running().await.unwrap_err();
        assert!(matches!(err, SupervisorError::ControlApi(_)), "{err}");
        assert!(!err.to_string().contains("unreachable"), "{err}");
    }

    #[test]
    fn test_already_running_message_detection() {
        assert!(is_already_running("process already running"));
        assert!(is_already_running("Process Already Exists"));
        assert!(!is_already_running("image not found"));
    }
}
