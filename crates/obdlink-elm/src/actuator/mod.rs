//! Actuator test orchestration
//!
//! Runs bi-directional tests (component actuation, service resets,
//! coding writes) as ordered command sequences over the serialized
//! channel. At most one execution runs at a time; while one does it
//! holds the exclusive channel lease, which also pauses live-data
//! polling. High-risk tests refuse to run without an explicit
//! confirmation token, and protected tests require a valid security
//! session for their target module.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use obdlink_core::{
    ActuatorTestDefinition, RiskLevel, TestExecution, TestKind, TestOutcome, TestProgress,
    TestStatus, VehicleProfile,
};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::protocol::{ExclusiveAccess, ProtocolError, ProtocolSession, SendOptions};
use crate::security::SecurityManager;

/// Pre-flight errors; failures during a run land in the execution
/// record instead
#[derive(Debug, Error, Clone)]
pub enum ExecError {
    #[error("No vehicle profile selected")]
    NoProfile,

    #[error("Unknown test: {0}")]
    UnknownTest(String),

    #[error("Another test is already running")]
    Busy,

    #[error("Test {0} is high risk and requires a confirmation token")]
    ConfirmationRequired(String),

    #[error("Security access required for module {module}")]
    NotAuthenticated { module: String },
}

impl From<ExecError> for obdlink_core::DiagnosticError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::NoProfile => {
                obdlink_core::DiagnosticError::InvalidRequest("no vehicle profile".to_string())
            }
            ExecError::UnknownTest(id) => {
                obdlink_core::DiagnosticError::InvalidRequest(format!("unknown test {id}"))
            }
            ExecError::Busy => {
                obdlink_core::DiagnosticError::Busy("test already running".to_string())
            }
            ExecError::ConfirmationRequired(id) => {
                obdlink_core::DiagnosticError::ConfirmationRequired(id)
            }
            ExecError::NotAuthenticated { module } => {
                obdlink_core::DiagnosticError::SecurityRequired(module)
            }
        }
    }
}

/// Explicit acknowledgment that a high-risk test may run
///
/// Deliberately constructed per test id so a stored token cannot be
/// replayed against a different test.
#[derive(Debug, Clone)]
pub struct ConfirmationToken {
    test_id: String,
}

impl ConfirmationToken {
    pub fn acknowledge(test_id: impl Into<String>) -> Self {
        Self {
            test_id: test_id.into(),
        }
    }

    pub fn covers(&self, test_id: &str) -> bool {
        self.test_id == test_id
    }
}

const ABORT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Terminal executions kept for inspection; the oldest is evicted past
/// this point
const EXECUTION_LOG_CAP: usize = 100;

pub struct ActuatorOrchestrator {
    session: Arc<ProtocolSession>,
    security: Arc<SecurityManager>,
    profile: Arc<RwLock<Option<Arc<VehicleProfile>>>>,
    exclusive: ExclusiveAccess,
    executions: Arc<RwLock<HashMap<Uuid, TestExecution>>>,
    cancel_flags: Arc<RwLock<HashMap<Uuid, Arc<AtomicBool>>>>,
    progress: broadcast::Sender<TestProgress>,
}

impl ActuatorOrchestrator {
    pub fn new(
        session: Arc<ProtocolSession>,
        security: Arc<SecurityManager>,
        exclusive: ExclusiveAccess,
    ) -> Self {
        let (progress, _) = broadcast::channel(64);
        Self {
            session,
            security,
            profile: Arc::new(RwLock::new(None)),
            exclusive,
            executions: Arc::new(RwLock::new(HashMap::new())),
            cancel_flags: Arc::new(RwLock::new(HashMap::new())),
            progress,
        }
    }

    /// Select the vehicle profile supplying test definitions
    pub fn set_profile(&self, profile: Option<Arc<VehicleProfile>>) {
        *self.profile.write() = profile;
    }

    /// Tests available for the current vehicle
    pub fn available_tests(&self) -> Vec<ActuatorTestDefinition> {
        self.profile
            .read()
            .as_ref()
            .map(|p| p.actuator_tests.clone())
            .unwrap_or_default()
    }

    /// Subscribe to progress reports for all executions
    pub fn subscribe_progress(&self) -> broadcast::Receiver<TestProgress> {
        self.progress.subscribe()
    }

    /// All known executions
    pub fn executions(&self) -> Vec<TestExecution> {
        self.executions.read().values().cloned().collect()
    }

    /// One execution by id
    pub fn execution(&self, id: Uuid) -> Option<TestExecution> {
        self.executions.read().get(&id).cloned()
    }

    /// The currently running execution, if any
    pub fn running(&self) -> Option<TestExecution> {
        self.executions
            .read()
            .values()
            .find(|e| e.status == TestStatus::Running)
            .cloned()
    }

    /// Request cancellation of a running execution
    ///
    /// Cancellation is cooperative: the run stops at the next command
    /// boundary, sends the definition's abort command if one exists,
    /// and marks the execution cancelled. Returns whether a running
    /// execution accepted the request.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.cancel_flags.read().get(&id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Run a single test to completion
    ///
    /// Pre-flight failures (unknown test, busy channel, missing
    /// confirmation or security session) return an error without
    /// touching the vehicle. Once started, the returned execution
    /// record carries the terminal status and outcome.
    pub async fn execute(
        &self,
        definition_id: &str,
        confirmation: Option<&ConfirmationToken>,
    ) -> Result<TestExecution, ExecError> {
        let definition = self.preflight(definition_id, confirmation)?;
        let _lease = self.exclusive.acquire().ok_or(ExecError::Busy)?;

        let (execution, _) = self.run_test(&definition, 0, 1).await;
        Ok(execution)
    }

    /// Run several tests in order under one channel lease
    ///
    /// Every test needs its own confirmation token if high risk. A
    /// transport drop fails the test in flight and cancels the
    /// remaining items; other failures continue with the next test.
    pub async fn execute_batch(
        &self,
        definition_ids: &[String],
        confirmations: &[ConfirmationToken],
    ) -> Result<Vec<TestExecution>, ExecError> {
        let mut definitions = Vec::with_capacity(definition_ids.len());
        for id in definition_ids {
            let token = confirmations.iter().find(|t| t.covers(id));
            definitions.push(self.preflight(id, token)?);
        }

        let _lease = self.exclusive.acquire().ok_or(ExecError::Busy)?;

        let total = definitions.len();
        let mut results = Vec::with_capacity(total);
        let mut disconnected = false;

        for (index, definition) in definitions.iter().enumerate() {
            if disconnected {
                results.push(self.record_skipped(definition));
                continue;
            }

            let (execution, dropped) = self.run_test(definition, index, total).await;
            if dropped {
                warn!(test = %definition.id, "Transport dropped; cancelling remaining batch items");
                disconnected = true;
            }
            results.push(execution);
        }

        Ok(results)
    }

    fn preflight(
        &self,
        definition_id: &str,
        confirmation: Option<&ConfirmationToken>,
    ) -> Result<ActuatorTestDefinition, ExecError> {
        let profile = self.profile.read().clone().ok_or(ExecError::NoProfile)?;
        let definition = profile
            .actuator_tests
            .iter()
            .find(|t| t.id == definition_id)
            .cloned()
            .ok_or_else(|| ExecError::UnknownTest(definition_id.to_string()))?;

        if definition.risk == RiskLevel::High
            && !confirmation.is_some_and(|t| t.covers(definition_id))
        {
            return Err(ExecError::ConfirmationRequired(definition_id.to_string()));
        }

        if definition.requires_security_access
            && !self.security.is_authenticated(&definition.module)
        {
            return Err(ExecError::NotAuthenticated {
                module: definition.module.clone(),
            });
        }

        Ok(definition)
    }

    /// Run one test; `index`/`total` position it inside a batch for
    /// progress reporting. The second return value reports whether the
    /// transport dropped mid-run.
    async fn run_test(
        &self,
        definition: &ActuatorTestDefinition,
        index: usize,
        total: usize,
    ) -> (TestExecution, bool) {
        let mut execution = TestExecution::new(&definition.id);
        execution.status = TestStatus::Running;
        execution.started_at = Some(Utc::now());

        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.cancel_flags
            .write()
            .insert(execution.id, cancel_flag.clone());
        self.store(&execution, definition, index, total);

        info!(test = %definition.id, kind = ?definition.kind, "Test started");

        let commands = &definition.commands;
        let steps = commands.len().max(1);
        let mut responses = Vec::with_capacity(commands.len());
        let mut dropped = false;

        for (step, command) in commands.iter().enumerate() {
            if cancel_flag.load(Ordering::SeqCst) {
                self.send_abort(definition).await;
                execution.status = TestStatus::Cancelled;
                info!(test = %definition.id, "Test cancelled");
                break;
            }

            match self
                .session
                .send_command(command, SendOptions::non_idempotent())
                .await
            {
                Ok(response) => {
                    responses.push(response);
                    execution.progress = (((step + 1) * 100) / steps) as u8;
                    self.store(&execution, definition, index, total);
                }
                Err(e) => {
                    // A closed link and a mid-command I/O failure both
                    // mean the transport is gone
                    dropped = matches!(
                        e,
                        ProtocolError::NotConnected | ProtocolError::Transport(_)
                    );
                    execution.status = TestStatus::Failed;
                    execution.error = Some(e.to_string());
                    warn!(test = %definition.id, error = %e, "Test failed");
                    break;
                }
            }
        }

        if execution.status == TestStatus::Running {
            execution.status = TestStatus::Completed;
            execution.progress = 100;
            execution.outcome = Some(outcome_for(definition.kind, responses));
            info!(test = %definition.id, "Test completed");
        }

        execution.finished_at = Some(Utc::now());
        self.cancel_flags.write().remove(&execution.id);
        self.store(&execution, definition, index, total);
        (execution, dropped)
    }

    /// Record a batch item that never ran because of an earlier drop
    fn record_skipped(&self, definition: &ActuatorTestDefinition) -> TestExecution {
        let mut execution = TestExecution::new(&definition.id);
        execution.status = TestStatus::Cancelled;
        execution.finished_at = Some(Utc::now());
        self.insert_execution(&execution);
        execution
    }

    /// Insert a snapshot, evicting the oldest terminal record when the
    /// log outgrows its cap. A running execution is never evicted.
    fn insert_execution(&self, execution: &TestExecution) {
        let mut executions = self.executions.write();
        executions.insert(execution.id, execution.clone());
        if executions.len() <= EXECUTION_LOG_CAP {
            return;
        }
        let oldest = executions
            .values()
            .filter(|e| e.status != TestStatus::Running)
            .min_by_key(|e| e.started_at.unwrap_or_default())
            .map(|e| e.id);
        if let Some(id) = oldest {
            executions.remove(&id);
        }
    }

    async fn send_abort(&self, definition: &ActuatorTestDefinition) {
        let Some(abort) = &definition.abort_command else {
            return;
        };
        let options = SendOptions {
            timeout: Some(ABORT_TIMEOUT),
            non_idempotent: true,
        };
        if let Err(e) = self.session.send_command(abort, options).await {
            warn!(test = %definition.id, error = %e, "Abort command failed");
        }
    }

    /// Persist a snapshot and publish batch-aware progress
    fn store(
        &self,
        execution: &TestExecution,
        definition: &ActuatorTestDefinition,
        index: usize,
        total: usize,
    ) {
        self.insert_execution(execution);

        let total = total.max(1);
        let within = execution.progress as usize;
        let overall = ((index * 100 + within) / total).min(100) as u8;
        let _ = self.progress.send(TestProgress {
            name: definition.name.clone(),
            progress: overall,
            status: execution.status,
        });
    }
}

fn outcome_for(kind: TestKind, responses: Vec<String>) -> TestOutcome {
    match kind {
        TestKind::Actuation => TestOutcome::Actuation { responses },
        TestKind::ServiceReset => TestOutcome::ServiceReset {
            confirmed: !responses.is_empty(),
        },
        TestKind::Coding => TestOutcome::Coding {
            echoed: responses.last().cloned().unwrap_or_default(),
        },
    }
}

#[cfg(test)]
mod tests {
    use obdlink_core::{Device, PidDefinition, ProfileProvider, SeedKeyAlgorithm};

    use super::*;
    use crate::config::{MockConfig, ProtocolConfig};
    use crate::transport::mock::{MockAdapter, MockBackend};
    use crate::transport::{LinkHandle, LinkHealth, SerialLinkBackend};

    struct TestProvider;

    impl ProfileProvider for TestProvider {
        fn standard_pids(&self) -> Vec<PidDefinition> {
            Vec::new()
        }

        fn profile(&self, _id: &str) -> Option<Arc<VehicleProfile>> {
            None
        }

        fn seed_key_algorithm(&self, _name: &str) -> Option<Arc<dyn SeedKeyAlgorithm>> {
            None
        }
    }

    fn test_definition(id: &str) -> ActuatorTestDefinition {
        ActuatorTestDefinition {
            id: id.to_string(),
            name: format!("Test {id}"),
            module: "engine".to_string(),
            kind: TestKind::Actuation,
            commands: vec!["2F010101".to_string(), "2F010100".to_string()],
            abort_command: Some("2F010100".to_string()),
            risk: RiskLevel::Low,
            requires_security_access: false,
        }
    }

    fn profile_with(tests: Vec<ActuatorTestDefinition>) -> Arc<VehicleProfile> {
        Arc::new(VehicleProfile {
            id: "test".to_string(),
            name: "Test vehicle".to_string(),
            actuator_tests: tests,
            ..Default::default()
        })
    }

    async fn orchestrator_over_mock() -> (Arc<MockAdapter>, ActuatorOrchestrator) {
        orchestrator_with_latency(0).await
    }

    async fn orchestrator_with_latency(
        latency_ms: u64,
    ) -> (Arc<MockAdapter>, ActuatorOrchestrator) {
        let backend = MockBackend::new(&MockConfig { latency_ms });
        let adapter = backend.adapter();
        adapter.set_response("2F01", "6F 01");

        let device = Device::new("00:11:22:33:44:55", "OBDII-ELM327", true);
        let link = backend.open(&device).await.unwrap();
        let handle: LinkHandle = Arc::new(RwLock::new(Some(link)));

        let config = ProtocolConfig {
            command_timeout_ms: 500,
            idle_timeout_ms: 50,
            max_retries: 1,
        };
        let session = Arc::new(ProtocolSession::new(handle, LinkHealth::new(), config));
        session.initialize().await.unwrap();

        let security = Arc::new(SecurityManager::new(session.clone(), Arc::new(TestProvider)));
        let orchestrator =
            ActuatorOrchestrator::new(session, security, ExclusiveAccess::new());
        (adapter, orchestrator)
    }

    #[tokio::test]
    async fn test_low_risk_test_completes() {
        let (_adapter, orchestrator) = orchestrator_over_mock().await;
        orchestrator.set_profile(Some(profile_with(vec![test_definition("fan")])));

        let execution = orchestrator.execute("fan", None).await.unwrap();
        assert_eq!(execution.status, TestStatus::Completed);
        assert_eq!(execution.progress, 100);
        match execution.outcome.unwrap() {
            TestOutcome::Actuation { responses } => assert_eq!(responses.len(), 2),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_high_risk_requires_confirmation() {
        let (_adapter, orchestrator) = orchestrator_over_mock().await;
        let mut definition = test_definition("injector");
        definition.risk = RiskLevel::High;
        orchestrator.set_profile(Some(profile_with(vec![definition])));

        let err = orchestrator.execute("injector", None).await.unwrap_err();
        assert!(matches!(err, ExecError::ConfirmationRequired(_)));

        // A token for a different test does not count
        let wrong = ConfirmationToken::acknowledge("fan");
        let err = orchestrator
            .execute("injector", Some(&wrong))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::ConfirmationRequired(_)));

        let token = ConfirmationToken::acknowledge("injector");
        let execution = orchestrator.execute("injector", Some(&token)).await.unwrap();
        assert_eq!(execution.status, TestStatus::Completed);
    }

    #[tokio::test]
    async fn test_protected_test_requires_security_session() {
        let (_adapter, orchestrator) = orchestrator_over_mock().await;
        let mut definition = test_definition("coding");
        definition.requires_security_access = true;
        orchestrator.set_profile(Some(profile_with(vec![definition])));

        let err = orchestrator.execute("coding", None).await.unwrap_err();
        assert!(matches!(err, ExecError::NotAuthenticated { module } if module == "engine"));
    }

    #[tokio::test]
    async fn test_busy_while_lease_held() {
        let (_adapter, orchestrator) = orchestrator_over_mock().await;
        orchestrator.set_profile(Some(profile_with(vec![test_definition("fan")])));

        let _guard = orchestrator.exclusive.acquire().unwrap();
        let err = orchestrator.execute("fan", None).await.unwrap_err();
        assert!(matches!(err, ExecError::Busy));
    }

    #[tokio::test]
    async fn test_unknown_test_rejected() {
        let (_adapter, orchestrator) = orchestrator_over_mock().await;
        orchestrator.set_profile(Some(profile_with(vec![])));

        let err = orchestrator.execute("nope", None).await.unwrap_err();
        assert!(matches!(err, ExecError::UnknownTest(_)));
    }

    #[tokio::test]
    async fn test_cancel_stops_at_command_boundary() {
        let (_adapter, orchestrator) = orchestrator_with_latency(10).await;
        let mut definition = test_definition("slow");
        definition.commands = vec!["2F010101".to_string(); 50];
        orchestrator.set_profile(Some(profile_with(vec![definition])));

        let orchestrator = Arc::new(orchestrator);
        let runner = orchestrator.clone();
        let handle = tokio::spawn(async move { runner.execute("slow", None).await });

        // Wait for the run to register, then cancel it
        let running = loop {
            if let Some(running) = orchestrator.running() {
                break running;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        };
        assert!(orchestrator.cancel(running.id));

        let execution = handle.await.unwrap().unwrap();
        assert_eq!(execution.status, TestStatus::Cancelled);
        assert!(execution.progress < 100);
    }

    #[tokio::test]
    async fn test_batch_disconnect_cancels_remaining() {
        let (adapter, orchestrator) = orchestrator_over_mock().await;

        let ok = test_definition("one");
        let mut dies = test_definition("two");
        dies.commands = vec!["2F020101".to_string()];
        let never = test_definition("three");
        orchestrator.set_profile(Some(profile_with(vec![ok, dies, never])));

        adapter.set_disconnect_on("2F020101");

        let results = orchestrator
            .execute_batch(
                &["one".to_string(), "two".to_string(), "three".to_string()],
                &[],
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].status, TestStatus::Completed);
        assert_eq!(results[1].status, TestStatus::Failed);
        assert_eq!(results[2].status, TestStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_execution_log_is_bounded() {
        let (_adapter, orchestrator) = orchestrator_over_mock().await;

        for _ in 0..(EXECUTION_LOG_CAP + 10) {
            let mut execution = TestExecution::new("fan");
            execution.status = TestStatus::Completed;
            execution.started_at = Some(Utc::now());
            execution.finished_at = Some(Utc::now());
            orchestrator.insert_execution(&execution);
        }

        assert!(orchestrator.executions().len() <= EXECUTION_LOG_CAP);
    }

    #[tokio::test]
    async fn test_batch_write_failure_cancels_remaining() {
        let (adapter, orchestrator) = orchestrator_over_mock().await;

        let ok = test_definition("one");
        let mut dies = test_definition("two");
        dies.commands = vec!["2F030101".to_string()];
        dies.abort_command = None;
        let never = test_definition("three");
        orchestrator.set_profile(Some(profile_with(vec![ok, dies, never])));

        adapter.set_fail_write_on("2F030101");

        let results = orchestrator
            .execute_batch(
                &["one".to_string(), "two".to_string(), "three".to_string()],
                &[],
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].status, TestStatus::Completed);
        assert_eq!(results[1].status, TestStatus::Failed);
        assert_eq!(results[2].status, TestStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_progress_reports_reach_subscribers() {
        let (_adapter, orchestrator) = orchestrator_over_mock().await;
        orchestrator.set_profile(Some(profile_with(vec![test_definition("fan")])));
        let mut progress = orchestrator.subscribe_progress();

        orchestrator.execute("fan", None).await.unwrap();

        let mut seen_running = false;
        let mut seen_completed = false;
        while let Ok(report) = progress.try_recv() {
            match report.status {
                TestStatus::Running => seen_running = true,
                TestStatus::Completed => {
                    seen_completed = true;
                    assert_eq!(report.progress, 100);
                }
                _ => {}
            }
        }
        assert!(seen_running);
        assert!(seen_completed);
    }
}
