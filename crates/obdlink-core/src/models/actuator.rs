//! Actuator test definitions and executions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Physical risk level of a bi-directional test
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    /// Requires an explicit confirmation token before execution
    High,
}

/// Family of test, selecting the shape of its result payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestKind {
    /// Actively drives a component (fan, pump, lights)
    #[default]
    Actuation,
    /// Service/maintenance reset (oil counter, brake wear)
    ServiceReset,
    /// Writes coding/configuration values
    Coding,
}

/// Definition of one actuator test, supplied by configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuatorTestDefinition {
    /// Stable identifier
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Target module (address or logical name)
    pub module: String,
    /// Family of the test
    #[serde(default)]
    pub kind: TestKind,
    /// Command payloads sent in order through the protocol session
    pub commands: Vec<String>,
    /// Optional abort command sent on cancellation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_command: Option<String>,
    /// Risk classification
    #[serde(default)]
    pub risk: RiskLevel,
    /// Whether a valid security session for `module` is required
    #[serde(default)]
    pub requires_security_access: bool,
}

/// Execution lifecycle status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TestStatus {
    /// Whether this status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TestStatus::Completed | TestStatus::Failed | TestStatus::Cancelled
        )
    }
}

/// Result payload, discriminated by test family
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TestOutcome {
    /// Raw responses from each actuation command
    Actuation { responses: Vec<String> },
    /// Whether the module acknowledged the reset
    ServiceReset { confirmed: bool },
    /// Echoed coding value accepted by the module
    Coding { echoed: String },
}

/// Progress report delivered to batch progress callbacks
#[derive(Debug, Clone, Serialize)]
pub struct TestProgress {
    /// Name of the test currently reported on
    pub name: String,
    /// Overall batch progress, 0-100
    pub progress: u8,
    /// Status of the reported test
    pub status: TestStatus,
}

/// A single test execution
///
/// At most one execution is `Running` process-wide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestExecution {
    /// Unique execution id
    pub id: Uuid,
    /// Definition this execution ran
    pub definition_id: String,
    /// Lifecycle status
    pub status: TestStatus,
    /// Progress through the command sequence, 0-100
    pub progress: u8,
    /// When the execution entered `Running`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the execution reached a terminal status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Result payload on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TestOutcome>,
    /// Error message on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TestExecution {
    pub fn new(definition_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            definition_id: definition_id.into(),
            status: TestStatus::Pending,
            progress: 0,
            started_at: None,
            finished_at: None,
            outcome: None,
            error: None,
        }
    }
}
