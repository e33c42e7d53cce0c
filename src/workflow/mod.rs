//! Multi-turn workflows.
//!
//! Each workflow type is a fixed transition table over a shared set of
//! states. A user has at most one non-terminal workflow at a time; finished
//! workflows stay in the store for audit.

mod machine;
pub mod transitions;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use machine::{MemoryWorkflows, WorkflowBackend, WorkflowEngine};

/// Workflow type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    EmailCompose,
    TaskReview,
    DigestBuild,
}

impl std::fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowType::EmailCompose => write!(f, "email_compose"),
            WorkflowType::TaskReview => write!(f, "task_review"),
            WorkflowType::DigestBuild => write!(f, "digest_build"),
        }
    }
}

impl std::str::FromStr for WorkflowType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "email_compose" => Ok(WorkflowType::EmailCompose),
            "task_review" => Ok(WorkflowType::TaskReview),
            "digest_build" => Ok(WorkflowType::DigestBuild),
            _ => Err(format!("Unknown workflow type: {}", s)),
        }
    }
}

/// Every state any workflow type can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Drafting,
    Reviewing,
    AwaitingApproval,
    Collecting,
    Summarizing,
    Delivering,
    Completed,
    Cancelled,
    Failed,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Cancelled | WorkflowState::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Drafting => "drafting",
            WorkflowState::Reviewing => "reviewing",
            WorkflowState::AwaitingApproval => "awaiting_approval",
            WorkflowState::Collecting => "collecting",
            WorkflowState::Summarizing => "summarizing",
            WorkflowState::Delivering => "delivering",
            WorkflowState::Completed => "completed",
            WorkflowState::Cancelled => "cancelled",
            WorkflowState::Failed => "failed",
        }
    }
}

impl WorkflowState {
    /// Short user-facing label.
    pub fn describe(&self) -> &'static str {
        match self {
            WorkflowState::Drafting => "drafting",
            WorkflowState::Reviewing => "in review",
            WorkflowState::AwaitingApproval => "waiting for your approval",
            WorkflowState::Collecting => "collecting items",
            WorkflowState::Summarizing => "summarizing",
            WorkflowState::Delivering => "delivering",
            WorkflowState::Completed => "complete",
            WorkflowState::Cancelled => "cancelled",
            WorkflowState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drafting" => Ok(WorkflowState::Drafting),
            "reviewing" => Ok(WorkflowState::Reviewing),
            "awaiting_approval" => Ok(WorkflowState::AwaitingApproval),
            "collecting" => Ok(WorkflowState::Collecting),
            "summarizing" => Ok(WorkflowState::Summarizing),
            "delivering" => Ok(WorkflowState::Delivering),
            "completed" => Ok(WorkflowState::Completed),
            "cancelled" => Ok(WorkflowState::Cancelled),
            "failed" => Ok(WorkflowState::Failed),
            _ => Err(format!("Unknown workflow state: {}", s)),
        }
    }
}

/// One applied transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEntry {
    pub from: WorkflowState,
    pub action: String,
    pub to: WorkflowState,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveWorkflow {
    pub id: String,
    pub user_id: String,
    pub workflow_type: WorkflowType,
    pub state: WorkflowState,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub history: Vec<StepEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ActiveWorkflow {
    /// Actions valid from the current state, universal ones included.
    pub fn available_actions(&self) -> Vec<&'static str> {
        transitions::actions_from(self.workflow_type, self.state)
    }
}
