//! Task types: specifications, coverage policies, the Task record.

use crate::{CoreError, TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How broadly a task should explore the application under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CoveragePolicy {
    /// Explore every reachable screen until the app is exhausted.
    Exhaustive,
    /// Explore until the action budget is spent.
    Bounded { max_actions: u32 },
    /// Explore only the given navigation paths.
    Custom { paths: Vec<String> },
}

impl CoveragePolicy {
    /// Structural well-formedness check used at admission.
    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            Self::Exhaustive => Ok(()),
            Self::Bounded { max_actions } if *max_actions == 0 => Err(CoreError::InvalidSpec(
                "bounded coverage requires max_actions >= 1".to_string(),
            )),
            Self::Bounded { .. } => Ok(()),
            Self::Custom { paths } if paths.is_empty() => Err(CoreError::InvalidSpec(
                "custom coverage requires at least one path".to_string(),
            )),
            Self::Custom { .. } => Ok(()),
        }
    }
}

/// The requested shape of an exploration task, as submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Identifier of the application build under test.
    pub app_version: String,

    /// Exploration breadth/path-selection strategy.
    pub coverage: CoveragePolicy,

    /// How many devices the task wants to fan out across.
    pub device_count: u32,

    /// Higher numeric priority dispatches first.
    pub priority: i32,

    /// Navigation paths the exploration must skip.
    pub excluded_paths: Vec<String>,

    /// Capability tags a device must carry to be matched.
    pub required_tags: Vec<String>,
}

impl TaskSpec {
    /// Create a spec with defaults: one device, priority 0, exhaustive.
    pub fn new(app_version: impl Into<String>) -> Self {
        Self {
            app_version: app_version.into(),
            coverage: CoveragePolicy::Exhaustive,
            device_count: 1,
            priority: 0,
            excluded_paths: Vec::new(),
            required_tags: Vec::new(),
        }
    }

    /// Builder method to set the coverage policy.
    pub fn with_coverage(mut self, coverage: CoveragePolicy) -> Self {
        self.coverage = coverage;
        self
    }

    /// Builder method to set the requested device count.
    pub fn with_device_count(mut self, count: u32) -> Self {
        self.device_count = count;
        self
    }

    /// Builder method to set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Builder method to add a required capability tag.
    pub fn with_required_tag(mut self, tag: impl Into<String>) -> Self {
        self.required_tags.push(tag.into());
        self
    }

    /// Structural preconditions checked before scheduling. Full request
    /// validation is the admission layer's job.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.device_count == 0 {
            return Err(CoreError::InvalidSpec(
                "device_count must be >= 1".to_string(),
            ));
        }
        self.coverage.validate()
    }
}

/// A Task represents one requested unit of exploration work, fanned out
/// across one or more devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    /// The submitted specification.
    pub spec: TaskSpec,

    /// Current task status.
    pub status: TaskStatus,

    /// Who created this task.
    pub created_by: String,

    /// When the task was created.
    pub created_at: DateTime<Utc>,

    /// When the task reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,

    /// Human-readable reason when the task failed.
    pub failure_reason: Option<String>,

    /// Set when this task was created by retrying another task.
    pub retry_of: Option<TaskId>,
}

impl Task {
    /// Create a new Task in Queued status.
    pub fn new(spec: TaskSpec, created_by: impl Into<String>) -> Self {
        Self {
            id: TaskId::generate(),
            spec,
            status: TaskStatus::Queued,
            created_by: created_by.into(),
            created_at: Utc::now(),
            finished_at: None,
            failure_reason: None,
            retry_of: None,
        }
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
