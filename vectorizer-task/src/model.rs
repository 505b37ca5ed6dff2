//! The task state blob and its constituent types.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the seven states a task can occupy. See spec §4.1 for the
/// full transition table.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Resuming,
    Complete,
    Error,
    Canceled,
}

impl TaskStatus {
    /// Terminal states a task cannot leave except via explicit retry
    /// (`error` only).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Complete | TaskStatus::Error | TaskStatus::Canceled
        )
    }

    /// Statuses that warrant a queue marker: a worker should pick these up.
    pub fn is_runnable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Resuming)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Resuming => "resuming",
            TaskStatus::Complete => "complete",
            TaskStatus::Error => "error",
            TaskStatus::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

/// Immutable creation payload, set once by the controller and never
/// rewritten thereafter.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TaskInit {
    pub input_file: String,
    pub output_file: String,
}

/// Progress of a running (or previously running) task, reported by the
/// worker at chunk boundaries.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct Progress {
    pub count: u64,
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_rate: Option<f64>,
}

/// The full JSON task state blob stored at `tasks/{id}`.
///
/// Known fields are typed explicitly; anything else round-trips through
/// `other_fields` untouched, so a writer running a newer schema doesn't
/// clobber fields an older reader doesn't know about.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TaskData {
    pub status: TaskStatus,
    pub init: TaskInit,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub other_fields: BTreeMap<String, serde_json::Value>,
}

impl TaskData {
    pub fn new_pending(init: TaskInit) -> Self {
        TaskData {
            status: TaskStatus::Pending,
            init,
            progress: None,
            result: None,
            error: None,
            other_fields: BTreeMap::new(),
        }
    }
}

/// The reason a running task was interrupted, as written by the
/// controller to `interrupt/{id}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterruptReason {
    Pause,
    Cancel,
}

impl InterruptReason {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            InterruptReason::Pause => b"pause",
            InterruptReason::Cancel => b"cancel",
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"pause" => Some(InterruptReason::Pause),
            b"cancel" => Some(InterruptReason::Cancel),
            _ => None,
        }
    }

    /// The status a running task moves to once this interrupt is honored.
    pub fn target_status(&self) -> TaskStatus {
        match self {
            InterruptReason::Pause => TaskStatus::Paused,
            InterruptReason::Cancel => TaskStatus::Canceled,
        }
    }
}

impl fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_lowercase() {
        let json = serde_json::to_string(&TaskStatus::Resuming).unwrap();
        assert_eq!(json, "\"resuming\"");
        let back: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TaskStatus::Resuming);
    }

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let data = TaskData {
            status: TaskStatus::Running,
            init: TaskInit {
                input_file: "a.jsonl".into(),
                output_file: "a.vec".into(),
            },
            progress: None,
            result: None,
            error: None,
            other_fields: BTreeMap::new(),
        };
        let mut json: serde_json::Value = serde_json::to_value(&data).unwrap();
        json.as_object_mut()
            .unwrap()
            .insert("future_field".into(), serde_json::json!(42));

        let parsed: TaskData = serde_json::from_value(json).unwrap();
        assert_eq!(
            parsed.other_fields.get("future_field"),
            Some(&serde_json::json!(42))
        );

        let reserialized = serde_json::to_value(&parsed).unwrap();
        assert_eq!(reserialized["future_field"], serde_json::json!(42));
    }

    #[test]
    fn runnable_and_terminal_are_disjoint() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Paused,
            TaskStatus::Resuming,
            TaskStatus::Complete,
            TaskStatus::Error,
            TaskStatus::Canceled,
        ] {
            assert!(!(status.is_runnable() && status.is_terminal()), "{status}");
        }
    }

    #[test]
    fn interrupt_reason_bytes_round_trip() {
        assert_eq!(
            InterruptReason::from_bytes(InterruptReason::Pause.as_bytes()),
            Some(InterruptReason::Pause)
        );
        assert_eq!(InterruptReason::from_bytes(b"bogus"), None);
    }
}
