use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The eight states of the job lifecycle.
///
/// `Completed`, `Failed` and `Cancelled` are terminal. `Crashed` is set
/// externally by the crash-detection sweep and is recoverable via resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Resuming,
    Completed,
    Failed,
    Cancelled,
    Crashed,
}

pub const ALL_STATUSES: [JobStatus; 8] = [
    JobStatus::Pending,
    JobStatus::Running,
    JobStatus::Paused,
    JobStatus::Resuming,
    JobStatus::Completed,
    JobStatus::Failed,
    JobStatus::Cancelled,
    JobStatus::Crashed,
];

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Resuming => "resuming",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Crashed => "crashed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// A job actively occupying the engine. Active jobs cannot be removed.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Pending)
    }

    /// Only running or pending jobs may be paused.
    pub fn can_pause(&self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Pending)
    }

    /// Only paused or crashed jobs may be resumed.
    pub fn can_resume(&self) -> bool {
        matches!(self, JobStatus::Paused | JobStatus::Crashed)
    }

    /// Cancellation is allowed any time before a terminal state.
    pub fn can_cancel(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_remove(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "resuming" => Ok(JobStatus::Resuming),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "crashed" => Ok(JobStatus::Crashed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_round_trip() {
        for status in ALL_STATUSES {
            let parsed: JobStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn terminal_states_are_exactly_three() {
        let terminal: Vec<_> = ALL_STATUSES.iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(
            terminal,
            vec![
                &JobStatus::Completed,
                &JobStatus::Failed,
                &JobStatus::Cancelled
            ]
        );
        // Crashed is recoverable, not terminal.
        assert!(!JobStatus::Crashed.is_terminal());
    }

    #[test]
    fn pause_only_from_running_or_pending() {
        assert!(JobStatus::Running.can_pause());
        assert!(JobStatus::Pending.can_pause());
        for status in ALL_STATUSES {
            if status != JobStatus::Running && status != JobStatus::Pending {
                assert!(!status.can_pause(), "{} should not be pausable", status);
            }
        }
    }

    #[test]
    fn resume_only_from_paused_or_crashed() {
        assert!(JobStatus::Paused.can_resume());
        assert!(JobStatus::Crashed.can_resume());
        for status in ALL_STATUSES {
            if status != JobStatus::Paused && status != JobStatus::Crashed {
                assert!(!status.can_resume(), "{} should not be resumable", status);
            }
        }
    }

    #[test]
    fn cancel_blocked_only_by_terminal_states() {
        for status in ALL_STATUSES {
            assert_eq!(status.can_cancel(), !status.is_terminal());
        }
    }

    #[test]
    fn active_jobs_cannot_be_removed() {
        assert!(!JobStatus::Running.can_remove());
        assert!(!JobStatus::Pending.can_remove());
        assert!(JobStatus::Completed.can_remove());
        assert!(JobStatus::Paused.can_remove());
        assert!(JobStatus::Crashed.can_remove());
    }
}
