//! Execution status state machine.
//!
//! Shared by plan executions and node executions. Transitions are checked
//! against [`Status::can_transition_to`] before anything is persisted.

use serde::{Deserialize, Serialize};

/// Status of a plan execution or node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Queued,
    Running,
    Succeeded,
    Failed,
    Errored,
    Expired,
    Aborted,
    Skipped,
    Suspended,
}

impl Status {
    /// FAILED, ERRORED, EXPIRED or ABORTED.
    pub fn is_broke(self) -> bool {
        matches!(
            self,
            Status::Failed | Status::Errored | Status::Expired | Status::Aborted
        )
    }

    /// Broke statuses plus SUCCEEDED and SKIPPED.
    pub fn is_terminal(self) -> bool {
        self.is_broke() || matches!(self, Status::Succeeded | Status::Skipped)
    }

    /// Statuses a RETRY interrupt may restart from.
    pub fn is_retryable(self) -> bool {
        matches!(self, Status::Failed | Status::Errored | Status::Expired)
    }

    /// Whether `self -> to` is an allowed edge.
    ///
    /// Terminal statuses have no outgoing edges; a retry starts a fresh
    /// attempt instead of transitioning.
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        match self {
            Queued => matches!(to, Running | Skipped | Aborted | Errored | Expired | Failed),
            Running => matches!(
                to,
                Succeeded | Failed | Errored | Expired | Aborted | Skipped | Suspended
            ),
            Suspended => matches!(to, Running | Aborted | Expired | Errored),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Queued => "QUEUED",
            Status::Running => "RUNNING",
            Status::Succeeded => "SUCCEEDED",
            Status::Failed => "FAILED",
            Status::Errored => "ERRORED",
            Status::Expired => "EXPIRED",
            Status::Aborted => "ABORTED",
            Status::Skipped => "SKIPPED",
            Status::Suspended => "SUSPENDED",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reduce a set of sibling outcomes into one status.
///
/// Priority is ABORTED, FAILED, EXPIRED, ERRORED. All-skipped (or empty)
/// yields SKIPPED; anything else SUCCEEDED. Entries flagged as ignored
/// failures count as succeeded.
pub fn reduce_statuses<I>(outcomes: I) -> Status
where
    I: IntoIterator<Item = (Status, bool)>,
{
    let mut seen_any = false;
    let mut all_skipped = true;
    let mut aborted = false;
    let mut failed = false;
    let mut expired = false;
    let mut errored = false;

    for (status, ignored) in outcomes {
        seen_any = true;
        let effective = if ignored && status.is_broke() {
            Status::Succeeded
        } else {
            status
        };
        if effective != Status::Skipped {
            all_skipped = false;
        }
        match effective {
            Status::Aborted => aborted = true,
            Status::Failed => failed = true,
            Status::Expired => expired = true,
            Status::Errored => errored = true,
            _ => {}
        }
    }

    if aborted {
        Status::Aborted
    } else if failed {
        Status::Failed
    } else if expired {
        Status::Expired
    } else if errored {
        Status::Errored
    } else if !seen_any || all_skipped {
        Status::Skipped
    } else {
        Status::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Status; 9] = [
        Status::Queued,
        Status::Running,
        Status::Succeeded,
        Status::Failed,
        Status::Errored,
        Status::Expired,
        Status::Aborted,
        Status::Skipped,
        Status::Suspended,
    ];

    #[test]
    fn test_terminal_statuses_have_no_exits() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{} -> {} allowed", from, to);
            }
        }
    }

    #[test]
    fn test_suspended_resumes_only_to_running() {
        assert!(Status::Suspended.can_transition_to(Status::Running));
        assert!(Status::Suspended.can_transition_to(Status::Aborted));
        assert!(!Status::Suspended.can_transition_to(Status::Succeeded));
        assert!(!Status::Suspended.can_transition_to(Status::Queued));
    }

    #[test]
    fn test_queued_can_be_forced() {
        assert!(Status::Queued.can_transition_to(Status::Skipped));
        assert!(Status::Queued.can_transition_to(Status::Aborted));
        assert!(!Status::Queued.can_transition_to(Status::Succeeded));
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&Status::Succeeded).unwrap();
        assert_eq!(json, "\"SUCCEEDED\"");
        let status: Status = serde_json::from_str("\"EXPIRED\"").unwrap();
        assert_eq!(status, Status::Expired);
    }

    #[test]
    fn test_reduce_priority() {
        let reduced = reduce_statuses(vec![
            (Status::Succeeded, false),
            (Status::Errored, false),
            (Status::Failed, false),
        ]);
        assert_eq!(reduced, Status::Failed);

        let reduced = reduce_statuses(vec![(Status::Failed, false), (Status::Aborted, false)]);
        assert_eq!(reduced, Status::Aborted);
    }

    #[test]
    fn test_reduce_ignored_and_skipped() {
        let reduced = reduce_statuses(vec![(Status::Failed, true), (Status::Skipped, false)]);
        assert_eq!(reduced, Status::Succeeded);

        let reduced = reduce_statuses(vec![(Status::Skipped, false), (Status::Skipped, false)]);
        assert_eq!(reduced, Status::Skipped);

        assert_eq!(reduce_statuses(Vec::new()), Status::Skipped);
    }
}
