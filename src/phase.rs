//! VM lifecycle phases and the legal transition relation.
//!
//! Phases form an append-only history per VM; the latest version is the
//! canonical state. The happy path runs
//! `creating → created → starting → running → stopping → stopped →
//! cleaning → cleaned`; each attempt phase has a matching terminal failure
//! state, every phase may transition into `cleaning` (the reconciler's
//! entry point), and self-transitions are allowed so repeated updates in
//! the same phase can refresh resources or errors.

use serde::{Deserialize, Serialize};

/// A named state in the per-VM lifecycle log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Creating,
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Cleaning,
    Cleaned,
    CreateFailed,
    StartFailed,
    StopFailed,
    CleanupFailed,
}

impl Phase {
    /// Whether this phase is a terminal failure state.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Phase::CreateFailed | Phase::StartFailed | Phase::StopFailed | Phase::CleanupFailed
        )
    }

    /// Whether a transition from `self` to `target` is legal.
    pub fn can_transition_to(&self, target: Phase) -> bool {
        use Phase::*;

        // Self-transitions refresh the record; every phase may enter
        // cleaning directly.
        if *self == target || target == Cleaning {
            return true;
        }

        matches!(
            (self, target),
            (Creating, Created)
                | (Creating, CreateFailed)
                | (Created, Starting)
                | (Starting, Running)
                | (Starting, StartFailed)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Stopping, StopFailed)
                | (Cleaning, Cleaned)
                | (Cleaning, CleanupFailed)
        )
    }

    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Creating => "creating",
            Phase::Created => "created",
            Phase::Starting => "starting",
            Phase::Running => "running",
            Phase::Stopping => "stopping",
            Phase::Stopped => "stopped",
            Phase::Cleaning => "cleaning",
            Phase::Cleaned => "cleaned",
            Phase::CreateFailed => "create_failed",
            Phase::StartFailed => "start_failed",
            Phase::StopFailed => "stop_failed",
            Phase::CleanupFailed => "cleanup_failed",
        }
    }
}

impl std::str::FromStr for Phase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Phase::Creating),
            "created" => Ok(Phase::Created),
            "starting" => Ok(Phase::Starting),
            "running" => Ok(Phase::Running),
            "stopping" => Ok(Phase::Stopping),
            "stopped" => Ok(Phase::Stopped),
            "cleaning" => Ok(Phase::Cleaning),
            "cleaned" => Ok(Phase::Cleaned),
            "create_failed" => Ok(Phase::CreateFailed),
            "start_failed" => Ok(Phase::StartFailed),
            "stop_failed" => Ok(Phase::StopFailed),
            "cleanup_failed" => Ok(Phase::CleanupFailed),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Phase; 12] = [
        Phase::Creating,
        Phase::Created,
        Phase::Starting,
        Phase::Running,
        Phase::Stopping,
        Phase::Stopped,
        Phase::Cleaning,
        Phase::Cleaned,
        Phase::CreateFailed,
        Phase::StartFailed,
        Phase::StopFailed,
        Phase::CleanupFailed,
    ];

    #[test]
    fn happy_path_is_legal() {
        let path = [
            Phase::Creating,
            Phase::Created,
            Phase::Starting,
            Phase::Running,
            Phase::Stopping,
            Phase::Stopped,
            Phase::Cleaning,
            Phase::Cleaned,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} must be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn failure_edges_are_legal() {
        assert!(Phase::Creating.can_transition_to(Phase::CreateFailed));
        assert!(Phase::Starting.can_transition_to(Phase::StartFailed));
        assert!(Phase::Stopping.can_transition_to(Phase::StopFailed));
        assert!(Phase::Cleaning.can_transition_to(Phase::CleanupFailed));
    }

    #[test]
    fn every_phase_may_self_transition_and_enter_cleaning() {
        for phase in ALL {
            assert!(phase.can_transition_to(phase), "{} -> self", phase);
            assert!(phase.can_transition_to(Phase::Cleaning), "{} -> cleaning", phase);
        }
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        assert!(!Phase::Creating.can_transition_to(Phase::Running));
        assert!(!Phase::Created.can_transition_to(Phase::Running));
        assert!(!Phase::Running.can_transition_to(Phase::Stopped));
        assert!(!Phase::Stopped.can_transition_to(Phase::Running));
        assert!(!Phase::Cleaned.can_transition_to(Phase::Creating));
        assert!(!Phase::CreateFailed.can_transition_to(Phase::Created));
        assert!(!Phase::CleanupFailed.can_transition_to(Phase::Cleaned));
        // Failure states never resume the happy path.
        for failure in [
            Phase::CreateFailed,
            Phase::StartFailed,
            Phase::StopFailed,
            Phase::CleanupFailed,
        ] {
            assert!(!failure.can_transition_to(Phase::Running));
        }
    }

    #[test]
    fn transition_relation_is_exactly_the_documented_set() {
        use std::collections::HashSet;

        let mut legal: HashSet<(Phase, Phase)> = [
            (Phase::Creating, Phase::Created),
            (Phase::Creating, Phase::CreateFailed),
            (Phase::Created, Phase::Starting),
            (Phase::Starting, Phase::Running),
            (Phase::Starting, Phase::StartFailed),
            (Phase::Running, Phase::Stopping),
            (Phase::Stopping, Phase::Stopped),
            (Phase::Stopping, Phase::StopFailed),
            (Phase::Cleaning, Phase::Cleaned),
            (Phase::Cleaning, Phase::CleanupFailed),
        ]
        .into_iter()
        .collect();
        for phase in ALL {
            legal.insert((phase, phase));
            legal.insert((phase, Phase::Cleaning));
        }

        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn string_round_trip() {
        for phase in ALL {
            assert_eq!(phase.as_str().parse::<Phase>(), Ok(phase));
        }
        assert!("bogus".parse::<Phase>().is_err());
    }

    #[test]
    fn serde_uses_snake_case() {
        assert_eq!(
            serde_json::to_string(&Phase::CreateFailed).unwrap(),
            "\"create_failed\""
        );
        let phase: Phase = serde_json::from_str("\"cleaning\"").unwrap();
        assert_eq!(phase, Phase::Cleaning);
    }
}
