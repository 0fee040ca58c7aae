//! Run lifecycle phases

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle phase of a run
///
/// Transitions are monotonic: a run moves forward through
/// `Pending -> Running -> {Succeeded | Failed | Unknown}` and never leaves a
/// terminal phase. `Unknown` is the fallback when observation of the
/// resource was lost before a terminal phase was seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Resource accepted, container not yet started
    Pending,
    /// Container executing
    Running,
    /// Container exited successfully
    Succeeded,
    /// Container exited with an error or was killed by its deadline
    Failed,
    /// Observation lost before a terminal phase was seen
    Unknown,
}

impl Phase {
    /// True for `Succeeded`, `Failed` and `Unknown`
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Unknown)
    }

    /// True once the container has definitely started and output can be attached
    ///
    /// `Unknown` is not loggable: nothing is known about the container.
    pub fn is_loggable(self) -> bool {
        matches!(self, Self::Running | Self::Succeeded | Self::Failed)
    }

    /// Position in the forward-only lifecycle; all terminal phases share a rank
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Succeeded | Self::Failed | Self::Unknown => 2,
        }
    }

    /// Whether moving from `self` to `next` respects monotonicity
    pub fn can_transition_to(self, next: Phase) -> bool {
        !self.is_terminal() && next != self && next.rank() >= self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unrecognised phase name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown phase '{0}'")]
pub struct PhaseParseError(pub String);

impl FromStr for Phase {
    type Err = PhaseParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "unknown" => Ok(Self::Unknown),
            _ => Err(PhaseParseError(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_and_loggable() {
        assert!(!Phase::Pending.is_terminal());
        assert!(!Phase::Running.is_terminal());
        assert!(Phase::Succeeded.is_terminal());
        assert!(Phase::Failed.is_terminal());
        assert!(Phase::Unknown.is_terminal());

        assert!(!Phase::Pending.is_loggable());
        assert!(Phase::Running.is_loggable());
        assert!(Phase::Succeeded.is_loggable());
        assert!(Phase::Failed.is_loggable());
        assert!(!Phase::Unknown.is_loggable());
    }

    #[test]
    fn test_monotonic_transitions() {
        assert!(Phase::Pending.can_transition_to(Phase::Running));
        assert!(Phase::Pending.can_transition_to(Phase::Failed));
        assert!(Phase::Running.can_transition_to(Phase::Succeeded));
        assert!(Phase::Running.can_transition_to(Phase::Unknown));

        assert!(!Phase::Running.can_transition_to(Phase::Pending));
        assert!(!Phase::Running.can_transition_to(Phase::Running));
        assert!(!Phase::Succeeded.can_transition_to(Phase::Failed));
        assert!(!Phase::Unknown.can_transition_to(Phase::Succeeded));
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("running".parse::<Phase>().unwrap(), Phase::Running);
        assert_eq!("Succeeded".parse::<Phase>().unwrap(), Phase::Succeeded);
        assert!("Exploded".parse::<Phase>().is_err());
        assert_eq!(Phase::Failed.to_string(), "Failed");
    }
}
