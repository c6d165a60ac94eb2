use std::fmt;

/// Lifecycle of one command buffer recording.
///
/// ```text
/// Recording -> Submitted -> AwaitingCompletion -> Harvested
///                  ^               |                  |
///                  +---------------+------------------+  resubmitted
///
/// any live state -> Retired (harvested, abandoned, reset or device lost)
/// ```
///
/// A harvested recording stays `Harvested` while its command buffer can still be
/// submitted; it retires when the command buffer is recorded again or freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubmissionState {
    Recording,
    Submitted,
    AwaitingCompletion,
    Harvested,
    Retired(RetireReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetireReason {
    /// Results were decoded before the recording went away.
    Harvested,
    DeviceLost,
    /// Cancelled by the application or engine teardown.
    Abandoned,
    /// The command buffer was recorded again.
    Reset,
}

impl SubmissionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recording => "recording",
            Self::Submitted => "submitted",
            Self::AwaitingCompletion => "awaiting completion",
            Self::Harvested => "harvested",
            Self::Retired(_) => "retired",
        }
    }

    pub fn is_retired(self) -> bool {
        matches!(self, Self::Retired(_))
    }

    /// GPU work may still reference the context's buffers.
    pub fn in_flight(self) -> bool {
        matches!(self, Self::Submitted | Self::AwaitingCompletion)
    }

    /// Allowed forward transitions. Retirement is allowed from any live state.
    pub fn can_advance_to(self, next: SubmissionState) -> bool {
        use SubmissionState::*;
        match (self, next) {
            (Retired(_), _) => false,
            (_, Retired(_)) => true,
            (Recording | AwaitingCompletion | Harvested, Submitted) => true,
            (Submitted, AwaitingCompletion) => true,
            (AwaitingCompletion, Harvested) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retired(reason) => write!(f, "retired ({reason:?})"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_only_move_forward() {
        use SubmissionState::*;
        assert!(Recording.can_advance_to(Submitted));
        assert!(Submitted.can_advance_to(AwaitingCompletion));
        assert!(AwaitingCompletion.can_advance_to(Harvested));
        assert!(AwaitingCompletion.can_advance_to(Retired(RetireReason::DeviceLost)));
        assert!(Harvested.can_advance_to(Submitted));
        assert!(AwaitingCompletion.can_advance_to(Submitted));
        assert!(!Recording.can_advance_to(Harvested));
        assert!(!Harvested.can_advance_to(AwaitingCompletion));
        assert!(!Submitted.can_advance_to(Recording));
        assert!(!Retired(RetireReason::Harvested).can_advance_to(Retired(RetireReason::Reset)));
        assert!(Submitted.in_flight());
        assert!(!Harvested.in_flight());
    }
}
