//! Per-node state tracking within one instance reconcile pass

/// Resolution state of one graph node for one instance
///
/// Within a single observed generation a node only moves forward:
/// `NotStarted -> Pending -> Ready`, or `NotStarted -> Excluded`. A spec
/// change (new generation) resets the walk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NodeState {
    /// Not dispatched yet; a dependency is still converging
    #[default]
    NotStarted,
    /// An includeWhen predicate evaluated false; the node is skipped for
    /// this instance and never created
    Excluded,
    /// Object applied, readiness predicates not yet satisfied
    Pending,
    /// Object applied and every readyWhen predicate is true
    Ready,
}

impl NodeState {
    /// True once this node no longer blocks its dependents
    pub fn is_resolved(self) -> bool {
        matches!(self, Self::Ready | Self::Excluded)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "NotStarted"),
            Self::Excluded => write!(f, "Excluded"),
            Self::Pending => write!(f, "Pending"),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

/// Observed state of one node after a reconcile pass
#[derive(Clone, Debug, PartialEq)]
pub struct NodeRecord {
    /// Node id from the definition
    pub id: String,
    /// Resolution state
    pub state: NodeState,
    /// Explanation for non-Ready states
    pub message: Option<String>,
}

impl NodeRecord {
    /// Record a node in the given state with no message
    pub fn new(id: impl Into<String>, state: NodeState) -> Self {
        Self {
            id: id.into(),
            state,
            message: None,
        }
    }

    /// Attach an explanatory message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolved_states() {
        assert!(NodeState::Ready.is_resolved());
        assert!(NodeState::Excluded.is_resolved());
        assert!(!NodeState::Pending.is_resolved());
        assert!(!NodeState::NotStarted.is_resolved());
    }

    #[test]
    fn test_display() {
        assert_eq!(NodeState::Pending.to_string(), "Pending");
        assert_eq!(NodeState::default(), NodeState::NotStarted);
    }
}
