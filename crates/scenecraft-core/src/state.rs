use crate::stages::StageKind;
use std::fmt;

/// Phase of one pass through a workflow graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassPhase {
    Entry,
    Stage(StageKind),
    Terminal,
    Failed,
}

impl fmt::Display for PassPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassPhase::Entry => f.write_str("entry"),
            PassPhase::Stage(kind) => write!(f, "{kind}"),
            PassPhase::Terminal => f.write_str("terminal"),
            PassPhase::Failed => f.write_str("failed"),
        }
    }
}

/// Illegal phase change
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal pass transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: PassPhase,
    pub to: PassPhase,
}

/// Validates a phase change against the graph's stage order.
///
/// `sequence` is the straight-line stage order of the graph being run.
pub fn validate_transition(
    sequence: &[StageKind],
    from: PassPhase,
    to: PassPhase,
) -> Result<(), TransitionError> {
    if allowed_transitions(sequence, from).contains(&to) {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}

pub fn allowed_transitions(sequence: &[StageKind], from: PassPhase) -> Vec<PassPhase> {
    use PassPhase::{Entry, Failed, Stage, Terminal};
    match from {
        Entry => match sequence.first() {
            Some(first) => vec![Stage(*first), Failed],
            None => vec![Terminal],
        },
        Stage(kind) => {
            let next = sequence
                .iter()
                .position(|k| *k == kind)
                .and_then(|i| sequence.get(i + 1));
            match next {
                Some(next) => vec![Stage(*next), Failed],
                None => vec![Terminal, Failed],
            }
        }
        Terminal | Failed => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CODE_FIRST: [StageKind; 4] = [
        StageKind::Vision,
        StageKind::Plan,
        StageKind::Code,
        StageKind::ToolExecution,
    ];

    #[test]
    fn straight_line_is_allowed() {
        let mut phase = PassPhase::Entry;
        for kind in CODE_FIRST {
            validate_transition(&CODE_FIRST, phase, PassPhase::Stage(kind)).unwrap();
            phase = PassPhase::Stage(kind);
        }
        validate_transition(&CODE_FIRST, phase, PassPhase::Terminal).unwrap();
    }

    #[test]
    fn skipping_a_stage_is_rejected() {
        let err = validate_transition(
            &CODE_FIRST,
            PassPhase::Stage(StageKind::Vision),
            PassPhase::Stage(StageKind::Code),
        )
        .unwrap_err();
        assert!(err.to_string().contains("vision -> code"));
    }

    #[test]
    fn terminal_states_are_final() {
        assert!(allowed_transitions(&CODE_FIRST, PassPhase::Terminal).is_empty());
        assert!(allowed_transitions(&CODE_FIRST, PassPhase::Failed).is_empty());
    }

    #[test]
    fn any_stage_may_fail() {
        for kind in CODE_FIRST {
            assert!(allowed_transitions(&CODE_FIRST, PassPhase::Stage(kind)).contains(&PassPhase::Failed));
        }
    }
}
