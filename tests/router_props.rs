//! Property tests for the routing tag: arbitrary delta interleavings never
//! drop it, and checkpoint round-trips never change a routing decision.

use proptest::prelude::*;

use curricle::checkpoint::{Checkpoint, PersistedCheckpoint};
use curricle::graph::{RouteTarget, Router, RouterError};
use curricle::state::{HistoryEntry, StateDelta, WorkflowState};
use curricle::types::{EditSource, NodeId};

#[derive(Clone, Debug)]
enum TagOp {
    SetValidation,
    SetHuman,
    Clear,
    /// A delta that says nothing about the tag (the common case, and the
    /// historical bug vector).
    Unrelated,
}

fn tag_op() -> impl Strategy<Value = TagOp> {
    prop_oneof![
        Just(TagOp::SetValidation),
        Just(TagOp::SetHuman),
        Just(TagOp::Clear),
        Just(TagOp::Unrelated),
        // Unrelated deltas dominate in practice; weight them up.
        Just(TagOp::Unrelated),
        Just(TagOp::Unrelated),
    ]
}

fn expected_route(tag: Option<EditSource>) -> Result<RouteTarget, RouterError> {
    match tag {
        Some(EditSource::HumanReview) => Ok(RouteTarget::SuspendForReview),
        Some(EditSource::ValidationFailed) => Ok(RouteTarget::Run(NodeId::Validate)),
        None => Err(RouterError::MissingEditSource { node: NodeId::Edit }),
    }
}

proptest! {
    /// Merging any sequence of deltas leaves the tag exactly where the last
    /// explicit write put it; deltas that do not mention it preserve it.
    #[test]
    fn carry_forward_never_drops_the_tag(ops in prop::collection::vec(tag_op(), 0..16)) {
        let mut state = WorkflowState::new("goal");
        let mut expected = None;

        for op in &ops {
            let delta = match op {
                TagOp::SetValidation => {
                    expected = Some(EditSource::ValidationFailed);
                    StateDelta::new().set_edit_source(EditSource::ValidationFailed)
                }
                TagOp::SetHuman => {
                    expected = Some(EditSource::HumanReview);
                    StateDelta::new().set_edit_source(EditSource::HumanReview)
                }
                TagOp::Clear => {
                    expected = None;
                    StateDelta::new().clear_edit_source()
                }
                TagOp::Unrelated => StateDelta::new()
                    .with_validation_round(1)
                    .with_history(HistoryEntry::new(NodeId::Edit, "unrelated")),
            };
            delta.apply(&mut state);
        }

        prop_assert_eq!(state.edit_source, expected);
        prop_assert_eq!(Router::route_after_edit(&state), expected_route(expected));
    }

    /// Save-then-load yields the identical routing decision.
    #[test]
    fn checkpoint_roundtrip_preserves_routing(tag in prop_oneof![
        Just(None),
        Just(Some(EditSource::ValidationFailed)),
        Just(Some(EditSource::HumanReview)),
    ]) {
        let mut state = WorkflowState::new("goal");
        state.edit_source = tag;
        let decision_before = Router::route_after_edit(&state);

        let checkpoint = Checkpoint::new("t1", NodeId::Edit, state);
        let persisted = PersistedCheckpoint::from(&checkpoint);
        let json = serde_json::to_string(&persisted).unwrap();
        let restored: PersistedCheckpoint = serde_json::from_str(&json).unwrap();
        let restored = Checkpoint::try_from(restored).unwrap();

        prop_assert_eq!(Router::route_after_edit(&restored.state), decision_before);
    }
}
