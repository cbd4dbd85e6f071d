use proptest::prelude::*;
use scenecraft_core::{
    filter, validate_transition, CapabilityDescriptor, Context, ExclusionSet, PassPhase,
    StageKind, StageOutput, STANDARD_EXCLUSIONS,
};
use std::path::Path;

fn capability_name() -> impl Strategy<Value = String> {
    prop_oneof![
        proptest::sample::select(STANDARD_EXCLUSIONS.to_vec()).prop_map(str::to_string),
        "[a-z_]{1,24}",
    ]
}

proptest! {
    #[test]
    fn prop_filter_never_returns_excluded(names in proptest::collection::vec(capability_name(), 0..30)) {
        let excluded = ExclusionSet::standard();
        let list: Vec<_> = names.iter().map(CapabilityDescriptor::new).collect();

        let once = filter(list.clone(), &excluded);
        prop_assert!(once.iter().all(|d| !excluded.contains(&d.name)));

        // Idempotent, order preserving
        let twice = filter(once.clone(), &excluded);
        prop_assert_eq!(&once, &twice);
        let kept: Vec<_> = list.into_iter().filter(|d| !excluded.contains(&d.name)).collect();
        prop_assert_eq!(once, kept);
    }

    #[test]
    fn prop_context_survives_serialization(
        prompt in "[a-zA-Z ]{1,40}",
        summary in proptest::option::of("[a-zA-Z ]{1,40}"),
        code in proptest::option::of("[a-z_()\n ]{1,40}"),
        passes in 0u32..6,
    ) {
        let mut ctx = Context::new(prompt, "").unwrap();
        if let Some(summary) = summary {
            ctx.apply(StageOutput::VisionSummary(summary));
        }
        if let Some(code) = code {
            ctx.apply(StageOutput::GeneratedCode(code));
        }
        for _ in 0..passes {
            ctx = ctx.rewrite_for_next_pass(Path::new("/tmp/render.png"), None, None);
        }

        let json = serde_json::to_string(&ctx).unwrap();
        let back: Context = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(&back, &ctx);

        let a = ctx.rewrite_for_next_pass(Path::new("/tmp/render.png"), Some("cmp".into()), None);
        let b = back.rewrite_for_next_pass(Path::new("/tmp/render.png"), Some("cmp".into()), None);
        prop_assert_eq!(a, b);
    }

    #[test]
    fn prop_only_forward_steps_are_legal(from in 0usize..4, to in 0usize..4) {
        let sequence = [StageKind::Vision, StageKind::Plan, StageKind::Code, StageKind::ToolExecution];
        let result = validate_transition(
            &sequence,
            PassPhase::Stage(sequence[from]),
            PassPhase::Stage(sequence[to]),
        );
        prop_assert_eq!(result.is_ok(), to == from + 1);
    }
}
