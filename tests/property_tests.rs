//! Property-based tests using proptest.
//!
//! Property tests verify state machine invariants and the record wire
//! format under arbitrary inputs, and that task records reject arbitrary
//! JSON without panicking.

use proptest::prelude::*;
use serde_json::{json, Value};

use taskcast::{TaskRecord, TaskStatus};

// ─── Arbitrary Strategies ───────────────────────────────────────────────────

fn arb_status() -> impl Strategy<Value = TaskStatus> {
    prop::sample::select(vec![
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Finished,
        TaskStatus::Failed,
    ])
}

fn arb_result() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(json!("")),
        "[a-zA-Z0-9 ]{0,40}".prop_map(Value::String),
        any::<i64>().prop_map(|n| json!(n)),
        ("[a-z]{1,10}", "[a-z]{0,20}").prop_map(|(k, v)| json!({ k: v })),
    ]
}

// ─── State Machine Invariants ───────────────────────────────────────────────

proptest! {
    #[test]
    fn terminal_states_accept_nothing(from in arb_status(), to in arb_status()) {
        if from.is_terminal() {
            prop_assert!(!from.can_transition_to(&to));
        }
    }

    #[test]
    fn no_self_transitions(status in arb_status()) {
        prop_assert!(!status.can_transition_to(&status));
    }

    #[test]
    fn nothing_returns_to_pending(from in arb_status()) {
        prop_assert!(!from.can_transition_to(&TaskStatus::Pending));
    }

    #[test]
    fn random_walks_stay_monotonic(steps in proptest::collection::vec(arb_status(), 0..20)) {
        let rank = |s: TaskStatus| match s {
            TaskStatus::Pending => 0,
            TaskStatus::Running => 1,
            TaskStatus::Finished | TaskStatus::Failed => 2,
        };
        let mut record = TaskRecord::pending("walk");
        for next in steps {
            let before = record.status;
            match record.clone().transition(next) {
                Ok(moved) => {
                    prop_assert!(rank(moved.status) > rank(before));
                    record = moved;
                },
                Err(_) => prop_assert!(!before.can_transition_to(&next)),
            }
        }
    }

    #[test]
    fn validate_agrees_with_can_transition(from in arb_status(), to in arb_status()) {
        prop_assert_eq!(
            from.validate_transition("x", &to).is_ok(),
            from.can_transition_to(&to)
        );
    }
}

// ─── Wire Format ────────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn record_serializes_to_exactly_three_keys(
        id in "[a-zA-Z0-9-]{1,36}",
        status in arb_status(),
        result in arb_result(),
    ) {
        let record = TaskRecord { id: id.clone(), status, result: result.clone() };
        let value = serde_json::to_value(&record).unwrap();
        let object = value.as_object().unwrap();
        prop_assert_eq!(object.len(), 3);
        prop_assert_eq!(&object["id"], &json!(id));
        prop_assert_eq!(&object["status"], &json!(status.to_string()));
        prop_assert_eq!(&object["result"], &result);
    }

    #[test]
    fn arbitrary_json_never_panics(raw in "\\PC{0,200}") {
        let _ = serde_json::from_str::<TaskRecord>(&raw);
    }

    #[test]
    fn unknown_status_names_are_rejected(name in "[a-z_]{1,12}") {
        let known = ["pending", "running", "finished", "failed"];
        let parsed = serde_json::from_value::<TaskRecord>(
            json!({"id": "x", "status": name.clone(), "result": ""})
        );
        prop_assert_eq!(parsed.is_ok(), known.contains(&name.as_str()));
    }
}
