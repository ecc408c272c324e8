//! Reconcile planning scenarios, driven through the pure diff so no kernel
//! access is needed: first deployment, version upgrade, admin disable, and
//! mid-chain ordering.

use bpfchaind::chain::{plan, PlanAction, SlotSummary};
use bpfchaind::model::{order_by_seq, AdminStatus, ProgramSpec};

fn spec(name: &str, version: &str, seq: u32) -> ProgramSpec {
    serde_json::from_value(serde_json::json!({
        "name": name,
        "version": version,
        "artifact": format!("{name}.tar.gz"),
        "hook": "xdp_ingress",
        "seq_id": seq,
        "object_file": format!("{name}.bpf.o"),
        "entry_function": "xdp_prog",
        "map_name": format!("{name}_next_prog"),
    }))
    .unwrap()
}

fn slot(name: &str, version: &str) -> SlotSummary {
    SlotSummary {
        name: name.to_string(),
        version: version.to_string(),
        map_args: Default::default(),
        update_args: Default::default(),
    }
}

#[test]
fn scenario_first_deploy_inserts_program() {
    // desired=[foo v1.0] on an empty hook: the executor loads the root and
    // the plan contributes exactly one insert.
    let desired = vec![spec("foo", "1.0", 1)];
    let actions = plan(&[], &desired);

    assert_eq!(actions.len(), 1);
    match &actions[0] {
        PlanAction::Insert(s) => {
            assert_eq!(s.name, "foo");
            assert_eq!(s.map_name.as_deref(), Some("foo_next_prog"));
        }
        other => panic!("expected insert, got {other:?}"),
    }
}

#[test]
fn scenario_version_change_replaces_instance() {
    // desired=[foo v2.0] over installed foo v1.0: the old instance is
    // stopped and a fresh one started; neighbors relink around it.
    let actions = plan(&[slot("foo", "1.0")], &[spec("foo", "2.0", 1)]);

    assert_eq!(actions.len(), 1);
    assert!(matches!(&actions[0], PlanAction::Replace(s) if s.version == "2.0"));
}

#[test]
fn scenario_admin_disable_removes_from_chain() {
    let mut foo = spec("foo", "1.0", 1);
    foo.admin_status = AdminStatus::Disabled;

    let actions = plan(&[slot("foo", "1.0")], &[foo]);
    assert_eq!(actions, vec![PlanAction::Remove("foo".to_string())]);
}

#[test]
fn scenario_mixed_churn_removes_first_then_inserts() {
    // one removal, one upgrade, one insert in a single reconcile
    let current = vec![slot("alpha", "1.0"), slot("beta", "1.0")];
    let desired = vec![spec("beta", "2.0", 1), spec("gamma", "1.0", 2)];

    let actions = plan(&current, &desired);
    assert_eq!(actions.len(), 3);
    assert!(matches!(&actions[0], PlanAction::Remove(n) if n == "alpha"));
    assert!(matches!(&actions[1], PlanAction::Replace(s) if s.name == "beta"));
    assert!(matches!(&actions[2], PlanAction::Insert(s) if s.name == "gamma"));
}

#[test]
fn scenario_update_args_change_without_restart() {
    let mut desired = spec("foo", "1.0", 1);
    desired
        .update_args
        .insert("sampling".to_string(), serde_json::json!("1000"));

    let actions = plan(&[slot("foo", "1.0")], &[desired]);
    assert_eq!(actions.len(), 1);
    assert!(matches!(&actions[0], PlanAction::UpdateConfig(_)));
}

#[test]
fn desired_lists_are_ordered_by_sequence_number() {
    let mut desired = vec![spec("late", "1.0", 30), spec("early", "1.0", 10), spec("mid", "1.0", 20)];
    order_by_seq(&mut desired);

    let names: Vec<&str> = desired.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["early", "mid", "late"]);

    // a converged chain in that order plans to a no-op
    let current: Vec<SlotSummary> = desired
        .iter()
        .map(|s| slot(&s.name, &s.version))
        .collect();
    assert!(plan(&current, &desired).is_empty());
}

#[test]
fn reconcile_is_idempotent_at_plan_level() {
    let desired = vec![spec("foo", "1.0", 1), spec("bar", "1.0", 2)];

    // first pass: two inserts
    let first = plan(&[], &desired);
    assert_eq!(first.len(), 2);

    // after applying, the same desired list plans to nothing
    let current = vec![slot("foo", "1.0"), slot("bar", "1.0")];
    assert!(plan(&current, &desired).is_empty());
}
