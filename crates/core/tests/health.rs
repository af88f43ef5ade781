#![forbid(unsafe_code)]

use chrono::{Duration, TimeZone, Utc};
use lookout_core::health::{self, Ctx};
use lookout_core::{ConditionStatus, NAMESPACE_KIND, NODE_KIND, POD_KIND, SERVICE_KIND};
use serde_json::{json, Value};

fn pinned() -> Ctx {
    Ctx::at(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
}

fn node_with_conditions(conds: Value) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Node",
        "metadata": {"name": "node-1"},
        "status": {"conditions": conds}
    })
}

fn pod(phase: &str, age_secs: i64, ctx: &Ctx) -> Value {
    let created = (ctx.now - Duration::seconds(age_secs)).to_rfc3339();
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"namespace": "default", "name": "web", "creationTimestamp": created},
        "status": {"phase": phase}
    })
}

#[test]
fn node_not_ready_is_error() {
    let ctx = pinned();
    let raw = node_with_conditions(json!([{"type": "Ready", "status": "False"}]));
    let c = health::evaluate(NODE_KIND, &raw, &ctx);
    assert_eq!(c.status, ConditionStatus::Error);
    assert_eq!(c.reason, "node is not ready");
}

#[test]
fn node_ready_with_pressure_still_runs() {
    // Ready=True defeats both the not-ready rule and the abnormal-conditions
    // rule, even while DiskPressure reports True.
    let ctx = pinned();
    let raw = node_with_conditions(json!([
        {"type": "Ready", "status": "True"},
        {"type": "DiskPressure", "status": "True"}
    ]));
    let c = health::evaluate(NODE_KIND, &raw, &ctx);
    assert_eq!(c.status, ConditionStatus::Running);
}

#[test]
fn node_without_conditions_warns() {
    let ctx = pinned();
    let raw = node_with_conditions(json!([]));
    assert_eq!(
        health::evaluate(NODE_KIND, &raw, &ctx).status,
        ConditionStatus::Warning
    );
}

#[test]
fn node_pressure_only_warns() {
    let ctx = pinned();
    let raw = node_with_conditions(json!([{"type": "MemoryPressure", "status": "True"}]));
    assert_eq!(
        health::evaluate(NODE_KIND, &raw, &ctx).status,
        ConditionStatus::Warning
    );
}

#[test]
fn node_deletion_wins_over_not_ready() {
    let ctx = pinned();
    let raw = json!({
        "apiVersion": "v1",
        "kind": "Node",
        "metadata": {"name": "node-1", "deletionTimestamp": "2024-05-01T11:00:00Z"},
        "status": {"conditions": [{"type": "Ready", "status": "False"}]}
    });
    assert_eq!(
        health::evaluate(NODE_KIND, &raw, &ctx).status,
        ConditionStatus::Terminating
    );
}

#[test]
fn pod_terminal_phases() {
    let ctx = pinned();
    let done = health::evaluate(POD_KIND, &pod("Succeeded", 3600, &ctx), &ctx);
    assert_eq!(done.status, ConditionStatus::Done);
    let failed = health::evaluate(POD_KIND, &pod("Failed", 3600, &ctx), &ctx);
    assert_eq!(failed.status, ConditionStatus::Error);
}

#[test]
fn young_pending_pod_is_starting() {
    let ctx = pinned();
    let c = health::evaluate(POD_KIND, &pod("Pending", 59, &ctx), &ctx);
    assert_eq!(c.status, ConditionStatus::Pending);
    assert_eq!(c.reason, "pod is starting");
}

#[test]
fn old_pending_pod_without_true_condition_warns() {
    // At 61s the starting window is over; with no conditions at all the
    // nothing-true rule matches vacuously.
    let ctx = pinned();
    let c = health::evaluate(POD_KIND, &pod("Pending", 61, &ctx), &ctx);
    assert_eq!(c.status, ConditionStatus::Warning);
    assert_eq!(c.reason, "no pod condition is true");
}

#[test]
fn running_pod_with_true_condition_runs() {
    let ctx = pinned();
    let mut raw = pod("Running", 3600, &ctx);
    raw["status"]["conditions"] = json!([{"type": "Ready", "status": "True"}]);
    assert_eq!(
        health::evaluate(POD_KIND, &raw, &ctx).status,
        ConditionStatus::Running
    );
}

#[test]
fn unknown_pod_phase_precedence() {
    // With no condition set to True the nothing-true rule fires before the
    // unknown-phase rule; with one, unknown-phase is reached.
    let ctx = pinned();
    let bare = pod("Unknown", 3600, &ctx);
    assert_eq!(
        health::evaluate(POD_KIND, &bare, &ctx).status,
        ConditionStatus::Warning
    );
    let mut with_cond = pod("Unknown", 3600, &ctx);
    with_cond["status"]["conditions"] = json!([{"type": "Initialized", "status": "True"}]);
    let c = health::evaluate(POD_KIND, &with_cond, &ctx);
    assert_eq!(c.status, ConditionStatus::Error);
    assert_eq!(c.reason, "pod state is unknown");
}

#[test]
fn pod_deletion_wins_over_phase() {
    let ctx = pinned();
    let mut raw = pod("Running", 3600, &ctx);
    raw["metadata"]["deletionTimestamp"] = json!("2024-05-01T11:59:00Z");
    assert_eq!(
        health::evaluate(POD_KIND, &raw, &ctx).status,
        ConditionStatus::Terminating
    );
}

#[test]
fn load_balancer_service_waits_for_ingress() {
    let ctx = pinned();
    let pending = json!({
        "apiVersion": "v1", "kind": "Service",
        "metadata": {"namespace": "default", "name": "lb"},
        "spec": {"type": "LoadBalancer"},
        "status": {"loadBalancer": {}}
    });
    let c = health::evaluate(SERVICE_KIND, &pending, &ctx);
    assert_eq!(c.status, ConditionStatus::Pending);

    let mut ready = pending.clone();
    ready["status"]["loadBalancer"]["ingress"] = json!([{"ip": "10.0.0.1"}]);
    assert_eq!(
        health::evaluate(SERVICE_KIND, &ready, &ctx).status,
        ConditionStatus::Running
    );
}

#[test]
fn cluster_ip_service_is_available() {
    let ctx = pinned();
    let raw = json!({
        "apiVersion": "v1", "kind": "Service",
        "metadata": {"namespace": "default", "name": "db"},
        "spec": {"type": "ClusterIP"}
    });
    assert_eq!(
        health::evaluate(SERVICE_KIND, &raw, &ctx).status,
        ConditionStatus::Running
    );
}

#[test]
fn namespace_conditions_and_deletion() {
    let ctx = pinned();
    let active = json!({
        "apiVersion": "v1", "kind": "Namespace",
        "metadata": {"name": "prod"},
        "status": {"phase": "Active"}
    });
    assert_eq!(
        health::evaluate(NAMESPACE_KIND, &active, &ctx).status,
        ConditionStatus::Running
    );

    let failing = json!({
        "apiVersion": "v1", "kind": "Namespace",
        "metadata": {"name": "prod"},
        "status": {"conditions": [{"type": "NamespaceDeletionContentFailure", "status": "True"}]}
    });
    assert_eq!(
        health::evaluate(NAMESPACE_KIND, &failing, &ctx).status,
        ConditionStatus::Warning
    );

    let deleting = json!({
        "apiVersion": "v1", "kind": "Namespace",
        "metadata": {"name": "prod", "deletionTimestamp": "2024-05-01T11:00:00Z"}
    });
    assert_eq!(
        health::evaluate(NAMESPACE_KIND, &deleting, &ctx).status,
        ConditionStatus::Terminating
    );
}

#[test]
fn kinds_without_chain_default_to_running() {
    let ctx = pinned();
    let raw = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cfg"}});
    let c = health::evaluate("v1/ConfigMap", &raw, &ctx);
    assert_eq!(c.status, ConditionStatus::Running);
    assert_eq!(c.reason, "ok");
}

#[test]
fn chain_order_is_stable() {
    let pod_names: Vec<&str> = health::chain_for(POD_KIND)
        .unwrap()
        .iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(
        pod_names,
        [
            "terminating",
            "succeeded",
            "failed",
            "starting",
            "nothing-true",
            "unknown",
            "running"
        ]
    );
    let node_names: Vec<&str> = health::chain_for(NODE_KIND)
        .unwrap()
        .iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(
        node_names,
        ["terminating", "not-ready", "no-healthy-condition", "ready"]
    );
}
