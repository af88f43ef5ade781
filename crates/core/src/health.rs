//! Health rule chains for built-in kinds.
//!
//! Each kind maps to an ordered list of (predicate, factory) rules walked top
//! to bottom; the first rule whose predicate holds produces the condition.
//! Every chain ends in an always-true catch-all, so precedence stays explicit
//! and each branch can be unit tested on its own.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{Condition, NAMESPACE_KIND, NODE_KIND, POD_KIND, SERVICE_KIND};

/// Pods younger than this stay `Pending` while containers start.
pub const RECENT_POD_SECS: i64 = 60;

/// Evaluation context. Age-sensitive rules read the clock from here so tests
/// can pin it.
#[derive(Debug, Clone, Copy)]
pub struct Ctx {
    pub now: DateTime<Utc>,
}

impl Default for Ctx {
    fn default() -> Self {
        Self { now: Utc::now() }
    }
}

impl Ctx {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self { now }
    }
}

/// One step of a health chain.
pub struct Rule<T: ?Sized + 'static> {
    pub name: &'static str,
    pub applies: fn(&T, &Ctx) -> bool,
    pub produce: fn(&T, &Ctx) -> Condition,
}

/// Walk a chain in order; the first matching rule wins.
pub fn first_match<T: ?Sized>(rules: &[Rule<T>], subject: &T, ctx: &Ctx) -> Option<Condition> {
    rules
        .iter()
        .find(|r| (r.applies)(subject, ctx))
        .map(|r| (r.produce)(subject, ctx))
}

/// Chain registry for raw built-in kinds.
pub fn chain_for(kind_key: &str) -> Option<&'static [Rule<Value>]> {
    match kind_key {
        NODE_KIND => Some(NODE_RULES),
        POD_KIND => Some(POD_RULES),
        SERVICE_KIND => Some(SERVICE_RULES),
        NAMESPACE_KIND => Some(NAMESPACE_RULES),
        _ => None,
    }
}

/// Evaluate one object. Kinds without a registered chain read as `Running`.
pub fn evaluate(kind_key: &str, raw: &Value, ctx: &Ctx) -> Condition {
    chain_for(kind_key)
        .and_then(|rules| first_match(rules, raw, ctx))
        .unwrap_or_else(|| Condition::running("ok"))
}

fn deletion_requested(raw: &Value) -> bool {
    raw.pointer("/metadata/deletionTimestamp")
        .and_then(Value::as_str)
        .is_some()
}

fn phase(raw: &Value) -> &str {
    raw.pointer("/status/phase")
        .and_then(Value::as_str)
        .unwrap_or("")
}

fn conditions(raw: &Value) -> &[Value] {
    raw.pointer("/status/conditions")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn cond_type(c: &Value) -> &str {
    c.get("type").and_then(Value::as_str).unwrap_or("")
}

fn cond_status(c: &Value) -> &str {
    c.get("status").and_then(Value::as_str).unwrap_or("")
}

fn age_secs(raw: &Value, ctx: &Ctx) -> Option<i64> {
    raw.pointer("/metadata/creationTimestamp")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|created| (ctx.now - created.with_timezone(&Utc)).num_seconds())
}

/// `v1/Node`, in precedence order.
pub static NODE_RULES: &[Rule<Value>] = &[
    Rule {
        name: "terminating",
        applies: |raw, _| deletion_requested(raw),
        produce: |_, _| Condition::terminating("node is being deleted"),
    },
    Rule {
        name: "not-ready",
        applies: |raw, _| {
            conditions(raw)
                .iter()
                .any(|c| cond_type(c) == "Ready" && cond_status(c) != "True")
        },
        produce: |_, _| Condition::error("node is not ready"),
    },
    // Historical predicate kept verbatim: any Ready entry, or any False
    // status, defeats this rule. A node with Ready=True plus a pressure
    // condition set to True therefore falls through to "ready".
    Rule {
        name: "no-healthy-condition",
        applies: |raw, _| {
            conditions(raw)
                .iter()
                .all(|c| cond_type(c) != "Ready" && cond_status(c) != "False")
        },
        produce: |_, _| Condition::warning("node conditions look abnormal"),
    },
    Rule {
        name: "ready",
        applies: |_, _| true,
        produce: |_, _| Condition::running("node is ready"),
    },
];

/// `v1/Pod`, in precedence order.
pub static POD_RULES: &[Rule<Value>] = &[
    Rule {
        name: "terminating",
        applies: |raw, _| deletion_requested(raw),
        produce: |_, _| Condition::terminating("pod is being deleted"),
    },
    Rule {
        name: "succeeded",
        applies: |raw, _| phase(raw) == "Succeeded",
        produce: |_, _| Condition::done("pod completed"),
    },
    Rule {
        name: "failed",
        applies: |raw, _| phase(raw) == "Failed",
        produce: |_, _| Condition::error("pod failed"),
    },
    Rule {
        name: "starting",
        applies: |raw, ctx| {
            phase(raw) == "Pending" && age_secs(raw, ctx).map_or(false, |a| a < RECENT_POD_SECS)
        },
        produce: |_, _| Condition::pending("pod is starting"),
    },
    Rule {
        name: "nothing-true",
        applies: |raw, _| conditions(raw).iter().all(|c| cond_status(c) != "True"),
        produce: |_, _| Condition::warning("no pod condition is true"),
    },
    Rule {
        name: "unknown",
        applies: |raw, _| phase(raw) == "Unknown",
        produce: |_, _| Condition::error("pod state is unknown"),
    },
    Rule {
        name: "running",
        applies: |_, _| true,
        produce: |_, _| Condition::running("pod is running"),
    },
];

/// `v1/Service`, in precedence order.
pub static SERVICE_RULES: &[Rule<Value>] = &[
    Rule {
        name: "terminating",
        applies: |raw, _| deletion_requested(raw),
        produce: |_, _| Condition::terminating("service is being deleted"),
    },
    Rule {
        name: "lb-pending",
        applies: |raw, _| {
            raw.pointer("/spec/type").and_then(Value::as_str) == Some("LoadBalancer")
                && raw
                    .pointer("/status/loadBalancer/ingress")
                    .and_then(Value::as_array)
                    .map_or(true, Vec::is_empty)
        },
        produce: |_, _| Condition::pending("load balancer is provisioning"),
    },
    Rule {
        name: "available",
        applies: |_, _| true,
        produce: |_, _| Condition::running("service is available"),
    },
];

/// `v1/Namespace`, in precedence order. Namespace conditions signal problems
/// when their status is True (deletion stuck, discovery failures).
pub static NAMESPACE_RULES: &[Rule<Value>] = &[
    Rule {
        name: "terminating",
        applies: |raw, _| deletion_requested(raw),
        produce: |_, _| Condition::terminating("namespace is being deleted"),
    },
    Rule {
        name: "failing-conditions",
        applies: |raw, _| conditions(raw).iter().any(|c| cond_status(c) == "True"),
        produce: |_, _| Condition::warning("namespace reports failing conditions"),
    },
    Rule {
        name: "active",
        applies: |_, _| true,
        produce: |_, _| Condition::running("namespace is active"),
    },
];
