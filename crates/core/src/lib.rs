//! Lookout core types: watch events, change operations, kind snapshots.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod health;

/// Object key within one kind: `ns/name` for namespaced objects, `name` otherwise.
pub type Identity = String;

/// Routing key for a kind store: `v1/Pod`, `rbac.authorization.k8s.io/v1/Role`, ...
pub type KindKey = String;

pub const NODE_KIND: &str = "v1/Node";
pub const POD_KIND: &str = "v1/Pod";
pub const SERVICE_KIND: &str = "v1/Service";
pub const NAMESPACE_KIND: &str = "v1/Namespace";

/// Wire-level watch event kinds. The uppercase aliases accept recorded
/// `kubectl get --watch -o json` streams as-is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    #[serde(alias = "ADDED")]
    Create,
    #[serde(alias = "MODIFIED")]
    Update,
    #[serde(alias = "DELETED")]
    Delete,
    Generic,
}

/// One change notification as delivered by the cluster watch bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Raw object payload, kept verbatim.
    pub object: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OpKind {
    Upsert,
    Delete,
}

/// A queued mutation. Kind key and identity are derived from the payload at
/// ingest time so the flush path never re-inspects routing fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeOp {
    pub kind_key: KindKey,
    pub identity: Identity,
    pub op: OpKind,
    pub raw: Value,
}

impl ChangeOp {
    pub fn new(op: OpKind, raw: Value) -> Self {
        Self {
            kind_key: kind_key_of(&raw),
            identity: identity_of(&raw),
            op,
            raw,
        }
    }

    /// Map a watch event onto a store operation: create, update and generic
    /// events all collapse into an upsert.
    pub fn from_event(ev: WatchEvent) -> Self {
        let op = match ev.event_type {
            EventType::Delete => OpKind::Delete,
            _ => OpKind::Upsert,
        };
        Self::new(op, ev.object)
    }
}

/// Kind key of a raw object, `"<apiVersion>/<kind>"`. Missing fields yield
/// empty segments; malformed objects still route to a (degenerate) store
/// instead of failing ingest.
pub fn kind_key_of(raw: &Value) -> KindKey {
    let api_version = raw.get("apiVersion").and_then(Value::as_str).unwrap_or("");
    let kind = raw.get("kind").and_then(Value::as_str).unwrap_or("");
    format!("{api_version}/{kind}")
}

/// Identity of a raw object within its kind.
pub fn identity_of(raw: &Value) -> Identity {
    let meta = raw.get("metadata");
    let name = meta
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("");
    match meta.and_then(|m| m.get("namespace")).and_then(Value::as_str) {
        Some(ns) if !ns.is_empty() => format!("{ns}/{name}"),
        _ => name.to_string(),
    }
}

/// Parsed form of a kind key, for validating user-supplied keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindKeyParts {
    pub group: String,
    pub version: String,
    pub kind: String,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid kind key: {0} (expect v1/Kind or group/v1/Kind)")]
pub struct KindKeyError(pub String);

impl FromStr for KindKeyParts {
    type Err = KindKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self {
                group: String::new(),
                version: (*version).to_string(),
                kind: (*kind).to_string(),
            }),
            [group, version, kind]
                if !group.is_empty() && !version.is_empty() && !kind.is_empty() =>
            {
                Ok(Self {
                    group: (*group).to_string(),
                    version: (*version).to_string(),
                    kind: (*kind).to_string(),
                })
            }
            _ => Err(KindKeyError(s.to_string())),
        }
    }
}

impl KindKeyParts {
    pub fn key(&self) -> KindKey {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Immutable identity-to-object view of one kind store. Replaced wholesale on
/// change, never mutated, so readers can detect "no change" by comparing
/// references.
#[derive(Debug, Clone, Default)]
pub struct KindSnapshot {
    pub epoch: u64,
    pub items: FxHashMap<Identity, Arc<Value>>,
}

impl KindSnapshot {
    pub fn get(&self, identity: &str) -> Option<&Arc<Value>> {
        self.items.get(identity)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Identities in lexicographic order, for deterministic iteration.
    pub fn sorted_identities(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.items.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConditionStatus {
    Running,
    Done,
    Pending,
    Warning,
    Error,
    Terminating,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::Running => "Running",
            ConditionStatus::Done => "Done",
            ConditionStatus::Pending => "Pending",
            ConditionStatus::Warning => "Warning",
            ConditionStatus::Error => "Error",
            ConditionStatus::Terminating => "Terminating",
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health verdict for an object or a synthesized group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Condition {
    pub status: ConditionStatus,
    pub reason: String,
}

impl Condition {
    pub fn new(status: ConditionStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    pub fn running(reason: impl Into<String>) -> Self {
        Self::new(ConditionStatus::Running, reason)
    }

    pub fn done(reason: impl Into<String>) -> Self {
        Self::new(ConditionStatus::Done, reason)
    }

    pub fn pending(reason: impl Into<String>) -> Self {
        Self::new(ConditionStatus::Pending, reason)
    }

    pub fn warning(reason: impl Into<String>) -> Self {
        Self::new(ConditionStatus::Warning, reason)
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::new(ConditionStatus::Error, reason)
    }

    pub fn terminating(reason: impl Into<String>) -> Self {
        Self::new(ConditionStatus::Terminating, reason)
    }
}

pub mod prelude {
    pub use super::{
        identity_of, kind_key_of, ChangeOp, Condition, ConditionStatus, EventType, Identity,
        KindKey, KindKeyParts, KindSnapshot, OpKind, WatchEvent,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_key_from_core_and_grouped_objects() {
        let pod = json!({"apiVersion": "v1", "kind": "Pod"});
        assert_eq!(kind_key_of(&pod), "v1/Pod");
        let role = json!({"apiVersion": "rbac.authorization.k8s.io/v1", "kind": "Role"});
        assert_eq!(kind_key_of(&role), "rbac.authorization.k8s.io/v1/Role");
    }

    #[test]
    fn kind_key_tolerates_missing_fields() {
        assert_eq!(kind_key_of(&json!({"kind": "Pod"})), "/Pod");
        assert_eq!(kind_key_of(&json!({})), "/");
    }

    #[test]
    fn identity_uses_namespace_when_present() {
        let namespaced = json!({"metadata": {"namespace": "default", "name": "web"}});
        assert_eq!(identity_of(&namespaced), "default/web");
        let cluster = json!({"metadata": {"name": "node-1"}});
        assert_eq!(identity_of(&cluster), "node-1");
        let empty_ns = json!({"metadata": {"namespace": "", "name": "x"}});
        assert_eq!(identity_of(&empty_ns), "x");
    }

    #[test]
    fn kind_key_parts_roundtrip() {
        let p: KindKeyParts = "v1/Pod".parse().unwrap();
        assert_eq!(p.group, "");
        assert_eq!(p.key(), "v1/Pod");
        let p: KindKeyParts = "rbac.authorization.k8s.io/v1/RoleBinding".parse().unwrap();
        assert_eq!(p.group, "rbac.authorization.k8s.io");
        assert_eq!(p.key(), "rbac.authorization.k8s.io/v1/RoleBinding");
        assert!("Pod".parse::<KindKeyParts>().is_err());
        assert!("a/b/c/d".parse::<KindKeyParts>().is_err());
        assert!("/Pod".parse::<KindKeyParts>().is_err());
    }

    #[test]
    fn event_type_accepts_kubectl_aliases() {
        let ev: WatchEvent =
            serde_json::from_value(json!({"type": "ADDED", "object": {"kind": "Pod"}})).unwrap();
        assert_eq!(ev.event_type, EventType::Create);
        let ev: WatchEvent =
            serde_json::from_value(json!({"type": "delete", "object": {}})).unwrap();
        assert_eq!(ev.event_type, EventType::Delete);
    }

    #[test]
    fn events_collapse_to_upsert_or_delete() {
        let obj = json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"namespace": "a", "name": "b"}});
        for t in [EventType::Create, EventType::Update, EventType::Generic] {
            let op = ChangeOp::from_event(WatchEvent {
                event_type: t,
                object: obj.clone(),
            });
            assert_eq!(op.op, OpKind::Upsert);
            assert_eq!(op.kind_key, "v1/Pod");
            assert_eq!(op.identity, "a/b");
        }
        let op = ChangeOp::from_event(WatchEvent {
            event_type: EventType::Delete,
            object: obj,
        });
        assert_eq!(op.op, OpKind::Delete);
    }
}
