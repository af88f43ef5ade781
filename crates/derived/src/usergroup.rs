//! User group synthesis: joins RBAC bindings and roles into virtual objects.
//!
//! Groups never arrive on the wire; they are recomputed wholesale from the
//! current Role/RoleBinding/ClusterRole/ClusterRoleBinding snapshots whenever
//! any of the four inputs changed.

#![forbid(unsafe_code)]

use lookout_core::health::{first_match, Ctx, Rule};
use lookout_core::{Condition, Identity, KindSnapshot};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;
use tracing::debug;

pub const ROLE_KIND: &str = "rbac.authorization.k8s.io/v1/Role";
pub const ROLE_BINDING_KIND: &str = "rbac.authorization.k8s.io/v1/RoleBinding";
pub const CLUSTER_ROLE_KIND: &str = "rbac.authorization.k8s.io/v1/ClusterRole";
pub const CLUSTER_ROLE_BINDING_KIND: &str = "rbac.authorization.k8s.io/v1/ClusterRoleBinding";

/// Whether a synthesized entry stands for a single user or an actual group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GroupType {
    User,
    Group,
}

/// Binding that contributed to a group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BindingRef {
    pub name: String,
    pub namespace: Option<String>,
}

/// Resolved role, with enough detail for the health rules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoleRef {
    pub name: String,
    pub namespace: Option<String>,
    /// Number of policy rules the role carries.
    pub rules: usize,
}

/// One synthesized user or group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserGroup {
    pub identity: Identity,
    pub group_type: GroupType,
    pub bindings: SmallVec<[BindingRef; 4]>,
    pub roles: SmallVec<[RoleRef; 4]>,
    pub condition: Condition,
}

/// Published view of every synthesized group.
#[derive(Debug, Clone, Default)]
pub struct UserGroupSnapshot {
    pub epoch: u64,
    pub groups: FxHashMap<Identity, UserGroup>,
}

impl UserGroupSnapshot {
    pub fn get(&self, identity: &str) -> Option<&UserGroup> {
        self.groups.get(identity)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn sorted_identities(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.groups.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

#[derive(Default)]
struct Accum {
    group_type: Option<GroupType>,
    bindings: SmallVec<[BindingRef; 4]>,
    roles: SmallVec<[RoleRef; 4]>,
}

/// Recompute all groups from the four RBAC snapshots. RoleBindings are walked
/// before ClusterRoleBindings, each in sorted identity order, so the output is
/// a pure function of the inputs.
pub fn synthesize(
    roles: &KindSnapshot,
    role_bindings: &KindSnapshot,
    cluster_roles: &KindSnapshot,
    cluster_role_bindings: &KindSnapshot,
) -> FxHashMap<Identity, UserGroup> {
    let mut acc: FxHashMap<Identity, Accum> = FxHashMap::default();
    for id in role_bindings.sorted_identities() {
        if let Some(binding) = role_bindings.get(id) {
            accumulate(&mut acc, binding, roles, cluster_roles);
        }
    }
    for id in cluster_role_bindings.sorted_identities() {
        if let Some(binding) = cluster_role_bindings.get(id) {
            accumulate(&mut acc, binding, roles, cluster_roles);
        }
    }
    acc.into_iter()
        .map(|(identity, a)| {
            let condition = user_group_condition(&a.roles);
            let group = UserGroup {
                identity: identity.clone(),
                // An Accum only exists after at least one subject wrote to it.
                group_type: a.group_type.unwrap_or(GroupType::User),
                bindings: a.bindings,
                roles: a.roles,
                condition,
            };
            (identity, group)
        })
        .collect()
}

fn accumulate(
    acc: &mut FxHashMap<Identity, Accum>,
    binding: &Value,
    roles: &KindSnapshot,
    cluster_roles: &KindSnapshot,
) {
    let binding_ref = BindingRef {
        name: meta_str(binding, "name").unwrap_or_default(),
        namespace: meta_str(binding, "namespace"),
    };
    let role_ref = match resolve_role(binding, roles, cluster_roles) {
        Some(r) => r,
        None => {
            // Orphaned binding: its roleRef points at nothing we hold.
            debug!(binding = %binding_ref.name, "skipping binding with unresolved roleRef");
            return;
        }
    };
    let subjects = match binding.get("subjects").and_then(Value::as_array) {
        Some(s) => s,
        None => return,
    };
    for subject in subjects {
        let (identity, group_type) = match canonical_subject(subject) {
            Some(x) => x,
            None => continue,
        };
        let entry = acc.entry(identity).or_default();
        entry.group_type.get_or_insert(group_type);
        entry.bindings.push(binding_ref.clone());
        entry.roles.push(role_ref.clone());
    }
}

/// Resolve a binding's roleRef against the held snapshots. Role references
/// are scoped to the binding's own namespace; ClusterRole references are
/// cluster-wide.
fn resolve_role(
    binding: &Value,
    roles: &KindSnapshot,
    cluster_roles: &KindSnapshot,
) -> Option<RoleRef> {
    let ref_kind = binding
        .pointer("/roleRef/kind")
        .and_then(Value::as_str)
        .unwrap_or("");
    let ref_name = binding
        .pointer("/roleRef/name")
        .and_then(Value::as_str)
        .unwrap_or("");
    let raw = match ref_kind {
        "Role" => {
            let ns = meta_str(binding, "namespace").unwrap_or_default();
            roles.get(&format!("{ns}/{ref_name}"))
        }
        "ClusterRole" => cluster_roles.get(ref_name),
        _ => None,
    }?;
    Some(RoleRef {
        name: meta_str(raw, "name").unwrap_or_else(|| ref_name.to_string()),
        namespace: meta_str(raw, "namespace"),
        rules: raw.get("rules").and_then(Value::as_array).map_or(0, Vec::len),
    })
}

/// Canonical identity for a binding subject. Unknown subject kinds and
/// subjects without a name are skipped.
fn canonical_subject(subject: &Value) -> Option<(Identity, GroupType)> {
    let name = subject.get("name").and_then(Value::as_str)?;
    match subject.get("kind").and_then(Value::as_str) {
        Some("User") => Some((name.to_string(), GroupType::User)),
        Some("ServiceAccount") => {
            let ns = subject
                .get("namespace")
                .and_then(Value::as_str)
                .unwrap_or("");
            Some((format!("system:serviceaccount:{ns}:{name}"), GroupType::User))
        }
        Some("Group") => Some((format!("@{name}"), GroupType::Group)),
        _ => None,
    }
}

fn meta_str(raw: &Value, field: &str) -> Option<String> {
    raw.pointer(&format!("/metadata/{field}"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Health of a group given its resolved roles; first matching rule wins.
pub fn user_group_condition(roles: &[RoleRef]) -> Condition {
    let ctx = Ctx::default();
    first_match(GROUP_RULES, roles, &ctx).unwrap_or_else(|| Condition::running("ok"))
}

/// Group health chain, in precedence order.
pub static GROUP_RULES: &[Rule<[RoleRef]>] = &[
    Rule {
        name: "no-roles",
        applies: |roles, _| roles.is_empty(),
        produce: |_, _| Condition::error("has no roles"),
    },
    Rule {
        name: "all-roles-empty",
        applies: |roles, _| roles.iter().all(|r| r.rules == 0),
        produce: |roles, _| {
            Condition::error(format!(
                "has {} roles, but all of them have no rules",
                roles.len()
            ))
        },
    },
    Rule {
        name: "cluster-admin",
        applies: |roles, _| roles.iter().any(|r| r.name == "cluster-admin"),
        produce: |_, _| Condition::warning("has cluster-admin role, which is too powerful"),
    },
    Rule {
        name: "ok",
        applies: |_, _| true,
        produce: |roles, _| Condition::running(format!("has {} roles", roles.len())),
    },
];
