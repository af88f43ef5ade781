//! Pods-by-node secondary index.

#![forbid(unsafe_code)]

use lookout_core::{Identity, KindSnapshot};
use rustc_hash::FxHashMap;
use serde_json::Value;

/// Node name to pod identities, rebuilt wholesale from a pod snapshot.
/// Identities are sorted within each node so listings are deterministic.
#[derive(Debug, Clone, Default)]
pub struct PodsByNode {
    by_node: FxHashMap<String, Vec<Identity>>,
}

impl PodsByNode {
    pub fn rebuild(pods: &KindSnapshot) -> Self {
        let mut by_node: FxHashMap<String, Vec<Identity>> = FxHashMap::default();
        for (identity, raw) in &pods.items {
            let node = match raw.pointer("/spec/nodeName").and_then(Value::as_str) {
                Some(n) if !n.is_empty() => n,
                // Unscheduled pods carry no node yet.
                _ => continue,
            };
            by_node
                .entry(node.to_string())
                .or_default()
                .push(identity.clone());
        }
        for ids in by_node.values_mut() {
            ids.sort_unstable();
        }
        Self { by_node }
    }

    /// Pod identities scheduled on `node`; unknown nodes read as empty.
    pub fn pods_on(&self, node: &str) -> &[Identity] {
        self.by_node.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn node_count(&self) -> usize {
        self.by_node.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.by_node.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lookout_core::identity_of;
    use serde_json::json;
    use std::sync::Arc;

    fn pod(ns: &str, name: &str, node: Option<&str>) -> Value {
        let mut raw = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"namespace": ns, "name": name},
            "spec": {}
        });
        if let Some(n) = node {
            raw["spec"]["nodeName"] = json!(n);
        }
        raw
    }

    fn snap(objs: Vec<Value>) -> KindSnapshot {
        let mut items = rustc_hash::FxHashMap::default();
        for o in objs {
            items.insert(identity_of(&o), Arc::new(o));
        }
        KindSnapshot { epoch: 1, items }
    }

    #[test]
    fn groups_and_sorts_by_node() {
        let pods = snap(vec![
            pod("default", "zeta", Some("n1")),
            pod("default", "alpha", Some("n1")),
            pod("kube-system", "dns", Some("n2")),
        ]);
        let idx = PodsByNode::rebuild(&pods);
        assert_eq!(idx.pods_on("n1"), ["default/alpha", "default/zeta"]);
        assert_eq!(idx.pods_on("n2"), ["kube-system/dns"]);
        assert_eq!(idx.node_count(), 2);
        let mut nodes: Vec<&str> = idx.nodes().collect();
        nodes.sort_unstable();
        assert_eq!(nodes, ["n1", "n2"]);
    }

    #[test]
    fn skips_unscheduled_pods() {
        let pods = snap(vec![
            pod("default", "scheduled", Some("n1")),
            pod("default", "waiting", None),
        ]);
        let idx = PodsByNode::rebuild(&pods);
        assert_eq!(idx.pods_on("n1"), ["default/scheduled"]);
        assert_eq!(idx.node_count(), 1);
    }

    #[test]
    fn unknown_node_is_empty() {
        let idx = PodsByNode::rebuild(&KindSnapshot::default());
        assert!(idx.pods_on("nowhere").is_empty());
    }
}
