//! Three-way node status patches
//!
//! Other controllers add their own conditions, labels and annotations to our
//! node. A full overwrite would drop them, so every update is a strategic
//! merge patch computed from three inputs:
//!
//! - the desired state (local node body)
//! - what we applied last time, recorded in two annotations on the node
//! - the live node, which only contributes those annotations
//!
//! Entries we applied before and no longer report are removed explicitly
//! (`null` for map keys, `$patch: delete` for list entries merged by `type`).
//! Everything else that is not ours is left alone.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use vnode_common::Result;

/// Annotation holding the status we last applied
pub const LAST_APPLIED_STATUS_ANNOTATION: &str = "virtual-kubelet.io/last-applied-node-status";

/// Annotation holding the labels and annotations we last applied
pub const LAST_APPLIED_META_ANNOTATION: &str = "virtual-kubelet.io/last-applied-object-meta";

/// Status lists the API server merges by their `type` field
const MERGE_BY_TYPE: &[&str] = &["conditions", "addresses"];

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct AppliedMeta {
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
}

impl AppliedMeta {
    fn of(node: &Node) -> Self {
        let annotations = node
            .metadata
            .annotations
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|(k, _)| !is_bookkeeping(k))
            .collect();
        Self {
            labels: node.metadata.labels.clone().unwrap_or_default(),
            annotations,
        }
    }
}

fn is_bookkeeping(annotation: &str) -> bool {
    annotation == LAST_APPLIED_STATUS_ANNOTATION || annotation == LAST_APPLIED_META_ANNOTATION
}

/// Set `lastHeartbeatTime` on every condition of the node
pub fn stamp_heartbeat(node: &mut Node) {
    let now = Time(Utc::now());
    if let Some(conditions) = node
        .status
        .as_mut()
        .and_then(|status| status.conditions.as_mut())
    {
        for condition in conditions {
            condition.last_heartbeat_time = Some(now.clone());
        }
    }
}

/// Record `node`'s own status and metadata as last applied
///
/// Used when a node is created, so the first patch afterwards knows what it
/// owns.
pub fn annotate_last_applied(node: &mut Node) -> Result<()> {
    let status = serde_json::to_string(&node.status.clone().unwrap_or_default())?;
    let meta = serde_json::to_string(&AppliedMeta::of(node))?;
    let annotations = node.metadata.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert(LAST_APPLIED_STATUS_ANNOTATION.to_string(), status);
    annotations.insert(LAST_APPLIED_META_ANNOTATION.to_string(), meta);
    Ok(())
}

/// Build the strategic merge patch that moves `current` to `desired`
///
/// Only status, labels and annotations are touched.
pub fn build_status_patch(current: &Node, desired: &Node) -> Result<Value> {
    let desired_status = serde_json::to_value(desired.status.clone().unwrap_or_default())?;
    let desired_meta = AppliedMeta::of(desired);

    let live = current.metadata.annotations.as_ref();
    let last_status = live
        .and_then(|a| a.get(LAST_APPLIED_STATUS_ANNOTATION))
        .and_then(|s| serde_json::from_str::<Value>(s).ok())
        .unwrap_or_else(|| Value::Object(Map::new()));
    let last_meta = live
        .and_then(|a| a.get(LAST_APPLIED_META_ANNOTATION))
        .and_then(|s| serde_json::from_str::<AppliedMeta>(s).ok())
        .unwrap_or_default();

    let mut status_patch = desired_status.clone();
    remove_dropped_status(&mut status_patch, &last_status);

    let labels = map_patch(&desired_meta.labels, &last_meta.labels);
    let mut annotations = map_patch(&desired_meta.annotations, &last_meta.annotations);
    annotations.insert(
        LAST_APPLIED_STATUS_ANNOTATION.to_string(),
        Value::String(serde_json::to_string(&desired_status)?),
    );
    annotations.insert(
        LAST_APPLIED_META_ANNOTATION.to_string(),
        Value::String(serde_json::to_string(&desired_meta)?),
    );

    Ok(json!({
        "metadata": {
            "labels": labels,
            "annotations": annotations,
        },
        "status": status_patch,
    }))
}

/// Desired entries, plus `null` for keys we applied before and dropped
fn map_patch(desired: &BTreeMap<String, String>, last: &BTreeMap<String, String>) -> Map<String, Value> {
    let mut patch: Map<String, Value> = desired
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    for key in last.keys() {
        if !desired.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }
    patch
}

fn remove_dropped_status(patch: &mut Value, last: &Value) {
    let (Value::Object(patch), Value::Object(last)) = (patch, last) else {
        return;
    };
    for (key, last_value) in last {
        if MERGE_BY_TYPE.contains(&key.as_str()) {
            let list = patch
                .entry(key.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            delete_dropped_entries(list, last_value);
            continue;
        }
        match patch.get_mut(key) {
            None => {
                patch.insert(key.clone(), Value::Null);
            }
            Some(value) if value.is_object() => null_dropped_keys(value, last_value),
            Some(_) => {}
        }
    }
}

fn null_dropped_keys(patch: &mut Value, last: &Value) {
    let (Value::Object(patch), Value::Object(last)) = (patch, last) else {
        return;
    };
    for (key, last_value) in last {
        match patch.get_mut(key) {
            None => {
                patch.insert(key.clone(), Value::Null);
            }
            Some(value) if value.is_object() => null_dropped_keys(value, last_value),
            Some(_) => {}
        }
    }
}

fn delete_dropped_entries(list: &mut Value, last: &Value) {
    let (Value::Array(items), Value::Array(last_items)) = (list, last) else {
        return;
    };
    let reported: HashSet<String> = items
        .iter()
        .filter_map(|item| item.get("type").and_then(Value::as_str))
        .map(str::to_string)
        .collect();
    let mut dropped = HashSet::new();
    for item in last_items {
        if let Some(kind) = item.get("type").and_then(Value::as_str) {
            if !reported.contains(kind) && dropped.insert(kind.to_string()) {
                items.push(json!({ "type": kind, "$patch": "delete" }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::apply_strategic_merge;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn condition(kind: &str, status: &str) -> NodeCondition {
        NodeCondition {
            type_: kind.to_string(),
            status: status.to_string(),
            ..Default::default()
        }
    }

    fn node_with(conditions: Vec<NodeCondition>, labels: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("testnode".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: Some(conditions),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn apply(current: &Node, patch: &Value) -> Node {
        let mut value = serde_json::to_value(current).unwrap();
        apply_strategic_merge(&mut value, patch);
        serde_json::from_value(value).unwrap()
    }

    fn condition_types(node: &Node) -> Vec<String> {
        let mut types: Vec<String> = node
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map(|c| c.iter().map(|c| c.type_.clone()).collect())
            .unwrap_or_default();
        types.sort();
        types
    }

    #[test]
    fn test_heartbeat_stamped_on_every_condition() {
        let mut node = node_with(vec![condition("Ready", "True"), condition("Disk", "False")], &[]);
        stamp_heartbeat(&mut node);
        let conditions = node.status.unwrap().conditions.unwrap();
        assert!(conditions.iter().all(|c| c.last_heartbeat_time.is_some()));
    }

    #[test]
    fn test_first_patch_without_history_adds_everything() {
        let current = node_with(vec![], &[]);
        let desired = node_with(vec![condition("Ready", "True")], &[("type", "virtual-kubelet")]);
        let patch = build_status_patch(&current, &desired).unwrap();

        assert_eq!(patch["metadata"]["labels"]["type"], "virtual-kubelet");
        assert_eq!(patch["status"]["conditions"][0]["type"], "Ready");
        let recorded = patch["metadata"]["annotations"][LAST_APPLIED_STATUS_ANNOTATION]
            .as_str()
            .unwrap();
        assert!(recorded.contains("Ready"));
    }

    /// Story: a condition added by another controller survives our updates,
    /// while a condition we stopped reporting is removed
    #[test]
    fn story_manual_conditions_are_preserved() {
        let mut registered = node_with(vec![condition("BaseCondition", "True")], &[]);
        annotate_last_applied(&mut registered).unwrap();

        // Another actor adds its own condition and annotation
        let mut live = registered.clone();
        live.status
            .as_mut()
            .unwrap()
            .conditions
            .as_mut()
            .unwrap()
            .push(condition("ManuallyAddedCondition", "True"));
        live.metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert("manuallyAddedAnnotation".to_string(), "value".to_string());

        let desired = node_with(
            vec![condition("BaseCondition", "True"), condition("NewCondition", "True")],
            &[],
        );
        let patched = apply(&live, &build_status_patch(&live, &desired).unwrap());
        assert_eq!(
            condition_types(&patched),
            vec!["BaseCondition", "ManuallyAddedCondition", "NewCondition"]
        );
        assert_eq!(
            patched.metadata.annotations.as_ref().unwrap()["manuallyAddedAnnotation"],
            "value"
        );

        // Dropping our own condition deletes it, the manual one stays
        let desired = node_with(vec![condition("NewCondition", "True")], &[]);
        let patched = apply(&patched, &build_status_patch(&patched, &desired).unwrap());
        assert_eq!(
            condition_types(&patched),
            vec!["ManuallyAddedCondition", "NewCondition"]
        );
    }

    #[test]
    fn test_dropped_labels_are_nulled_and_foreign_labels_kept() {
        let mut registered = node_with(vec![], &[("ours", "1"), ("also-ours", "2")]);
        annotate_last_applied(&mut registered).unwrap();
        registered
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .insert("theirs".to_string(), "x".to_string());

        let desired = node_with(vec![], &[("ours", "1")]);
        let patch = build_status_patch(&registered, &desired).unwrap();
        assert_eq!(patch["metadata"]["labels"]["also-ours"], Value::Null);
        assert!(patch["metadata"]["labels"].get("theirs").is_none());

        let patched = apply(&registered, &patch);
        let labels = patched.metadata.labels.unwrap();
        assert_eq!(labels.get("ours").map(String::as_str), Some("1"));
        assert_eq!(labels.get("theirs").map(String::as_str), Some("x"));
        assert!(!labels.contains_key("also-ours"));
    }

    #[test]
    fn test_dropped_capacity_keys_are_nulled() {
        let mut registered = node_with(vec![], &[]);
        registered.status.as_mut().unwrap().capacity = Some(BTreeMap::from([
            ("cpu".to_string(), Quantity("20".to_string())),
            ("nvidia.com/gpu".to_string(), Quantity("4".to_string())),
        ]));
        annotate_last_applied(&mut registered).unwrap();

        let mut desired = node_with(vec![], &[]);
        desired.status.as_mut().unwrap().capacity =
            Some(BTreeMap::from([("cpu".to_string(), Quantity("20".to_string()))]));

        let patch = build_status_patch(&registered, &desired).unwrap();
        assert_eq!(patch["status"]["capacity"]["nvidia.com/gpu"], Value::Null);
        assert_eq!(patch["status"]["capacity"]["cpu"], "20");
    }

    #[test]
    fn test_bookkeeping_annotations_never_recorded_as_owned() {
        let mut node = node_with(vec![], &[]);
        annotate_last_applied(&mut node).unwrap();
        annotate_last_applied(&mut node).unwrap();
        let meta: AppliedMeta = serde_json::from_str(
            &node.metadata.annotations.as_ref().unwrap()[LAST_APPLIED_META_ANNOTATION],
        )
        .unwrap();
        assert!(meta.annotations.is_empty());
    }

    #[test]
    fn test_unparseable_history_is_treated_as_empty() {
        let mut current = node_with(vec![condition("Ready", "True")], &[]);
        current.metadata.annotations = Some(BTreeMap::from([(
            LAST_APPLIED_STATUS_ANNOTATION.to_string(),
            "{not json".to_string(),
        )]));
        let desired = node_with(vec![condition("Ready", "False")], &[]);
        let patch = build_status_patch(&current, &desired).unwrap();
        assert_eq!(patch["status"]["conditions"].as_array().unwrap().len(), 1);
    }
}
