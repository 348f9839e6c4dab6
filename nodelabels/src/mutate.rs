//! Pure transformations of pods driven by the reserved annotations.
//!
//! At create time the node is unknown, so containers get env vars that read a pod label through
//! a field reference. At bind time the node labels are copied onto the pod, which fills in the
//! labels those field references point at.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{Container, EnvVar, EnvVarSource, Node, ObjectFieldSelector, Pod};

use crate::annotations::AnnotationKeys;

/// The field path of a pod label, as understood by the downward API.
pub fn label_field_path(label: &str) -> String {
    format!("metadata.labels['{label}']")
}

fn label_field_ref(label: &str) -> EnvVarSource {
    EnvVarSource {
        field_ref: Some(ObjectFieldSelector {
            field_path: label_field_path(label),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Resolve the annotated node labels to env var values.
/// Annotations pointing at labels the node does not carry are dropped.
pub fn env_values_from_node(
    keys: &AnnotationKeys,
    node: &Node,
    pod: &Pod,
) -> BTreeMap<String, String> {
    let (Some(annotations), Some(node_labels)) =
        (pod.metadata.annotations.as_ref(), node.metadata.labels.as_ref())
    else {
        return BTreeMap::new();
    };

    keys.env_mappings(annotations)
        .filter_map(|(env, label)| Some((env, node_labels.get(label)?.clone())))
        .collect()
}

/// Write literal env values into every named container, replacing any previous value source.
pub fn set_env_values(pod: &mut Pod, envs: &BTreeMap<String, String>) {
    let Some(spec) = pod.spec.as_mut() else {
        return;
    };

    for container in spec.containers.iter_mut().filter(|c| !c.name.is_empty()) {
        for (name, value) in envs {
            upsert_env(container, name, || EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                value_from: None,
            });
        }
    }
}

/// Copy the annotated node labels onto the pod.
///
/// Returns the labels that were set. Existing pod labels with the same key are overwritten.
pub fn set_node_labels(keys: &AnnotationKeys, node: &Node, pod: &mut Pod) -> BTreeMap<String, String> {
    let (Some(annotations), Some(node_labels)) =
        (pod.metadata.annotations.as_ref(), node.metadata.labels.as_ref())
    else {
        return BTreeMap::new();
    };

    let labels: BTreeMap<String, String> = keys
        .env_mappings(annotations)
        .filter_map(|(_, label)| Some((label.to_string(), node_labels.get(label)?.clone())))
        .collect();

    if !labels.is_empty() {
        pod.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels.clone());
    }

    labels
}

/// Point env vars at the pod labels named by the annotations.
///
/// Applies to init containers and containers, restricted to the allow-list when one is
/// annotated. Returns `false` without touching the pod when there is nothing to map.
pub fn set_env_label_refs(keys: &AnnotationKeys, pod: &mut Pod) -> bool {
    let Some(annotations) = pod.metadata.annotations.as_ref() else {
        return false;
    };

    let envs: BTreeMap<String, String> = keys
        .env_mappings(annotations)
        .map(|(env, label)| (env, label.to_string()))
        .collect();
    if envs.is_empty() {
        return false;
    }
    let allowed = keys.container_allow_list(annotations);

    if let Some(spec) = pod.spec.as_mut() {
        if let Some(init_containers) = spec.init_containers.as_mut() {
            set_env_label_refs_to_containers(init_containers, &allowed, &envs);
        }
        set_env_label_refs_to_containers(&mut spec.containers, &allowed, &envs);
    }

    true
}

fn set_env_label_refs_to_containers(
    containers: &mut [Container],
    allowed: &BTreeSet<String>,
    envs: &BTreeMap<String, String>,
) {
    for container in containers
        .iter_mut()
        .filter(|c| allowed.is_empty() || allowed.contains(&c.name))
    {
        for (name, label) in envs {
            upsert_env(container, name, || EnvVar {
                name: name.clone(),
                value: None,
                value_from: Some(label_field_ref(label)),
            });
        }
    }
}

/// Replace every env var called `name`, or append one when there is none.
fn upsert_env(container: &mut Container, name: &str, make: impl Fn() -> EnvVar) {
    let env = container.env.get_or_insert_with(Vec::new);

    let mut updated = false;
    for existing in env.iter_mut().filter(|e| e.name == name) {
        *existing = make();
        updated = true;
    }

    if !updated {
        env.push(make());
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{PodSpec, SecretKeySelector};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    const PREFIX: &str = "node-labels.k8s.io/env-";
    const CONTAINERS: &str = "node-labels.k8s.io/containers";

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn test_node() -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("node0".to_string()),
                labels: Some(map(&[
                    ("topology.kubernetes.io/region", "region-1"),
                    ("topology.kubernetes.io/zone", "zone-1"),
                    ("custom-label", "custom-value"),
                ])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn annotated_pod(annotations: &[(&str, &str)], spec: PodSpec) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("pod0".to_string()),
                annotations: Some(map(annotations)),
                ..Default::default()
            },
            spec: Some(spec),
            ..Default::default()
        }
    }

    fn literal(name: &str, value: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            value_from: None,
        }
    }

    fn secret_env() -> EnvVar {
        EnvVar {
            name: "ENV2".to_string(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: "secret".to_string(),
                    key: "key".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        }
    }

    fn label_ref(name: &str, label: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: None,
            value_from: Some(label_field_ref(label)),
        }
    }

    fn container(name: &str, env: Vec<EnvVar>) -> Container {
        Container {
            name: name.to_string(),
            env: if env.is_empty() { None } else { Some(env) },
            ..Default::default()
        }
    }

    fn containers(pod: &Pod) -> &[Container] {
        &pod.spec.as_ref().unwrap().containers
    }

    #[test]
    fn test_env_values_from_node() {
        let node = test_node();
        let key = |suffix: &str| format!("{PREFIX}{suffix}");
        let keys = AnnotationKeys::default();

        let pod = Pod::default();
        assert!(env_values_from_node(&keys, &node, &pod).is_empty());

        let region_and_zone = key("region");
        let node_zone = key("node-zone");
        let pod = annotated_pod(
            &[
                (&region_and_zone, "topology.kubernetes.io/region"),
                (&node_zone, "topology.kubernetes.io/zone"),
            ],
            PodSpec::default(),
        );
        assert_eq!(
            env_values_from_node(&keys, &node, &pod),
            map(&[("REGION", "region-1"), ("NODE_ZONE", "zone-1")])
        );

        let missing = key("test");
        let pod = annotated_pod(
            &[
                (&region_and_zone, "topology.kubernetes.io/region"),
                (&missing, "missing-label"),
            ],
            PodSpec::default(),
        );
        assert_eq!(
            env_values_from_node(&keys, &node, &pod),
            map(&[("REGION", "region-1")])
        );
    }

    #[test]
    fn test_set_env_values_override() {
        let mut pod = annotated_pod(
            &[],
            PodSpec {
                containers: vec![container(
                    "container0",
                    vec![literal("ENV1", "value1"), secret_env()],
                )],
                ..Default::default()
            },
        );

        set_env_values(&mut pod, &map(&[("ENV2", "value3")]));

        assert_eq!(
            containers(&pod)[0].env,
            Some(vec![literal("ENV1", "value1"), literal("ENV2", "value3")])
        );
    }

    #[test]
    fn test_set_env_values_appends() {
        let mut pod = annotated_pod(
            &[],
            PodSpec {
                containers: vec![
                    container("container0", vec![literal("ENV1", "value1"), secret_env()]),
                    container("container1", vec![]),
                ],
                ..Default::default()
            },
        );
        let unchanged = pod.clone();

        set_env_values(&mut pod, &BTreeMap::new());
        assert_eq!(pod, unchanged);

        set_env_values(&mut pod, &map(&[("ENV3", "value3")]));

        assert_eq!(
            containers(&pod)[0].env,
            Some(vec![
                literal("ENV1", "value1"),
                secret_env(),
                literal("ENV3", "value3")
            ])
        );
        assert_eq!(containers(&pod)[1].env, Some(vec![literal("ENV3", "value3")]));
    }

    #[test]
    fn test_set_env_label_refs_without_annotations() {
        let keys = AnnotationKeys::default();
        let mut pod = annotated_pod(
            &[("unrelated", "value")],
            PodSpec {
                containers: vec![container("container0", vec![])],
                ..Default::default()
            },
        );
        let unchanged = pod.clone();

        assert!(!set_env_label_refs(&keys, &mut pod));
        assert_eq!(pod, unchanged);
    }

    #[test]
    fn test_set_env_label_refs() {
        let keys = AnnotationKeys::default();
        let zone = format!("{PREFIX}zone");
        let test_env = format!("{PREFIX}test-env");
        let mut pod = annotated_pod(
            &[(&zone, "value1"), (&test_env, "value2")],
            PodSpec {
                containers: vec![container("container0", vec![])],
                ..Default::default()
            },
        );

        assert!(set_env_label_refs(&keys, &mut pod));

        let env = containers(&pod)[0].env.clone().unwrap();
        assert_eq!(env.len(), 2);
        assert!(env.contains(&label_ref("ZONE", "value1")));
        assert!(env.contains(&label_ref("TEST_ENV", "value2")));
    }

    #[test]
    fn test_set_env_label_refs_overrides_existing() {
        let keys = AnnotationKeys::default();
        let zone = format!("{PREFIX}env2");
        let mut pod = annotated_pod(
            &[(&zone, "topology.kubernetes.io/zone")],
            PodSpec {
                containers: vec![container(
                    "container0",
                    vec![literal("ENV1", "value1"), secret_env()],
                )],
                ..Default::default()
            },
        );

        assert!(set_env_label_refs(&keys, &mut pod));

        assert_eq!(
            containers(&pod)[0].env,
            Some(vec![
                literal("ENV1", "value1"),
                label_ref("ENV2", "topology.kubernetes.io/zone")
            ])
        );
    }

    #[test]
    fn test_set_env_label_refs_allow_list() {
        let keys = AnnotationKeys::default();
        let zone = format!("{PREFIX}zone");
        let mut pod = annotated_pod(
            &[(&zone, "value1"), (CONTAINERS, "container0")],
            PodSpec {
                init_containers: Some(vec![container("init-container1", vec![])]),
                containers: vec![
                    container("container0", vec![literal("ENV1", "value1")]),
                    container("container1", vec![literal("ENV1", "value1")]),
                ],
                ..Default::default()
            },
        );

        assert!(set_env_label_refs(&keys, &mut pod));

        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.init_containers.as_ref().unwrap()[0].env, None);
        assert_eq!(
            spec.containers[0].env,
            Some(vec![literal("ENV1", "value1"), label_ref("ZONE", "value1")])
        );
        assert_eq!(spec.containers[1].env, Some(vec![literal("ENV1", "value1")]));
    }

    #[test]
    fn test_set_env_label_refs_init_containers() {
        let keys = AnnotationKeys::default();
        let zone = format!("{PREFIX}zone");
        let mut pod = annotated_pod(
            &[(&zone, "value1")],
            PodSpec {
                init_containers: Some(vec![container(
                    "init-container1",
                    vec![literal("ENV1", "value1")],
                )]),
                containers: vec![container("container0", vec![secret_env()])],
                ..Default::default()
            },
        );

        assert!(set_env_label_refs(&keys, &mut pod));

        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(
            spec.init_containers.as_ref().unwrap()[0].env,
            Some(vec![literal("ENV1", "value1"), label_ref("ZONE", "value1")])
        );
        assert_eq!(
            spec.containers[0].env,
            Some(vec![secret_env(), label_ref("ZONE", "value1")])
        );
    }

    #[test]
    fn test_set_env_label_refs_is_idempotent() {
        let keys = AnnotationKeys::default();
        let zone = format!("{PREFIX}zone");
        let mut pod = annotated_pod(
            &[(&zone, "value1")],
            PodSpec {
                containers: vec![container("container0", vec![])],
                ..Default::default()
            },
        );

        assert!(set_env_label_refs(&keys, &mut pod));
        let once = pod.clone();
        assert!(set_env_label_refs(&keys, &mut pod));
        assert_eq!(pod, once);
    }

    #[test]
    fn test_set_env_label_refs_colliding_names() {
        let keys = AnnotationKeys::default();
        let upper = format!("{PREFIX}NODE_zone");
        let lower = format!("{PREFIX}node-zone");
        let mut pod = annotated_pod(
            &[(&upper, "first"), (&lower, "second")],
            PodSpec {
                containers: vec![container("container0", vec![])],
                ..Default::default()
            },
        );

        assert!(set_env_label_refs(&keys, &mut pod));

        assert_eq!(
            containers(&pod)[0].env,
            Some(vec![label_ref("NODE_ZONE", "second")])
        );
    }

    #[test]
    fn test_set_node_labels() {
        let keys = AnnotationKeys::default();
        let custom = format!("{PREFIX}custom");
        let missing = format!("{PREFIX}missing");
        let mut pod = annotated_pod(
            &[(&custom, "custom-label"), (&missing, "missing-label")],
            PodSpec::default(),
        );

        let labels = set_node_labels(&keys, &test_node(), &mut pod);

        assert_eq!(labels, map(&[("custom-label", "custom-value")]));
        assert_eq!(pod.metadata.labels, Some(map(&[("custom-label", "custom-value")])));
    }

    #[test]
    fn test_set_node_labels_overwrites() {
        let keys = AnnotationKeys::default();
        let zone = format!("{PREFIX}zone");
        let mut pod = annotated_pod(&[(&zone, "topology.kubernetes.io/zone")], PodSpec::default());
        pod.metadata.labels = Some(map(&[
            ("app", "web"),
            ("topology.kubernetes.io/zone", "stale"),
        ]));

        set_node_labels(&keys, &test_node(), &mut pod);

        assert_eq!(
            pod.metadata.labels,
            Some(map(&[("app", "web"), ("topology.kubernetes.io/zone", "zone-1")]))
        );
    }

    #[test]
    fn test_set_node_labels_nothing_resolved() {
        let keys = AnnotationKeys::default();
        let missing = format!("{PREFIX}missing");
        let mut pod = annotated_pod(&[(&missing, "missing-label")], PodSpec::default());

        assert!(set_node_labels(&keys, &test_node(), &mut pod).is_empty());
        assert_eq!(pod.metadata.labels, None);
    }
}
