//! Reserved pod annotations that map node labels to environment variables.
//!
//! Two kinds of keys are recognised under the annotation domain:
//! `<domain>/env-<suffix>` whose value names a node label, and the exact
//! `<domain>/containers` key holding a comma separated container allow-list.

use std::collections::{BTreeMap, BTreeSet};

/// The annotation domain used when the configuration does not override it.
pub const DEFAULT_ANNOTATION_DOMAIN: &str = "node-labels.k8s.io";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationKeys {
    env_prefix: String,
    containers_key: String,
}

impl Default for AnnotationKeys {
    fn default() -> Self {
        Self::new(DEFAULT_ANNOTATION_DOMAIN)
    }
}

impl AnnotationKeys {
    pub fn new(domain: &str) -> Self {
        let domain = domain.trim_end_matches('/');
        Self {
            env_prefix: format!("{domain}/env-"),
            containers_key: format!("{domain}/containers"),
        }
    }

    pub fn env_prefix(&self) -> &str {
        &self.env_prefix
    }

    pub fn containers_key(&self) -> &str {
        &self.containers_key
    }

    /// Convert a reserved annotation key into the environment variable name it declares.
    ///
    /// The suffix after the prefix is upper-cased and every `-` becomes `_`. Nothing else is
    /// normalized, so a `.` in the suffix ends up in the variable name verbatim.
    /// Returns `None` for keys outside the prefix and for the containers control key.
    pub fn env_name(&self, key: &str) -> Option<String> {
        if key == self.containers_key {
            return None;
        }
        let suffix = key.strip_prefix(&self.env_prefix)?;
        Some(suffix.to_uppercase().replace('-', "_"))
    }

    /// The container names listed in the control annotation.
    /// An empty set means every container is targeted.
    pub fn container_allow_list(&self, annotations: &BTreeMap<String, String>) -> BTreeSet<String> {
        annotations
            .get(&self.containers_key)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every `(env name, node label key)` pair declared by the annotations.
    ///
    /// Pairs come out in sorted annotation key order. When two keys produce the same env name,
    /// callers collecting into a map keep the one from the lexicographically last key.
    pub fn env_mappings<'a>(
        &'a self,
        annotations: &'a BTreeMap<String, String>,
    ) -> impl Iterator<Item = (String, &'a str)> + 'a {
        annotations
            .iter()
            .filter_map(|(key, value)| Some((self.env_name(key)?, value.as_str())))
    }

    /// Whether any annotation maps a node label to an environment variable.
    pub fn has_env_mappings(&self, annotations: &BTreeMap<String, String>) -> bool {
        self.env_mappings(annotations).next().is_some()
    }
}
