//! Propagates node labels into pod containers as environment variables.
//!
//! Pods opt in with `<domain>/env-<name>` annotations naming a node label. At creation the
//! containers receive env vars reading a pod label of the same key through the downward API,
//! and once the pod is bound to a node, that node's labels are copied onto the pod.

pub mod admission;
pub mod annotations;
pub mod error;
pub mod k8s;
pub mod metrics;
pub mod mutate;
pub mod patch;

pub use admission::NodeLabelsInjector;
pub use annotations::AnnotationKeys;
pub use error::AdmissionError;
