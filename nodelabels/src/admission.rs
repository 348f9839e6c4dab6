//! Admission handling for pod creation and pod binding.
//!
//! A pod `CREATE` gets env vars pointing at pod labels that do not exist yet, answered with a JSON
//! patch. A `Binding` of that pod to a node then copies the annotated node labels onto the live
//! pod with a strategic merge patch, which is what makes those env vars resolve.

use std::time::Duration;

use k8s_openapi::api::core::v1::{Binding, Pod};
use kube::core::{
    admission::{
        AdmissionRequest, AdmissionResponse, AdmissionReview, Operation, META_API_VERSION_V1,
    },
    DynamicObject, Resource,
};
use serde::de::DeserializeOwned;

use crate::{
    annotations::AnnotationKeys,
    error::AdmissionError,
    k8s::{consts, NodeLookup, PodClient},
    metrics,
    mutate::{set_env_label_refs, set_node_labels},
    patch::{create_two_way_merge_patch, is_empty_patch},
};

pub const REASON_NOT_CREATE: &str = "not a Create request";
pub const REASON_SKIPPED: &str = "skipped";
pub const REASON_PATCHED: &str = "patched";
pub const REASON_DRY_RUN: &str = "dry run";
pub const REASON_DONE: &str = "done";

enum Outcome {
    Allowed(&'static str),
    Mutated(AdmissionResponse),
}

/// Injects node labels into pods, first as env var references and then as pod labels.
pub struct NodeLabelsInjector<N, P> {
    keys: AnnotationKeys,
    nodes: N,
    pods: P,
}

impl<N: NodeLookup, P: PodClient> NodeLabelsInjector<N, P> {
    pub fn new(keys: AnnotationKeys, nodes: N, pods: P) -> Self {
        Self { keys, nodes, pods }
    }

    /// Answer a raw admission review body as posted by the API server.
    ///
    /// A body that does not decode is still answered with a review carrying a 400 response.
    pub async fn review_body(
        &self,
        body: &[u8],
        deadline: Duration,
    ) -> AdmissionReview<DynamicObject> {
        match serde_json::from_slice::<AdmissionReview<DynamicObject>>(body) {
            Ok(review) => self.review(review, deadline).await,
            Err(err) => {
                let err = AdmissionError::DecodeReview(err);
                tracing::error!("Invalid admission review body: {}", err);
                metrics::record_admission("unknown", "errored");
                rejected(request_uid(body), &err).into_review()
            }
        }
    }

    /// Answer an admission review, giving up with an error response once `deadline` has passed.
    pub async fn review(
        &self,
        review: AdmissionReview<DynamicObject>,
        deadline: Duration,
    ) -> AdmissionReview<DynamicObject> {
        tracing::trace!("Admission review {:?}", review);

        let req: AdmissionRequest<DynamicObject> = match review.try_into() {
            Ok(req) => req,
            Err(err) => {
                tracing::error!("Invalid admission review: {}", err);
                return AdmissionResponse::invalid(err.to_string()).into_review();
            }
        };

        let response = match tokio::time::timeout(deadline, self.handle(&req)).await {
            Ok(response) => response,
            Err(_) => {
                let err = AdmissionError::DeadlineExceeded(deadline);
                tracing::error!(
                    "Admission of {} {:?}/{} failed: {}",
                    request_kind(&req),
                    req.namespace,
                    req.name,
                    err
                );
                metrics::record_admission(request_kind(&req), "errored");
                errored(&req, &err)
            }
        };

        tracing::trace!("Admission response {:?}", response);
        response.into_review()
    }

    /// Decide on a single admission request.
    pub async fn handle(&self, req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        let kind = request_kind(req);
        tracing::debug!(
            "Handling request uid={} kind={} namespace={:?} operation={:?}",
            req.uid,
            kind,
            req.namespace,
            req.operation
        );

        let result = if !matches!(req.operation, Operation::Create) {
            Ok(Outcome::Allowed(REASON_NOT_CREATE))
        } else if kind == consts::KIND_POD {
            self.mutate_pod(req)
        } else if kind == consts::KIND_BINDING {
            self.inject_node_labels(req).await
        } else {
            Ok(Outcome::Allowed(REASON_DONE))
        };

        match result {
            Ok(Outcome::Allowed(reason)) => {
                metrics::record_admission(kind, reason);
                allowed(req, reason)
            }
            Ok(Outcome::Mutated(response)) => {
                metrics::record_admission(kind, "mutated");
                response
            }
            Err(err) => {
                tracing::error!(
                    "Admission of {} {:?}/{} failed: {}",
                    kind,
                    req.namespace,
                    req.name,
                    err
                );
                metrics::record_admission(kind, "errored");
                errored(req, &err)
            }
        }
    }

    /// Point the containers of a new pod at the labels the bind step will set.
    fn mutate_pod(&self, req: &AdmissionRequest<DynamicObject>) -> Result<Outcome, AdmissionError> {
        let original: Pod = decode(req, consts::KIND_POD)?;

        let name = original
            .metadata
            .name
            .as_deref()
            .or(original.metadata.generate_name.as_deref())
            .unwrap_or_default();
        let namespace = original
            .metadata
            .namespace
            .as_deref()
            .or(req.namespace.as_deref())
            .unwrap_or_default();
        tracing::debug!("Pod: {} namespace={}", name, namespace);

        let mut pod = original.clone();
        if !set_env_label_refs(&self.keys, &mut pod) {
            return Ok(Outcome::Allowed(REASON_SKIPPED));
        }

        let patch = json_patch::diff(
            &serde_json::to_value(&original)?,
            &serde_json::to_value(&pod)?,
        );

        tracing::info!(
            "Injecting node label env references into pod {} namespace={}",
            name,
            namespace
        );

        Ok(Outcome::Mutated(AdmissionResponse::from(req).with_patch(patch)?))
    }

    /// Copy the labels of the node a pod is being bound to onto the live pod.
    async fn inject_node_labels(
        &self,
        req: &AdmissionRequest<DynamicObject>,
    ) -> Result<Outcome, AdmissionError> {
        let binding: Binding = decode(req, consts::KIND_BINDING)?;

        let node_name = match (binding.target.kind.as_deref(), binding.target.name.as_deref()) {
            (Some(consts::KIND_NODE), Some(name)) if !name.is_empty() => name,
            _ => {
                tracing::info!(
                    "Pod binding target is not Node or target name empty: {:?}",
                    binding.target
                );
                return Ok(Outcome::Allowed(REASON_SKIPPED));
            }
        };

        let namespace = first_non_empty([
            binding.metadata.namespace.as_deref(),
            req.namespace.as_deref(),
        ])
        .ok_or(AdmissionError::UnnamedBinding)?;
        let name = first_non_empty([binding.metadata.name.as_deref(), Some(req.name.as_str())])
            .ok_or(AdmissionError::UnnamedBinding)?;

        tracing::debug!(
            "Binding pod {} namespace={} to node {}",
            name,
            namespace,
            node_name
        );

        let node = self
            .nodes
            .get_node(node_name)
            .ok_or_else(|| AdmissionError::NodeNotFound(node_name.to_string()))?;

        let pod = self
            .pods
            .get_pod(namespace, name)
            .await
            .map_err(|error| AdmissionError::GetPod {
                namespace: namespace.to_string(),
                name: name.to_string(),
                error,
            })?;

        let mut updated = pod.clone();
        let labels = set_node_labels(&self.keys, &node, &mut updated);
        if labels.is_empty() {
            return Ok(Outcome::Allowed(REASON_SKIPPED));
        }

        let patch = create_two_way_merge_patch(
            &serde_json::to_value(&pod)?,
            &serde_json::to_value(&updated)?,
        );
        if is_empty_patch(&patch) {
            tracing::debug!("Pod {} namespace={} already carries {:?}", name, namespace, labels);
            return Ok(Outcome::Allowed(REASON_SKIPPED));
        }

        if req.dry_run {
            tracing::info!(
                "Dry run, not injecting node labels {:?} into pod {} namespace={}",
                labels,
                name,
                namespace
            );
            return Ok(Outcome::Allowed(REASON_DRY_RUN));
        }

        tracing::info!(
            "Injecting node labels {:?} into pod {} namespace={}",
            labels,
            name,
            namespace
        );

        let result = self.pods.patch_pod(namespace, name, &patch).await;
        metrics::record_pod_patch(result.is_ok());
        result.map_err(|error| AdmissionError::PatchPod {
            namespace: namespace.to_string(),
            name: name.to_string(),
            error,
        })?;

        Ok(Outcome::Allowed(REASON_PATCHED))
    }
}

/// The kind the request was made for, before any conversion by the API server.
fn request_kind(req: &AdmissionRequest<DynamicObject>) -> &str {
    &req.request_kind.as_ref().unwrap_or(&req.kind).kind
}

fn first_non_empty<'a, const N: usize>(candidates: [Option<&'a str>; N]) -> Option<&'a str> {
    candidates.into_iter().flatten().find(|value| !value.is_empty())
}

fn decode<K: Resource + DeserializeOwned>(
    req: &AdmissionRequest<DynamicObject>,
    kind: &'static str,
) -> Result<K, AdmissionError> {
    req.object
        .clone()
        .ok_or(AdmissionError::MissingObject)?
        .try_parse()
        .map_err(|source| AdmissionError::Decode { kind, source })
}

fn allowed(req: &AdmissionRequest<DynamicObject>, reason: &str) -> AdmissionResponse {
    let mut response = AdmissionResponse::from(req);
    response.result.code = 200;
    response.result.message = reason.to_string();
    response
}

/// The request uid of a review body, read without decoding the embedded object.
fn request_uid(body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|review| Some(review.pointer("/request/uid")?.as_str()?.to_string()))
        .unwrap_or_default()
}

fn rejected(uid: String, err: &AdmissionError) -> AdmissionResponse {
    let mut response = AdmissionResponse::invalid(err.to_string());
    response.types.api_version = META_API_VERSION_V1.to_string();
    response.uid = uid;
    response.result.code = err.status_code();
    response.result.reason = err.reason().to_string();
    response
}

fn errored(req: &AdmissionRequest<DynamicObject>, err: &AdmissionError) -> AdmissionResponse {
    let mut response = AdmissionResponse::from(req).deny(err.to_string());
    response.result.code = err.status_code();
    response.result.reason = err.reason().to_string();
    response
}
