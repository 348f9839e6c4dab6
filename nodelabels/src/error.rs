use std::time::Duration;

use kube::core::{admission::SerializePatchError, dynamic::ParseDynamicObjectError};
use thiserror::Error;

/// Why an admission request could not be answered with an allow or a patch.
///
/// Malformed requests are client errors (HTTP 400). Everything that fails while talking to the
/// cluster or encoding objects is a server error (HTTP 500) and left to the caller to retry.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("failed to decode admission review: {0}")]
    DecodeReview(#[source] serde_json::Error),

    #[error("no object in request")]
    MissingObject,

    #[error("failed to decode {kind}: {source}")]
    Decode {
        kind: &'static str,
        source: ParseDynamicObjectError,
    },

    #[error("binding does not reference a pod namespace and name")]
    UnnamedBinding,

    #[error("failed to get node {0}: not found")]
    NodeNotFound(String),

    #[error("failed to get pod {namespace}/{name}: {error:#}")]
    GetPod {
        namespace: String,
        name: String,
        error: anyhow::Error,
    },

    #[error("failed to encode pod object: {0}")]
    EncodePod(#[from] serde_json::Error),

    #[error("failed to encode patch: {0}")]
    EncodePatch(#[from] SerializePatchError),

    #[error("failed to patch pod {namespace}/{name}: {error:#}")]
    PatchPod {
        namespace: String,
        name: String,
        error: anyhow::Error,
    },

    #[error("admission deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
}

impl AdmissionError {
    /// The HTTP status code reported in the admission response.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::DecodeReview(_)
            | Self::MissingObject
            | Self::Decode { .. }
            | Self::UnnamedBinding => 400,
            _ => 500,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self.status_code() {
            400 => "BadRequest",
            _ => "InternalError",
        }
    }
}
