// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::cloud::CloudError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CcmError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Exoscale API error: {0}")]
    CloudError(#[from] CloudError),

    #[error("Invalid annotation: {0}")]
    InvalidAnnotation(String),

    #[error("Invalid service: {0}")]
    InvalidService(String),

    #[error("Invalid API credentials: {0}")]
    CredentialsError(String),

    #[error("Instance lookup failed: {0}")]
    LookupError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Finalizer error: {0}")]
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<CcmError>>),
}

impl CcmError {
    /// True when the Exoscale API rejected the credentials the call was made with.
    pub fn is_unauthorized(&self) -> bool {
        match self {
            CcmError::CloudError(e) => e.is_unauthorized(),
            CcmError::FinalizerError(e) => match e.as_ref() {
                kube::runtime::finalizer::Error::ApplyFailed(inner)
                | kube::runtime::finalizer::Error::CleanupFailed(inner) => inner.is_unauthorized(),
                _ => false,
            },
            _ => false,
        }
    }
}

impl From<kube::runtime::finalizer::Error<CcmError>> for CcmError {
    fn from(e: kube::runtime::finalizer::Error<CcmError>) -> Self {
        CcmError::FinalizerError(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, CcmError>;
