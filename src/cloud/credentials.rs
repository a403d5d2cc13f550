// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Exoscale API credentials

use crate::error::{CcmError, Result};
use serde::Deserialize;
use std::fmt;

/// API key pair, immutable once loaded.
///
/// The credentials file is a JSON object `{"name": ..., "api_key": ..., "api_secret": ...}`.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub name: String,
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    pub fn new(
        name: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Result<Self> {
        Self {
            name: name.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
        .validated()
    }

    /// Parse the content of a credentials file
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let credentials: Credentials = serde_json::from_slice(data).map_err(|e| {
            CcmError::CredentialsError(format!("failed to decode credentials: {}", e))
        })?;
        credentials.validated()
    }

    fn validated(self) -> Result<Self> {
        if self.api_key.trim().is_empty() {
            return Err(CcmError::CredentialsError("API key is empty".to_string()));
        }
        if self.api_secret.trim().is_empty() {
            return Err(CcmError::CredentialsError("API secret is empty".to_string()));
        }
        Ok(self)
    }

    /// Human-readable label used in log lines
    pub fn label(&self) -> String {
        if self.name.is_empty() {
            self.api_key.clone()
        } else {
            format!("{} ({})", self.name, self.api_key)
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("name", &self.name)
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}
