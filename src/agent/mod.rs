// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! SKS agent: background runners started alongside the controller.

pub mod csr;
pub mod validation;

pub use csr::NodeCsrValidator;

use std::fmt;
use std::str::FromStr;

/// Runners selectable through `sksAgent.runners`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRunner {
    NodeCsrValidation,
}

impl AgentRunner {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRunner::NodeCsrValidation => "node-csr-validation",
        }
    }
}

impl FromStr for AgentRunner {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "node-csr-validation" => Ok(AgentRunner::NodeCsrValidation),
            other => Err(format!("unsupported SKS agent runner {:?}", other)),
        }
    }
}

impl fmt::Display for AgentRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_runner() {
        assert_eq!(
            "node-csr-validation".parse::<AgentRunner>(),
            Ok(AgentRunner::NodeCsrValidation)
        );
        assert!("node-csr-approval".parse::<AgentRunner>().is_err());
    }
}
