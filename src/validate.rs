//! External validation of completion claims.
//!
//! After quality checks pass, a phase may be cross-checked by a secondary
//! validator agent. Rejection re-enters the iteration loop with retry
//! context; infrastructure failure is governed by `fail_on_api_error`.

use crate::task::Task;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Validator decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub approved: bool,
    #[serde(default)]
    pub reason: String,
}

impl Verdict {
    pub fn approve() -> Self {
        Self {
            approved: true,
            reason: String::new(),
        }
    }

    pub fn reject(reason: &str) -> Self {
        Self {
            approved: false,
            reason: reason.to_string(),
        }
    }
}

/// Abstraction over the validator agent.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Cross-check a completion claim against the phase transcript.
    async fn validate(&self, task: &Task, phase: &str, transcript: &str) -> Result<Verdict>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_constructors() {
        assert!(Verdict::approve().approved);
        let rejected = Verdict::reject("criteria unmet");
        assert!(!rejected.approved);
        assert_eq!(rejected.reason, "criteria unmet");
    }

    #[test]
    fn test_verdict_deserializes_with_default_reason() {
        let verdict: Verdict = serde_json::from_str(r#"{"approved": true}"#).unwrap();
        assert!(verdict.approved);
        assert!(verdict.reason.is_empty());
    }
}
