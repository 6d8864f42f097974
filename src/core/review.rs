//! Review-gate verdict shape.
//!
//! Every gate skill returns a review_feedback artifact whose content
//! deserializes into [`ReviewOutcome`]:
//! `{approved: bool, issues: [{type, severity, description}], summary}`.

use serde::{Deserialize, Serialize};

use super::artifact::Artifact;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// A single finding raised by a review gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewIssue {
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: Severity,
    pub description: String,
}

impl ReviewIssue {
    pub fn new(kind: &str, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            severity,
            description: description.into(),
        }
    }
}

/// Verdict of one review-gate round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewOutcome {
    pub approved: bool,
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
    #[serde(default)]
    pub summary: String,
}

impl ReviewOutcome {
    pub fn approve(summary: impl Into<String>) -> Self {
        Self {
            approved: true,
            issues: Vec::new(),
            summary: summary.into(),
        }
    }

    pub fn reject(issues: Vec<ReviewIssue>, summary: impl Into<String>) -> Self {
        Self {
            approved: false,
            issues,
            summary: summary.into(),
        }
    }

    /// Parse the verdict carried by a gate's feedback artifact.
    pub fn from_artifact(artifact: &Artifact, project: &str, skill: &str) -> Result<Self> {
        serde_json::from_value(artifact.content.clone()).map_err(|e| Error::Validation {
            project: project.to_string(),
            skill: skill.to_string(),
            message: format!("review output is not a gate verdict: {}", e),
        })
    }

    pub fn high_severity_count(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| i.severity >= Severity::High)
            .count()
    }
}
