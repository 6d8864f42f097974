//! Conflict mediation between agents.
//!
//! The selection heuristic sits behind [`ConflictStrategy`] so the
//! orchestrator never depends on how an option is picked.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::{Artifact, ArtifactStore, ArtifactType};

pub const DEFAULT_DECISION: &str = "defer to architect";
pub const DEFAULT_RATIONALE: &str = "Default selection - first proposed option";
pub const RESOLVED: &str = "resolved";

/// A disagreement submitted by two or more agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub parties: Vec<String>,
    pub issue: String,
    /// Proposed options in submission order.
    pub options: Vec<String>,
}

impl Conflict {
    pub fn new(parties: &[&str], issue: &str, options: &[&str]) -> Self {
        Self {
            parties: parties.iter().map(|p| p.to_string()).collect(),
            issue: issue.to_string(),
            options: options.iter().map(|o| o.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub issue: String,
    pub parties: Vec<String>,
    pub decision: String,
    pub rationale: String,
    pub status: String,
}

/// Picks one option for a conflict given the project's NFR text.
pub trait ConflictStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn resolve(&self, conflict: &Conflict, nfr_text: &str) -> Resolution;
}

/// A concern that, when mentioned by the NFRs, favors matching options.
#[derive(Debug, Clone)]
pub struct Theme {
    pub name: String,
    trigger: Regex,
    prefer: Regex,
}

impl Theme {
    /// Patterns are matched case-insensitively. Returns `None` if either
    /// pattern fails to compile.
    pub fn new(name: &str, trigger: &str, prefer: &str) -> Option<Self> {
        let trigger = Regex::new(&format!("(?i){}", trigger)).ok()?;
        let prefer = Regex::new(&format!("(?i){}", prefer)).ok()?;
        Some(Self {
            name: name.to_string(),
            trigger,
            prefer,
        })
    }
}

/// Keyword matching between NFR text and option text.
///
/// Themes are checked in order. The first theme the NFRs mention is the only
/// one applied, and its first matching option wins. Anything else falls
/// back to the first proposed option.
#[derive(Debug, Clone)]
pub struct KeywordStrategy {
    themes: Vec<Theme>,
}

impl Default for KeywordStrategy {
    fn default() -> Self {
        let themes = [
            ("performance", "performance", "performance|fast"),
            ("security", "security", "security|secure"),
        ]
        .into_iter()
        .filter_map(|(name, trigger, prefer)| Theme::new(name, trigger, prefer))
        .collect();
        Self { themes }
    }
}

impl KeywordStrategy {
    pub fn new(themes: Vec<Theme>) -> Self {
        Self { themes }
    }

    pub fn themes(&self) -> &[Theme] {
        &self.themes
    }
}

impl ConflictStrategy for KeywordStrategy {
    fn name(&self) -> &str {
        "keyword"
    }

    fn resolve(&self, conflict: &Conflict, nfr_text: &str) -> Resolution {
        let mut decision = conflict
            .options
            .first()
            .cloned()
            .unwrap_or_else(|| DEFAULT_DECISION.to_string());
        let mut rationale = DEFAULT_RATIONALE.to_string();

        if let Some(theme) = self.themes.iter().find(|t| t.trigger.is_match(nfr_text)) {
            if let Some(option) = conflict.options.iter().find(|o| theme.prefer.is_match(o)) {
                decision = option.clone();
                rationale = format!("Selected for {} alignment with NFRs", theme.name);
            }
        }

        Resolution {
            issue: conflict.issue.clone(),
            parties: conflict.parties.clone(),
            decision,
            rationale,
            status: RESOLVED.to_string(),
        }
    }
}

/// Lowercased text of the newest requirements' non-functional entries.
///
/// Entries may be objects with a `description` or plain strings.
pub fn nfr_text(store: &ArtifactStore) -> String {
    let Some(Value::Array(nfrs)) =
        store.content_field(ArtifactType::Requirements, "non_functional_requirements")
    else {
        return String::new();
    };
    nfrs.iter()
        .filter_map(|nfr| match nfr {
            Value::String(s) => Some(s.as_str()),
            other => other.get("description").and_then(Value::as_str),
        })
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// The review-feedback artifact recording a batch of decisions.
pub fn resolution_artifact(resolutions: &[Resolution], project: &str, producer: &str) -> Artifact {
    let resolved = resolutions.iter().filter(|r| r.status == RESOLVED).count();
    Artifact::new(
        ArtifactType::ReviewFeedback,
        json!({
            "resolutions": resolutions,
            "total_conflicts": resolutions.len(),
            "resolved_count": resolved,
        }),
        producer,
    )
    .with_metadata("type", "conflict_resolution")
    .with_metadata("project_name", project)
}
