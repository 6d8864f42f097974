//! Versioned artifact store.
//!
//! Artifacts are the typed work-products exchanged between skills. The
//! store keeps an append-only history per artifact type: every `put`
//! assigns the next contiguous version for its type and nothing is ever
//! overwritten or deleted. The only in-place mutation is the review
//! status, which review gates flip to Approved or Rejected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Unique identifier for a stored artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(pub Uuid);

impl ArtifactId {
    /// Create a new unique artifact identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ArtifactId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ArtifactId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Kinds of work-products produced during the development lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Requirements,
    UserStories,
    Prd,
    SystemDesign,
    SystemRequirements,
    ArchitectureDesign,
    ApiContract,
    TechStack,
    SourceCode,
    UnitTests,
    TestResults,
    ReviewFeedback,
    TestPlan,
    TestCases,
    AutomatedTests,
    BugReport,
    ProgressReport,
    ArchitectureRequirement,
    FunctionalDesign,
    StatusTracking,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::Requirements => "requirements",
            ArtifactType::UserStories => "user_stories",
            ArtifactType::Prd => "prd",
            ArtifactType::SystemDesign => "system_design",
            ArtifactType::SystemRequirements => "system_requirements",
            ArtifactType::ArchitectureDesign => "architecture_design",
            ArtifactType::ApiContract => "api_contract",
            ArtifactType::TechStack => "tech_stack",
            ArtifactType::SourceCode => "source_code",
            ArtifactType::UnitTests => "unit_tests",
            ArtifactType::TestResults => "test_results",
            ArtifactType::ReviewFeedback => "review_feedback",
            ArtifactType::TestPlan => "test_plan",
            ArtifactType::TestCases => "test_cases",
            ArtifactType::AutomatedTests => "automated_tests",
            ArtifactType::BugReport => "bug_report",
            ArtifactType::ProgressReport => "progress_report",
            ArtifactType::ArchitectureRequirement => "architecture_requirement",
            ArtifactType::FunctionalDesign => "functional_design",
            ArtifactType::StatusTracking => "status_tracking",
        }
    }
}

impl std::fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Review lifecycle of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    #[default]
    Draft,
    InReview,
    Approved,
    Rejected,
}

impl std::fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactStatus::Draft => write!(f, "draft"),
            ArtifactStatus::InReview => write!(f, "in_review"),
            ArtifactStatus::Approved => write!(f, "approved"),
            ArtifactStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// A typed, versioned work-product.
///
/// Skills build artifacts with [`Artifact::new`]; the version and status
/// are assigned by [`ArtifactStore::put`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    pub version: u32,
    pub content: Value,
    pub status: ArtifactStatus,
    pub producer: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Artifact {
    pub fn new(artifact_type: ArtifactType, content: Value, producer: &str) -> Self {
        Self {
            id: ArtifactId::new(),
            artifact_type,
            version: 0,
            content,
            status: ArtifactStatus::Draft,
            producer: producer.to_string(),
            created_at: Utc::now(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Shorthand for a top-level content field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.content.get(key)
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    by_id: HashMap<ArtifactId, Artifact>,
    by_type: HashMap<ArtifactType, Vec<ArtifactId>>,
}

/// Append-only store of artifact versions keyed by type.
///
/// All writes happen under one write lock, so concurrent writers never
/// share a version number and readers never see a half-inserted entry.
#[derive(Debug, Default)]
pub struct ArtifactStore {
    inner: RwLock<StoreInner>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an artifact as the next version of its type.
    ///
    /// The stored copy always starts as Draft. An id that is already taken
    /// is replaced with a fresh one so history is never overwritten.
    pub fn put(&self, mut artifact: Artifact) -> Artifact {
        let mut inner = self.write();
        if inner.by_id.contains_key(&artifact.id) {
            artifact.id = ArtifactId::new();
        }
        let versions = inner.by_type.entry(artifact.artifact_type).or_default();
        artifact.version = versions.len() as u32 + 1;
        artifact.status = ArtifactStatus::Draft;
        versions.push(artifact.id);
        inner.by_id.insert(artifact.id, artifact.clone());
        tracing::debug!(
            artifact_id = %artifact.id,
            artifact_type = %artifact.artifact_type,
            version = artifact.version,
            producer = %artifact.producer,
            "artifact stored"
        );
        artifact
    }

    pub fn get(&self, id: &ArtifactId) -> Option<Artifact> {
        self.read().by_id.get(id).cloned()
    }

    /// Highest version of a type, or `None` when nothing was produced yet.
    pub fn latest(&self, artifact_type: ArtifactType) -> Option<Artifact> {
        let inner = self.read();
        inner
            .by_type
            .get(&artifact_type)
            .and_then(|ids| ids.last())
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    /// Shorthand for a content field of the latest artifact of a type.
    pub fn content_field(&self, artifact_type: ArtifactType, key: &str) -> Option<Value> {
        self.latest(artifact_type)
            .and_then(|a| a.content.get(key).cloned())
    }

    /// Update the review status of a stored artifact.
    ///
    /// Returns `false` when the id is unknown.
    pub fn set_status(&self, id: &ArtifactId, status: ArtifactStatus) -> bool {
        let mut inner = self.write();
        match inner.by_id.get_mut(id) {
            Some(artifact) => {
                artifact.status = status;
                tracing::debug!(artifact_id = %id, %status, "artifact status updated");
                true
            }
            None => false,
        }
    }

    /// Every version of a type, oldest first.
    pub fn history(&self, artifact_type: ArtifactType) -> Vec<Artifact> {
        let inner = self.read();
        inner
            .by_type
            .get(&artifact_type)
            .map(|ids| ids.iter().filter_map(|id| inner.by_id.get(id)).cloned().collect())
            .unwrap_or_default()
    }

    /// Every version of a type, newest first.
    pub fn by_type_newest_first(&self, artifact_type: ArtifactType) -> Vec<Artifact> {
        let mut versions = self.history(artifact_type);
        versions.reverse();
        versions
    }

    /// All artifacts, grouped by type in version order.
    pub fn all(&self) -> Vec<Artifact> {
        let inner = self.read();
        let mut types: Vec<_> = inner.by_type.keys().copied().collect();
        types.sort();
        types
            .into_iter()
            .flat_map(|t| inner.by_type[&t].iter())
            .filter_map(|id| inner.by_id.get(id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().by_id.is_empty()
    }

    pub fn count_by_type(&self) -> BTreeMap<ArtifactType, usize> {
        self.read()
            .by_type
            .iter()
            .map(|(t, ids)| (*t, ids.len()))
            .collect()
    }

    /// Rebuild a store from persisted history.
    ///
    /// Each type's versions must be contiguous from 1; statuses are kept as
    /// persisted.
    pub fn from_history(artifacts: Vec<Artifact>) -> Result<Self> {
        let mut grouped: BTreeMap<ArtifactType, Vec<Artifact>> = BTreeMap::new();
        for artifact in artifacts {
            grouped.entry(artifact.artifact_type).or_default().push(artifact);
        }

        let mut inner = StoreInner::default();
        for (artifact_type, mut versions) in grouped {
            versions.sort_by_key(|a| a.version);
            for (index, artifact) in versions.into_iter().enumerate() {
                let expected = index as u32 + 1;
                if artifact.version != expected {
                    return Err(Error::CorruptHistory(format!(
                        "{} has version {} where {} was expected",
                        artifact_type, artifact.version, expected
                    )));
                }
                if inner.by_id.contains_key(&artifact.id) {
                    return Err(Error::CorruptHistory(format!(
                        "duplicate artifact id {}",
                        artifact.id
                    )));
                }
                inner.by_type.entry(artifact_type).or_default().push(artifact.id);
                inner.by_id.insert(artifact.id, artifact);
            }
        }

        Ok(Self {
            inner: RwLock::new(inner),
        })
    }
}
