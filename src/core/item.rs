//! Memory record types shared by every backend.
//!
//! `MemoryItem` is the unified record representation. Backends persist it
//! however they like (rows, documents, remote payloads) but always hand this
//! shape back to the service layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Default result limit for searches.
pub const DEFAULT_SEARCH_LIMIT: usize = 10;

/// Default similarity threshold for backends that rank by similarity.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.7;

/// Memory category.
///
/// A closed set: every record carries exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    /// Architectural decisions, requirements, milestones.
    Project,
    /// Successful solutions, code patterns, reusable approaches.
    Pattern,
    /// Coding standards, team preferences, workflows.
    Team,
    /// Bug patterns, error solutions, debugging knowledge.
    Error,
}

impl MemoryCategory {
    /// All categories, in display order.
    pub const ALL: [MemoryCategory; 4] = [
        MemoryCategory::Project,
        MemoryCategory::Pattern,
        MemoryCategory::Team,
        MemoryCategory::Error,
    ];

    /// Get the category name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Pattern => "pattern",
            Self::Team => "team",
            Self::Error => "error",
        }
    }

    /// Parse a category name leniently.
    ///
    /// Unknown values fall back to `Project` so that records written by
    /// older or foreign tooling still load.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "pattern" => Self::Pattern,
            "team" => Self::Team,
            "error" => Self::Error,
            _ => Self::Project,
        }
    }
}

impl std::fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One stored memory record.
///
/// Identity is immutable once assigned by a backend; content, tags and
/// metadata are mutable in place. `updated_at` moves on every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    /// Opaque unique identifier, assigned by the backend that accepted the
    /// original write.
    pub id: String,
    /// Owning project namespace.
    pub project_name: String,
    /// Free-text content.
    pub content: String,
    /// Category tag.
    pub category: MemoryCategory,
    /// Unordered tag set. Normalized on construction: trimmed, empties
    /// dropped, duplicates removed.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Open key-value metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last mutated.
    pub updated_at: DateTime<Utc>,
}

impl MemoryItem {
    /// Create a new record with the given identity.
    pub fn new(
        id: impl Into<String>,
        project_name: impl Into<String>,
        content: impl Into<String>,
        category: MemoryCategory,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            project_name: project_name.into(),
            content: content.into(),
            category,
            tags: Vec::new(),
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the tags (normalized).
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = normalize_tags(tags);
        self
    }

    /// Set the metadata map.
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Bump the updated-at timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Apply a patch to this record, bumping `updated_at` when anything
    /// changed. Returns whether a field was actually applied.
    pub fn apply(&mut self, patch: &MemoryPatch) -> bool {
        let mut changed = false;
        if let Some(content) = &patch.content {
            self.content = content.clone();
            changed = true;
        }
        if let Some(tags) = &patch.tags {
            self.tags = normalize_tags(tags.clone());
            changed = true;
        }
        if let Some(metadata) = &patch.metadata {
            self.metadata = metadata.clone();
            changed = true;
        }
        if changed {
            self.touch();
        }
        changed
    }

    /// Case-insensitive containment match over content, tags and metadata.
    pub fn matches_text(&self, query: &str) -> bool {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return true;
        }
        if self.content.to_lowercase().contains(&query) {
            return true;
        }
        if self.tags.iter().any(|t| t.to_lowercase().contains(&query)) {
            return true;
        }
        Value::Object(self.metadata.clone())
            .to_string()
            .to_lowercase()
            .contains(&query)
    }
}

/// Normalize a tag list: trim, drop empties, dedup preserving first
/// occurrence order.
pub fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut seen = Vec::new();
    for tag in tags {
        let tag = tag.trim().to_string();
        if tag.is_empty() || seen.contains(&tag) {
            continue;
        }
        seen.push(tag);
    }
    seen
}

/// Payload for creating a new record.
///
/// Backends assign the id and timestamps themselves; callers only supply
/// what the record says.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryDraft {
    /// Free-text content.
    pub content: String,
    /// Category tag.
    pub category: MemoryCategory,
    /// Tags (normalized on construction).
    #[serde(default)]
    pub tags: Vec<String>,
    /// Open metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl MemoryDraft {
    /// Create a draft with content and category.
    pub fn new(content: impl Into<String>, category: MemoryCategory) -> Self {
        Self {
            content: content.into(),
            category,
            tags: Vec::new(),
            metadata: Map::new(),
        }
    }

    /// Add tags.
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = normalize_tags(tags);
        self
    }

    /// Add metadata.
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Partial update for an existing record. `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryPatch {
    /// Replacement content.
    pub content: Option<String>,
    /// Replacement tag set.
    pub tags: Option<Vec<String>>,
    /// Replacement metadata map.
    pub metadata: Option<Map<String, Value>>,
}

impl MemoryPatch {
    /// Create an empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set replacement content.
    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Set replacement tags.
    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = Some(tags);
        self
    }

    /// Set replacement metadata.
    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Check if the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.content.is_none() && self.tags.is_none() && self.metadata.is_none()
    }
}

/// Search query parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryQuery {
    /// Free-text query string. Empty matches everything.
    pub query: String,
    /// Optional category filter.
    pub category: Option<MemoryCategory>,
    /// Optional tag filter; a record must carry every listed tag.
    pub tags: Option<Vec<String>>,
    /// Maximum results to return. Must be positive; `normalize` restores
    /// the default otherwise.
    pub limit: usize,
    /// Results to skip from the backend's natural order.
    pub offset: usize,
    /// Similarity threshold in [0, 1]. Only meaningful for backends that
    /// advertise similarity search.
    pub similarity_threshold: f32,
    /// Whether results should carry their metadata maps.
    pub include_metadata: bool,
}

impl Default for MemoryQuery {
    fn default() -> Self {
        Self {
            query: String::new(),
            category: None,
            tags: None,
            limit: DEFAULT_SEARCH_LIMIT,
            offset: 0,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            include_metadata: true,
        }
    }
}

impl MemoryQuery {
    /// Create a query for the given text.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    /// Set the category filter.
    pub fn category(mut self, category: MemoryCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// Set the tag filter.
    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = Some(normalize_tags(tags));
        self
    }

    /// Set the result limit.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Set the result offset.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Set the similarity threshold.
    pub fn similarity_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    /// Set whether metadata is included in results.
    pub fn include_metadata(mut self, include: bool) -> Self {
        self.include_metadata = include;
        self
    }

    /// Return a copy with out-of-range fields pulled back to defaults.
    ///
    /// A non-positive limit becomes the default, and the similarity
    /// threshold is restored to its default when outside [0, 1].
    pub fn normalized(&self) -> Self {
        let mut query = self.clone();
        if query.limit == 0 {
            query.limit = DEFAULT_SEARCH_LIMIT;
        }
        if !query.similarity_threshold.is_finite()
            || !(0.0..=1.0).contains(&query.similarity_threshold)
        {
            query.similarity_threshold = DEFAULT_SIMILARITY_THRESHOLD;
        }
        query
    }

    /// Check whether a record passes the category, tag and text filters.
    ///
    /// Limit and offset are windowing concerns and not checked here.
    pub fn matches(&self, item: &MemoryItem) -> bool {
        if let Some(category) = self.category {
            if item.category != category {
                return false;
            }
        }
        if let Some(tags) = &self.tags {
            if !tags.iter().all(|t| item.tags.contains(t)) {
                return false;
            }
        }
        item.matches_text(&self.query)
    }

    /// Apply this query's offset and limit to an already-ordered result set.
    pub fn window(&self, items: Vec<MemoryItem>) -> Vec<MemoryItem> {
        items
            .into_iter()
            .skip(self.offset)
            .take(self.limit)
            .collect()
    }
}

/// Per-project statistics reported by a backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Total records in the project.
    pub total: u64,
    /// Record counts by category name.
    #[serde(default)]
    pub by_category: BTreeMap<String, u64>,
    /// Timestamp of the most recent record.
    pub newest: Option<DateTime<Utc>>,
    /// Timestamp of the oldest record.
    pub oldest: Option<DateTime<Utc>>,
}

impl MemoryStats {
    /// Compute stats from a slice of records.
    pub fn from_items(items: &[MemoryItem]) -> Self {
        let mut by_category = BTreeMap::new();
        for item in items {
            *by_category.entry(item.category.as_str().to_string()).or_insert(0) += 1;
        }
        Self {
            total: items.len() as u64,
            by_category,
            newest: items.iter().map(|i| i.created_at).max(),
            oldest: items.iter().map(|i| i.created_at).min(),
        }
    }
}

/// Sort records most-recent-first, with id as a stable tiebreak.
pub fn sort_most_recent_first(items: &mut [MemoryItem]) {
    items.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}
