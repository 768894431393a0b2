//! Core domain model for the demand deduplication & matching engine.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ddm-core";

/// Canonical city token for fully remote work. Folk phrasings of
/// "working from home" collapse to this token during extraction.
pub const REMOTE_CITY: &str = "远程";

/// Structured hints a submitter may attach to a posting. Every field is
/// optional; absent means absent, never guessed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DemandHints {
    #[serde(default)]
    pub module_codes: Vec<String>,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub is_remote: Option<bool>,
    #[serde(default)]
    pub duration_text: String,
    #[serde(default)]
    pub years_text: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub daily_rate: String,
    #[serde(default)]
    pub cooperation_mode: String,
    #[serde(default)]
    pub work_mode: String,
    #[serde(default)]
    pub consultant_level: String,
    #[serde(default)]
    pub project_cycle: String,
    #[serde(default)]
    pub time_requirement: String,
}

/// One ingested free-text demand submission. Immutable once written except
/// for its canonical link and the override audit fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPosting {
    pub id: Uuid,
    pub raw_text: String,
    pub hints: DemandHints,
    pub submitter_id: Option<String>,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Link to the canonical demand this posting restates.
    pub unique_demand_id: Option<String>,
    pub override_by: Option<String>,
    pub override_at: Option<DateTime<Utc>>,
}

impl RawPosting {
    pub fn new(
        raw_text: impl Into<String>,
        hints: DemandHints,
        submitter_id: Option<String>,
        source: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            raw_text: raw_text.into(),
            hints,
            submitter_id,
            source: source.into(),
            created_at: now,
            updated_at: now,
            unique_demand_id: None,
            override_by: None,
            override_at: None,
        }
    }
}

/// Classification tag on a canonical demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DemandType {
    Valid,
    Filtered,
}

/// The deduplicated identity for one real underlying demand. Created once,
/// refreshed on every subsequent match, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalDemand {
    /// Content-derived identifier: hex sha256 of normalized text + raw id.
    pub id: String,
    /// Normalized text snapshot taken at creation.
    pub raw_text: String,
    /// Serialized category attributes of the creating posting.
    pub attributes_json: JsonValue,
    pub canonical_raw_id: Option<Uuid>,
    pub canonical_raw_set_by: Option<String>,
    pub canonical_raw_set_at: Option<DateTime<Utc>>,
    pub richness_score: f64,
    pub demand_type: DemandType,
    pub created_time: DateTime<Utc>,
    pub message_time: DateTime<Utc>,
    pub last_updated_time: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    // Epoch-millis mirrors kept for range queries.
    pub created_time_ts: i64,
    pub message_time_ts: i64,
    pub last_updated_time_ts: i64,
    pub updated_at_ts: i64,
}

impl CanonicalDemand {
    pub fn new(
        id: impl Into<String>,
        normalized_text: impl Into<String>,
        attributes_json: JsonValue,
        richness_score: f64,
        canonical_raw_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Self {
        let ts = now.timestamp_millis();
        Self {
            id: id.into(),
            raw_text: normalized_text.into(),
            attributes_json,
            canonical_raw_id,
            canonical_raw_set_by: None,
            canonical_raw_set_at: None,
            richness_score,
            demand_type: DemandType::Valid,
            created_time: now,
            message_time: now,
            last_updated_time: now,
            updated_at: now,
            created_time_ts: ts,
            message_time_ts: ts,
            last_updated_time_ts: ts,
            updated_at_ts: ts,
        }
    }

    /// Refresh recency metadata after a match. `last_updated_time` is
    /// non-decreasing even if the caller's clock is behind.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        let next = self.last_updated_time.max(now);
        self.last_updated_time = next;
        self.last_updated_time_ts = next.timestamp_millis();
        let updated = self.updated_at.max(now);
        self.updated_at = updated;
        self.updated_at_ts = updated.timestamp_millis();
    }
}

/// Matching rule selecting which score must clear the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityRule {
    Text,
    Category,
    Hybrid,
}

impl SimilarityRule {
    /// Lenient parse used at untyped boundaries; unknown values fall back
    /// to the canonical default.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "text" => Self::Text,
            "category" => Self::Category,
            "hybrid" => Self::Hybrid,
            _ => Self::Hybrid,
        }
    }
}

pub const THRESHOLD_MIN: f64 = 0.5;
pub const THRESHOLD_MAX: f64 = 0.99;
pub const DEFAULT_THRESHOLD: f64 = 0.85;

/// Process-wide, admin-mutable matching configuration. Read once per
/// ingestion; last-writer-wins on update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityConfig {
    pub enabled: bool,
    pub rule: SimilarityRule,
    pub threshold: f64,
    #[serde(default)]
    pub updated_by: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rule: SimilarityRule::Hybrid,
            threshold: DEFAULT_THRESHOLD,
            updated_by: None,
            updated_at: None,
        }
    }
}

impl SimilarityConfig {
    pub fn clamp_threshold(value: f64) -> f64 {
        if !value.is_finite() {
            return DEFAULT_THRESHOLD;
        }
        value.clamp(THRESHOLD_MIN, THRESHOLD_MAX)
    }

    /// Return a copy with the threshold forced into its legal range.
    pub fn normalized(mut self) -> Self {
        self.threshold = Self::clamp_threshold(self.threshold);
        self
    }
}

/// Structured attributes derived fresh on every comparison, from either a
/// posting's hints or a canonical record's serialized attributes. Empty
/// string means the attribute is absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryAttributes {
    #[serde(default)]
    pub module_codes: BTreeSet<String>,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub is_remote: Option<bool>,
    #[serde(default)]
    pub duration_text: String,
    #[serde(default)]
    pub years_text: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub cooperation_mode: String,
    #[serde(default)]
    pub work_mode: String,
    #[serde(default)]
    pub consultant_level: String,
    #[serde(default)]
    pub project_cycle: String,
    #[serde(default)]
    pub time_requirement: String,
}

impl CategoryAttributes {
    pub const FIELD_COUNT: usize = 11;

    /// Number of attributes actually present.
    pub fn filled_count(&self) -> usize {
        let strings = [
            &self.city,
            &self.duration_text,
            &self.years_text,
            &self.language,
            &self.cooperation_mode,
            &self.work_mode,
            &self.consultant_level,
            &self.project_cycle,
            &self.time_requirement,
        ];
        let mut count = strings.iter().filter(|s| !s.is_empty()).count();
        if !self.module_codes.is_empty() {
            count += 1;
        }
        if self.is_remote.is_some() {
            count += 1;
        }
        count
    }
}
