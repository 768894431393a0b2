//! Deduplication engine: ingestion pipeline, matching policy, canonical
//! assignment and administrator overrides.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use ddm_core::{
    CanonicalDemand, CategoryAttributes, DemandHints, RawPosting, SimilarityConfig,
    SimilarityRule,
};
use ddm_match::{
    attributes_to_json, category_similarity, extract_from_attributes_json, extract_from_hints,
    normalize_text, richness_score, text_similarity,
};
use ddm_storage::{
    fetch_candidates, Authorizer, CanonicalDemandStore, ConfigStore, RawPostingStore,
    RecencyField, SortOrder, StoreError,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ddm-engine";

/// Default bound on the candidate pool fetched per ingestion.
pub const DEFAULT_CANDIDATE_LIMIT: usize = 200;
/// Default lookback window for `check_similar`, in days.
pub const DEFAULT_SINCE_DAYS: i64 = 7;
/// Default number of candidates returned by `check_similar`.
pub const DEFAULT_SIMILAR_LIMIT: usize = 5;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("actor is not an administrator")]
    Unauthorized,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => EngineError::NotFound(what),
            other => EngineError::Storage(other.to_string()),
        }
    }
}

/// Content-derived canonical identifier: hex sha256 over the normalized
/// text and the creating raw posting's id.
pub fn canonical_demand_id(normalized_text: &str, raw_id: Uuid) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_text.as_bytes());
    hasher.update(raw_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Per-ingestion decision trace returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct MatchDiagnostics {
    pub matched: bool,
    pub rule: SimilarityRule,
    pub threshold: f64,
    pub candidate_pool: usize,
    pub best_category_score: f64,
    pub best_text_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReceipt {
    pub raw_id: Uuid,
    pub canonical_id: String,
    pub diagnostics: MatchDiagnostics,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimilarCandidate {
    pub canonical_id: String,
    pub raw_text: String,
    pub score: f64,
    pub text_score: f64,
    pub category_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimilarityReport {
    pub has_similar: bool,
    pub threshold: f64,
    pub rule: SimilarityRule,
    pub candidates: Vec<SimilarCandidate>,
}

/// Partial config update; absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigPatch {
    pub enabled: Option<bool>,
    pub rule: Option<SimilarityRule>,
    pub threshold: Option<f64>,
}

struct Scored {
    index: usize,
    category: f64,
    text: f64,
}

impl Scored {
    fn matches(&self, rule: SimilarityRule, threshold: f64) -> bool {
        match rule {
            SimilarityRule::Text => self.text >= threshold,
            SimilarityRule::Category => self.category >= threshold,
            SimilarityRule::Hybrid => self.text >= threshold || self.category >= threshold,
        }
    }

    /// Pool-order-stable comparison: category first, then text.
    fn beats(&self, other: &Scored) -> bool {
        self.category > other.category
            || (self.category == other.category && self.text > other.text)
    }
}

fn score_pool(attrs: &CategoryAttributes, raw_text: &str, pool: &[CanonicalDemand]) -> Vec<Scored> {
    pool.iter()
        .enumerate()
        .map(|(index, candidate)| {
            let cand_attrs = extract_from_attributes_json(&candidate.attributes_json);
            Scored {
                index,
                category: category_similarity(attrs, &cand_attrs),
                text: text_similarity(raw_text, &candidate.raw_text),
            }
        })
        .collect()
}

/// Greedy single pass over the pool: best matching candidate by category
/// score, ties by text score, remaining ties by pool order.
fn best_match(scores: &[Scored], rule: SimilarityRule, threshold: f64) -> Option<&Scored> {
    let mut best: Option<&Scored> = None;
    for scored in scores {
        if !scored.matches(rule, threshold) {
            continue;
        }
        match best {
            Some(current) if !scored.beats(current) => {}
            _ => best = Some(scored),
        }
    }
    best
}

/// The deduplication engine. Stores and the admin gate are trait objects so
/// tests and the CLI can run against memory while the service runs Postgres.
pub struct DedupEngine {
    raws: Arc<dyn RawPostingStore>,
    canonicals: Arc<dyn CanonicalDemandStore>,
    configs: Arc<dyn ConfigStore>,
    authorizer: Arc<dyn Authorizer>,
    candidate_limit: usize,
}

impl DedupEngine {
    pub fn new(
        raws: Arc<dyn RawPostingStore>,
        canonicals: Arc<dyn CanonicalDemandStore>,
        configs: Arc<dyn ConfigStore>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            raws,
            canonicals,
            configs,
            authorizer,
            candidate_limit: DEFAULT_CANDIDATE_LIMIT,
        }
    }

    pub fn with_candidate_limit(mut self, limit: usize) -> Self {
        self.candidate_limit = limit.max(1);
        self
    }

    /// Effective config for this call: stored value when readable,
    /// canonical default otherwise. Config trouble never blocks ingestion.
    async fn load_config(&self) -> SimilarityConfig {
        match self.configs.get_similarity_config().await {
            Ok(Some(config)) => config.normalized(),
            Ok(None) => SimilarityConfig::default(),
            Err(err) => {
                warn!(%err, "config read failed; using defaults");
                SimilarityConfig::default()
            }
        }
    }

    async fn require_admin(&self, actor: &str) -> Result<(), EngineError> {
        let ok = self
            .authorizer
            .is_admin(actor)
            .await
            .map_err(EngineError::from)?;
        if ok {
            Ok(())
        } else {
            Err(EngineError::Unauthorized)
        }
    }

    /// Ingest one posting: persist it, match it against recent canonical
    /// demands and either link it to the winner or mint a new canonical
    /// record for it.
    pub async fn ingest(
        &self,
        raw_text: &str,
        hints: DemandHints,
        submitter_id: Option<String>,
        source: &str,
    ) -> Result<IngestReceipt, EngineError> {
        if raw_text.trim().is_empty() {
            return Err(EngineError::Validation("raw_text must not be empty".into()));
        }

        let now = Utc::now();
        let config = self.load_config().await;
        let posting = RawPosting::new(raw_text, hints, submitter_id, source, now);
        self.raws.create(&posting).await?;

        let attrs = extract_from_hints(&posting.hints);

        if !config.enabled {
            let canonical_id = self.create_canonical(&posting, &attrs, now).await?;
            self.raws
                .set_link(posting.id, Some(&canonical_id), None, now)
                .await?;
            return Ok(IngestReceipt {
                raw_id: posting.id,
                canonical_id,
                diagnostics: MatchDiagnostics {
                    matched: false,
                    rule: config.rule,
                    threshold: config.threshold,
                    candidate_pool: 0,
                    best_category_score: 0.0,
                    best_text_score: 0.0,
                },
            });
        }

        let pool = fetch_candidates(self.canonicals.as_ref(), self.candidate_limit).await;
        let scores = score_pool(&attrs, &posting.raw_text, &pool);
        let winner = best_match(&scores, config.rule, config.threshold);

        let mut diagnostics = MatchDiagnostics {
            matched: false,
            rule: config.rule,
            threshold: config.threshold,
            candidate_pool: pool.len(),
            best_category_score: scores.iter().map(|s| s.category).fold(0.0, f64::max),
            best_text_score: scores.iter().map(|s| s.text).fold(0.0, f64::max),
        };

        let canonical_id = match winner {
            Some(scored) => {
                let canonical = &pool[scored.index];
                diagnostics.matched = true;
                info!(
                    raw_id = %posting.id,
                    canonical_id = %canonical.id,
                    category_score = scored.category,
                    text_score = scored.text,
                    "posting matched an existing demand"
                );
                // Recency refresh and representative assignment are
                // best-effort; the link below is what must not be lost.
                if let Err(err) = self.canonicals.touch(&canonical.id, now).await {
                    warn!(canonical_id = %canonical.id, %err, "recency refresh failed");
                }
                match self
                    .canonicals
                    .set_canonical_raw_if_unset(&canonical.id, posting.id, now)
                    .await
                {
                    Ok(_) => {}
                    Err(err) => {
                        warn!(canonical_id = %canonical.id, %err, "representative assignment failed");
                    }
                }
                canonical.id.clone()
            }
            None => {
                let id = self.create_canonical(&posting, &attrs, now).await?;
                info!(raw_id = %posting.id, canonical_id = %id, "posting created a new demand");
                id
            }
        };

        self.raws
            .set_link(posting.id, Some(&canonical_id), None, now)
            .await?;

        Ok(IngestReceipt {
            raw_id: posting.id,
            canonical_id,
            diagnostics,
        })
    }

    async fn create_canonical(
        &self,
        posting: &RawPosting,
        attrs: &CategoryAttributes,
        now: DateTime<Utc>,
    ) -> Result<String, EngineError> {
        let normalized = normalize_text(&posting.raw_text);
        let id = canonical_demand_id(&normalized, posting.id);
        let demand = CanonicalDemand::new(
            id.clone(),
            normalized,
            attributes_to_json(attrs),
            richness_score(attrs),
            Some(posting.id),
            now,
        );
        self.canonicals.create(&demand).await?;
        Ok(id)
    }

    /// Read-only similarity probe over recently active demands. Never
    /// writes anything.
    pub async fn check_similar(
        &self,
        raw_text: &str,
        hints: &DemandHints,
        since_days: Option<i64>,
        limit: Option<usize>,
        threshold_override: Option<f64>,
        rule_override: Option<SimilarityRule>,
    ) -> Result<SimilarityReport, EngineError> {
        if raw_text.trim().is_empty() {
            return Err(EngineError::Validation("raw_text must not be empty".into()));
        }

        let config = self.load_config().await;
        let rule = rule_override.unwrap_or(config.rule);
        let threshold = SimilarityConfig::clamp_threshold(
            threshold_override.unwrap_or(config.threshold),
        );
        let since_days = since_days.unwrap_or(DEFAULT_SINCE_DAYS).max(0);
        let limit = limit.unwrap_or(DEFAULT_SIMILAR_LIMIT).max(1);

        let cutoff_ts = (Utc::now() - Duration::days(since_days)).timestamp_millis();
        let attrs = extract_from_hints(hints);
        let pool = fetch_candidates(self.canonicals.as_ref(), self.candidate_limit).await;

        let mut candidates: Vec<SimilarCandidate> = pool
            .iter()
            .filter(|d| d.last_updated_time_ts >= cutoff_ts)
            .map(|d| {
                let cand_attrs = extract_from_attributes_json(&d.attributes_json);
                let category = category_similarity(&attrs, &cand_attrs);
                let text = text_similarity(raw_text, &d.raw_text);
                let score = match rule {
                    SimilarityRule::Text => text,
                    SimilarityRule::Category => category,
                    SimilarityRule::Hybrid => text.max(category),
                };
                SimilarCandidate {
                    canonical_id: d.id.clone(),
                    raw_text: d.raw_text.clone(),
                    score,
                    text_score: text,
                    category_score: category,
                }
            })
            .collect();
        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(limit);

        Ok(SimilarityReport {
            has_similar: candidates.iter().any(|c| c.score >= threshold),
            threshold,
            rule,
            candidates,
        })
    }

    /// Point a raw posting at a different canonical demand.
    pub async fn admin_link_raw(
        &self,
        raw_id: Uuid,
        canonical_id: &str,
        actor: &str,
    ) -> Result<(), EngineError> {
        self.require_admin(actor).await?;
        if self.raws.get(raw_id).await?.is_none() {
            return Err(EngineError::NotFound(raw_id.to_string()));
        }
        if self.canonicals.get(canonical_id).await?.is_none() {
            return Err(EngineError::NotFound(canonical_id.to_string()));
        }
        self.raws
            .set_link(raw_id, Some(canonical_id), Some(actor), Utc::now())
            .await?;
        info!(%raw_id, canonical_id, actor, "raw posting relinked by administrator");
        Ok(())
    }

    /// Detach a raw posting from its canonical demand.
    pub async fn admin_unlink_raw(&self, raw_id: Uuid, actor: &str) -> Result<(), EngineError> {
        self.require_admin(actor).await?;
        if self.raws.get(raw_id).await?.is_none() {
            return Err(EngineError::NotFound(raw_id.to_string()));
        }
        self.raws
            .set_link(raw_id, None, Some(actor), Utc::now())
            .await?;
        info!(%raw_id, actor, "raw posting unlinked by administrator");
        Ok(())
    }

    /// Force a canonical demand's representative raw posting. The only way
    /// an already-set representative changes.
    pub async fn admin_set_canonical_raw(
        &self,
        canonical_id: &str,
        raw_id: Uuid,
        actor: &str,
    ) -> Result<(), EngineError> {
        self.require_admin(actor).await?;
        if self.raws.get(raw_id).await?.is_none() {
            return Err(EngineError::NotFound(raw_id.to_string()));
        }
        self.canonicals
            .force_canonical_raw(canonical_id, raw_id, actor, Utc::now())
            .await?;
        info!(canonical_id, %raw_id, actor, "representative raw forced by administrator");
        Ok(())
    }

    /// Effective matching config; degrades to the default when unreadable.
    pub async fn get_config(&self) -> SimilarityConfig {
        self.load_config().await
    }

    /// Apply an admin patch over the current config. Last writer wins.
    pub async fn update_config(
        &self,
        patch: ConfigPatch,
        actor: &str,
    ) -> Result<SimilarityConfig, EngineError> {
        self.require_admin(actor).await?;
        let mut config = self.load_config().await;
        if let Some(enabled) = patch.enabled {
            config.enabled = enabled;
        }
        if let Some(rule) = patch.rule {
            config.rule = rule;
        }
        if let Some(threshold) = patch.threshold {
            config.threshold = SimilarityConfig::clamp_threshold(threshold);
        }
        config.updated_by = Some(actor.to_string());
        config.updated_at = Some(Utc::now());
        self.configs.put_similarity_config(&config).await?;
        Ok(config)
    }

    pub async fn get_raw(&self, raw_id: Uuid) -> Result<RawPosting, EngineError> {
        self.raws
            .get(raw_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(raw_id.to_string()))
    }

    pub async fn get_demand(&self, canonical_id: &str) -> Result<CanonicalDemand, EngineError> {
        self.canonicals
            .get(canonical_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(canonical_id.to_string()))
    }

    pub async fn count_demands(
        &self,
        field: RecencyField,
        start_ts: i64,
        end_ts: i64,
        only_valid: bool,
    ) -> Result<u64, EngineError> {
        Ok(self
            .canonicals
            .count_range(field, start_ts, end_ts, only_valid)
            .await?)
    }

    pub async fn range_demands(
        &self,
        field: RecencyField,
        start_ts: i64,
        end_ts: i64,
        only_valid: bool,
        order: SortOrder,
        limit: usize,
    ) -> Result<Vec<CanonicalDemand>, EngineError> {
        Ok(self
            .canonicals
            .list_range(field, start_ts, end_ts, only_valid, order, limit)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddm_storage::MemoryStore;

    fn engine_on(store: Arc<MemoryStore>) -> DedupEngine {
        DedupEngine::new(
            store.clone(),
            store.clone(),
            store,
            Arc::new(ddm_storage::StaticAdminList::new(["admin-1"])),
        )
    }

    fn fico_hints(city: &str, years: &str) -> DemandHints {
        DemandHints {
            module_codes: vec!["FICO".into()],
            city: city.into(),
            years_text: years.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn ingest_rejects_empty_text() {
        let engine = engine_on(MemoryStore::new());
        let err = engine
            .ingest("   ", DemandHints::default(), None, "test")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn identical_repost_joins_the_existing_demand() {
        let store = MemoryStore::new();
        let engine = engine_on(store.clone());
        let text = "急需 FICO 顾问，上海，5年以上经验";

        let first = engine
            .ingest(text, fico_hints("上海", "5年"), Some("u1".into()), "wechat")
            .await
            .unwrap();
        assert!(!first.diagnostics.matched);

        let second = engine
            .ingest(text, fico_hints("上海", "5年"), Some("u2".into()), "wechat")
            .await
            .unwrap();
        assert!(second.diagnostics.matched);
        assert_eq!(second.canonical_id, first.canonical_id);

        let raw = engine.get_raw(second.raw_id).await.unwrap();
        assert_eq!(raw.unique_demand_id.as_deref(), Some(first.canonical_id.as_str()));

        // First writer keeps the representative slot.
        let demand = engine.get_demand(&first.canonical_id).await.unwrap();
        assert_eq!(demand.canonical_raw_id, Some(first.raw_id));
    }

    #[tokio::test]
    async fn hybrid_rule_matches_on_category_when_text_diverges() {
        let store = MemoryStore::new();
        let engine = engine_on(store.clone());
        engine
            .update_config(
                ConfigPatch {
                    threshold: Some(0.8),
                    ..Default::default()
                },
                "admin-1",
            )
            .await
            .unwrap();

        let first = engine
            .ingest(
                "急需 FICO 顾问常驻上海客户现场",
                fico_hints("上海", "5年"),
                None,
                "wechat",
            )
            .await
            .unwrap();

        // Different phrasing, same demand shape: modules and city agree,
        // years differ, so category scores 5/6 while text stays low.
        let second = engine
            .ingest(
                "上海项目找一位 FICO 模块专家",
                fico_hints("上海", "8年"),
                None,
                "email",
            )
            .await
            .unwrap();
        assert!(second.diagnostics.matched);
        assert_eq!(second.canonical_id, first.canonical_id);
        assert!(second.diagnostics.best_category_score >= 0.8);
        assert!(second.diagnostics.best_text_score < 0.8);
    }

    #[tokio::test]
    async fn rule_arms_gate_on_their_own_score() {
        let store = MemoryStore::new();
        let engine = engine_on(store.clone());
        let text = "急需 FICO 顾问，尽快到岗";

        engine
            .update_config(
                ConfigPatch {
                    rule: Some(SimilarityRule::Category),
                    ..Default::default()
                },
                "admin-1",
            )
            .await
            .unwrap();

        let shanghai = engine
            .ingest(text, fico_hints("上海", ""), None, "t")
            .await
            .unwrap();

        // Identical text, different city: the city veto zeroes the
        // category score, so the category rule never matches even though
        // the text score is perfect.
        let beijing = engine
            .ingest(text, fico_hints("北京", ""), None, "t")
            .await
            .unwrap();
        assert!(!beijing.diagnostics.matched);
        assert_ne!(beijing.canonical_id, shanghai.canonical_id);
        assert_eq!(beijing.diagnostics.best_text_score, 1.0);
        assert_eq!(beijing.diagnostics.best_category_score, 0.0);

        // The text rule matches on text alone and ignores the veto.
        engine
            .update_config(
                ConfigPatch {
                    rule: Some(SimilarityRule::Text),
                    ..Default::default()
                },
                "admin-1",
            )
            .await
            .unwrap();
        let chengdu = engine
            .ingest(text, fico_hints("成都", ""), None, "t")
            .await
            .unwrap();
        assert!(chengdu.diagnostics.matched);
        assert_eq!(chengdu.diagnostics.best_category_score, 0.0);

        // Hybrid also accepts the text-driven match.
        engine
            .update_config(
                ConfigPatch {
                    rule: Some(SimilarityRule::Hybrid),
                    ..Default::default()
                },
                "admin-1",
            )
            .await
            .unwrap();
        let again = engine
            .ingest(text, fico_hints("北京", ""), None, "t")
            .await
            .unwrap();
        assert!(again.diagnostics.matched);
        assert_eq!(again.canonical_id, beijing.canonical_id);
    }

    #[tokio::test]
    async fn admin_representative_survives_later_matches() {
        let store = MemoryStore::new();
        let engine = engine_on(store.clone());
        let text = "急需 FICO 顾问，上海，5年以上经验";

        let first = engine
            .ingest(text, fico_hints("上海", "5年"), None, "t")
            .await
            .unwrap();
        let second = engine
            .ingest(text, fico_hints("上海", "5年"), None, "t")
            .await
            .unwrap();
        assert!(second.diagnostics.matched);

        engine
            .admin_set_canonical_raw(&first.canonical_id, second.raw_id, "admin-1")
            .await
            .unwrap();

        // A later automatic match must not steal the representative slot
        // back from the administrator's choice.
        let third = engine
            .ingest(text, fico_hints("上海", "5年"), None, "t")
            .await
            .unwrap();
        assert!(third.diagnostics.matched);
        assert_eq!(third.canonical_id, first.canonical_id);

        let demand = engine.get_demand(&first.canonical_id).await.unwrap();
        assert_eq!(demand.canonical_raw_id, Some(second.raw_id));
        assert_eq!(demand.canonical_raw_set_by.as_deref(), Some("admin-1"));
    }

    #[tokio::test]
    async fn disabled_config_always_creates_new_demands() {
        let store = MemoryStore::new();
        let engine = engine_on(store.clone());
        engine
            .update_config(
                ConfigPatch {
                    enabled: Some(false),
                    ..Default::default()
                },
                "admin-1",
            )
            .await
            .unwrap();

        let text = "急需 FICO 顾问，上海";
        let first = engine
            .ingest(text, fico_hints("上海", ""), None, "t")
            .await
            .unwrap();
        let second = engine
            .ingest(text, fico_hints("上海", ""), None, "t")
            .await
            .unwrap();
        assert_ne!(first.canonical_id, second.canonical_id);
        assert_eq!(second.diagnostics.candidate_pool, 0);
    }

    #[tokio::test]
    async fn check_similar_reports_without_writing() {
        let store = MemoryStore::new();
        let engine = engine_on(store.clone());
        let text = "急需 FICO 顾问，上海，5年以上经验";
        engine
            .ingest(text, fico_hints("上海", "5年"), None, "t")
            .await
            .unwrap();

        let before = engine
            .count_demands(RecencyField::CreatedTimeTs, 0, i64::MAX, false)
            .await
            .unwrap();
        let report = engine
            .check_similar(text, &fico_hints("上海", "5年"), None, None, None, None)
            .await
            .unwrap();
        assert!(report.has_similar);
        assert_eq!(report.candidates.len(), 1);
        assert_eq!(report.candidates[0].text_score, 1.0);

        let after = engine
            .count_demands(RecencyField::CreatedTimeTs, 0, i64::MAX, false)
            .await
            .unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn check_similar_override_clamps_threshold() {
        let engine = engine_on(MemoryStore::new());
        let report = engine
            .check_similar("some demand", &DemandHints::default(), None, None, Some(0.1), None)
            .await
            .unwrap();
        assert_eq!(report.threshold, 0.5);
    }

    #[tokio::test]
    async fn admin_overrides_are_gated_and_audited() {
        let store = MemoryStore::new();
        let engine = engine_on(store.clone());
        let a = engine
            .ingest("FICO 顾问 上海", fico_hints("上海", ""), None, "t")
            .await
            .unwrap();
        let b = engine
            .ingest("MM 顾问 北京", DemandHints {
                module_codes: vec!["MM".into()],
                city: "北京".into(),
                ..Default::default()
            }, None, "t")
            .await
            .unwrap();

        let err = engine
            .admin_link_raw(a.raw_id, &b.canonical_id, "nobody")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized));

        engine
            .admin_link_raw(a.raw_id, &b.canonical_id, "admin-1")
            .await
            .unwrap();
        let raw = engine.get_raw(a.raw_id).await.unwrap();
        assert_eq!(raw.unique_demand_id.as_deref(), Some(b.canonical_id.as_str()));
        assert_eq!(raw.override_by.as_deref(), Some("admin-1"));

        engine.admin_unlink_raw(a.raw_id, "admin-1").await.unwrap();
        let raw = engine.get_raw(a.raw_id).await.unwrap();
        assert_eq!(raw.unique_demand_id, None);

        engine
            .admin_set_canonical_raw(&b.canonical_id, a.raw_id, "admin-1")
            .await
            .unwrap();
        let demand = engine.get_demand(&b.canonical_id).await.unwrap();
        assert_eq!(demand.canonical_raw_id, Some(a.raw_id));
        assert_eq!(demand.canonical_raw_set_by.as_deref(), Some("admin-1"));
    }

    #[tokio::test]
    async fn admin_link_to_missing_canonical_is_not_found() {
        let store = MemoryStore::new();
        let engine = engine_on(store.clone());
        let a = engine
            .ingest("FICO 顾问", fico_hints("", ""), None, "t")
            .await
            .unwrap();
        let err = engine
            .admin_link_raw(a.raw_id, "no-such-demand", "admin-1")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn canonical_id_is_content_derived() {
        let raw_id = Uuid::new_v4();
        let a = canonical_demand_id("ficoconsultant上海", raw_id);
        let b = canonical_demand_id("ficoconsultant上海", raw_id);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, canonical_demand_id("ficoconsultant上海", Uuid::new_v4()));
    }
}
