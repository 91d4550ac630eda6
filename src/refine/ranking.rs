use async_trait::async_trait;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{DomainRules, RefineConfig, RetryPolicy};
use crate::error::{RefineError, Result};
use crate::refine::model::{
    AccessBarrier, BibliographicRecord, RankedCandidate, RankedScore, UrlCandidate, UrlType, ValidationOutcome,
};
use crate::refine::search::CostLedger;
use crate::refine::{domain_matches, normalize_url, with_retry};

static JSON_ARRAY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\[.*\]").expect("Invalid JSON array regex pattern"));

const SYSTEM_PROMPT: &str = "You score web pages for an academic reference. For each URL give \
primary_score (0-100, how likely the page is the work itself) and secondary_score (0-100, how likely \
it is a scholarly review or discussion of the work). Return only a JSON array of \
{\"url\": ..., \"primary_score\": ..., \"secondary_score\": ...}.";

/// Oracle-assigned base scores for one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleScore {
    pub url: String,
    #[serde(alias = "primaryScore")]
    pub primary_score: f64,
    #[serde(alias = "secondaryScore")]
    pub secondary_score: f64,
}

/// External scorer for batches of candidates.
#[async_trait]
pub trait ScoringOracle: Send + Sync {
    async fn rank_batch(&self, bib: &BibliographicRecord, candidates: &[UrlCandidate]) -> Result<Vec<OracleScore>>;
}

/// OpenAI-compatible chat-completions oracle.
pub struct HttpScoringOracle {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpScoringOracle {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    pub fn from_config(config: &RefineConfig) -> Result<Self> {
        Self::new(
            config.oracle_base_url.clone(),
            config.oracle_api_key.clone(),
            config.oracle_model.clone(),
            config.request_timeout,
        )
    }

    fn prompt(bib: &BibliographicRecord, candidates: &[UrlCandidate]) -> String {
        let mut prompt = format!(
            "Reference:\n- Title: {}\n- Authors: {}\n- Year: {}\n- Publication: {}\n\nCandidates:\n",
            bib.title,
            bib.author,
            bib.year,
            if bib.publication.is_empty() { "Unknown" } else { bib.publication.as_str() }
        );
        for (i, c) in candidates.iter().enumerate() {
            prompt.push_str(&format!(
                "\n{}. {}\n   URL: {}\n   Snippet: {}\n",
                i + 1,
                c.title,
                c.url,
                c.snippet
            ));
        }
        prompt
    }
}

/// Pulls the score array out of a model reply that may carry extra prose.
pub fn parse_oracle_reply(text: &str) -> Result<Vec<OracleScore>> {
    let array = JSON_ARRAY_REGEX
        .find(text)
        .map(|m| m.as_str())
        .unwrap_or(text);
    serde_json::from_str(array).map_err(|e| RefineError::OracleFailure(format!("malformed scores: {}", e)))
}

#[async_trait]
impl ScoringOracle for HttpScoringOracle {
    async fn rank_batch(&self, bib: &BibliographicRecord, candidates: &[UrlCandidate]) -> Result<Vec<OracleScore>> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": Self::prompt(bib, candidates)}
            ],
            "temperature": 0.2,
            "max_tokens": 1000
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(RefineError::HttpStatus(status.as_u16()));
        }
        if !status.is_success() {
            return Err(RefineError::OracleFailure(format!("oracle returned HTTP {}", status)));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| RefineError::OracleFailure(format!("unreadable oracle response: {}", e)))?;
        let content = json
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| RefineError::OracleFailure("oracle response has no message content".to_string()))?;
        parse_oracle_reply(content)
    }
}

/// Scores for a candidate list plus the oracle failures absorbed while producing them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RankOutcome {
    pub scores: Vec<RankedScore>,
    pub errors: Vec<String>,
}

fn clamp_score(value: i32) -> u8 {
    value.clamp(0, 100) as u8
}

/// Scores candidates through the oracle and applies the deterministic adjustments around it.
pub struct CandidateRanker {
    oracle: Arc<dyn ScoringOracle>,
    rules: DomainRules,
    batch_size: usize,
    retry: RetryPolicy,
    ledger: Arc<CostLedger>,
}

impl CandidateRanker {
    pub fn new(
        oracle: Arc<dyn ScoringOracle>,
        rules: DomainRules,
        batch_size: usize,
        retry: RetryPolicy,
        ledger: Arc<CostLedger>,
    ) -> Self {
        Self {
            oracle,
            rules,
            batch_size: batch_size.max(1),
            retry,
            ledger,
        }
    }

    pub fn rules(&self) -> &DomainRules {
        &self.rules
    }

    pub fn is_aggregator(&self, domain: &str) -> bool {
        domain_matches(domain, &self.rules.aggregators)
    }

    fn is_trusted(&self, domain: &str) -> bool {
        if self.is_aggregator(domain) {
            return false;
        }
        domain_matches(domain, &self.rules.government)
            || domain_matches(domain, &self.rules.institutional)
            || domain_matches(domain, &self.rules.open_archives)
    }

    /// Tier adjustment applied to both axes.
    pub fn domain_adjustment(&self, domain: &str) -> i32 {
        let rules = &self.rules;
        if self.is_aggregator(domain) {
            0
        } else if domain_matches(domain, &rules.government) {
            rules.adjustments.government
        } else if domain_matches(domain, &rules.institutional) {
            rules.adjustments.institutional
        } else if domain_matches(domain, &rules.open_archives) {
            rules.adjustments.open_archive
        } else if domain_matches(domain, &rules.listing) {
            rules.adjustments.listing
        } else {
            0
        }
    }

    /// PRIMARY and SECONDARY accessibility adjustments.
    fn accessibility_adjustment(&self, candidate: &UrlCandidate) -> (i32, i32) {
        let bonuses = &self.rules.accessibility;
        let access = candidate
            .validity
            .as_ref()
            .map(|v| v.access)
            .unwrap_or(AccessBarrier::Unknown);

        let mut primary = 0;
        let mut secondary = 0;
        if candidate.url_type == UrlType::Pdf && self.is_trusted(&candidate.domain) {
            primary += bonuses.trusted_pdf_primary;
        }
        if matches!(
            access,
            AccessBarrier::Paywall | AccessBarrier::LoginRequired | AccessBarrier::PreviewOnly
        ) {
            primary += bonuses.barrier_primary_penalty;
        }
        if access == AccessBarrier::Open && !domain_matches(&candidate.domain, &self.rules.paywalled) {
            secondary += bonuses.free_access_secondary;
        }
        (primary, secondary)
    }

    fn validity_penalty(&self, candidate: &UrlCandidate) -> i32 {
        match candidate.validity.as_ref().map(|v| v.outcome) {
            Some(ValidationOutcome::SoftContentTypeMismatch) => self.rules.validity.content_type_mismatch,
            Some(ValidationOutcome::SoftContentAnomalous) => self.rules.validity.content_anomalous,
            _ => 0,
        }
    }

    fn is_dead(candidate: &UrlCandidate) -> bool {
        matches!(
            candidate.validity.as_ref().map(|v| v.outcome),
            Some(ValidationOutcome::Hard404)
        )
    }

    /// PRIMARY ceiling for aggregators given the candidate set.
    ///
    /// The lower ceiling applies whenever some live non-aggregator candidate
    /// offers a downloadable artifact.
    pub fn aggregator_ceiling(&self, candidates: &[UrlCandidate]) -> u8 {
        let has_alternative = candidates
            .iter()
            .any(|c| !self.is_aggregator(&c.domain) && c.url_type == UrlType::Pdf && !Self::is_dead(c));
        if has_alternative {
            self.rules.ceilings.primary
        } else {
            self.rules.ceilings.no_alternative
        }
    }

    /// Flags aggregator candidates and returns the PRIMARY ceiling that applies to them.
    pub fn penalize_aggregators(&self, candidates: &mut [UrlCandidate]) -> u8 {
        for candidate in candidates.iter_mut() {
            candidate.is_aggregator = self.is_aggregator(&candidate.domain);
        }
        let ceiling = self.aggregator_ceiling(candidates);
        let flagged = candidates.iter().filter(|c| c.is_aggregator).count();
        if flagged > 0 {
            debug!("{} aggregator candidates capped at PRIMARY {}", flagged, ceiling);
        }
        ceiling
    }

    /// Final scores for one candidate given its oracle base scores.
    pub fn adjust(&self, candidate: &UrlCandidate, base: &OracleScore, ceiling: u8) -> RankedScore {
        let domain = self.domain_adjustment(&candidate.domain);
        let (access_primary, access_secondary) = self.accessibility_adjustment(candidate);
        let validity = self.validity_penalty(candidate);

        let base_primary = base.primary_score.round().clamp(0.0, 100.0) as i32;
        let base_secondary = base.secondary_score.round().clamp(0.0, 100.0) as i32;

        let mut primary = clamp_score(base_primary + domain + access_primary + validity);
        let secondary = clamp_score(base_secondary + domain + access_secondary + validity);
        let is_aggregator = self.is_aggregator(&candidate.domain);
        if is_aggregator {
            primary = primary.min(ceiling);
        }

        RankedScore {
            url: candidate.url.clone(),
            primary_score: primary,
            secondary_score: secondary,
            is_aggregator,
            scored: true,
        }
    }

    fn unscored(&self, candidate: &UrlCandidate) -> RankedScore {
        RankedScore {
            url: candidate.url.clone(),
            primary_score: 0,
            secondary_score: 0,
            is_aggregator: self.is_aggregator(&candidate.domain),
            scored: false,
        }
    }

    async fn score_batch(
        &self,
        bib: &BibliographicRecord,
        batch: &[UrlCandidate],
    ) -> Result<HashMap<String, OracleScore>> {
        let scores = with_retry(&self.retry, "oracle batch", || self.oracle.rank_batch(bib, batch)).await?;
        self.ledger.record_oracle_call();
        Ok(scores
            .into_iter()
            .map(|s| (normalize_url(&s.url), s))
            .collect())
    }

    /// Ranks candidates, returning one score per candidate in input order.
    ///
    /// Dead links are never sent to the oracle and score zero. A batch the
    /// oracle fails on leaves its candidates unscored and adds one entry to
    /// `errors`; other batches still run.
    pub async fn rank(&self, candidates: &[UrlCandidate], bib: &BibliographicRecord) -> RankOutcome {
        let ceiling = self.aggregator_ceiling(candidates);
        let live: Vec<UrlCandidate> = candidates.iter().filter(|c| !Self::is_dead(c)).cloned().collect();

        let mut base_scores: HashMap<String, OracleScore> = HashMap::new();
        let mut errors = Vec::new();
        for (i, batch) in live.chunks(self.batch_size).enumerate() {
            match self.score_batch(bib, batch).await {
                Ok(scores) => base_scores.extend(scores),
                Err(e) => {
                    warn!(
                        "Oracle failed on batch {} of reference {} ({} candidates left unscored): {}",
                        i + 1,
                        bib.rid,
                        batch.len(),
                        e
                    );
                    errors.push(format!("oracle batch {} ({} candidates): {}", i + 1, batch.len(), e));
                }
            }
        }

        let scores: Vec<RankedScore> = candidates
            .iter()
            .map(|c| {
                if Self::is_dead(c) {
                    return self.unscored(c);
                }
                match base_scores.get(&normalize_url(&c.url)) {
                    Some(base) => self.adjust(c, base, ceiling),
                    None => self.unscored(c),
                }
            })
            .collect();

        info!(
            "Ranked {} candidates for reference {} ({} scored)",
            scores.len(),
            bib.rid,
            scores.iter().filter(|r| r.scored).count()
        );
        RankOutcome { scores, errors }
    }

    /// Ranks candidates and pairs each with its score. Also returns the absorbed oracle failures.
    pub async fn rank_candidates(
        &self,
        candidates: &mut [UrlCandidate],
        bib: &BibliographicRecord,
    ) -> (Vec<RankedCandidate>, Vec<String>) {
        self.penalize_aggregators(candidates);
        let outcome = self.rank(candidates, bib).await;
        let ranked = candidates
            .iter()
            .cloned()
            .zip(outcome.scores)
            .map(|(candidate, score)| RankedCandidate { candidate, score })
            .collect();
        (ranked, outcome.errors)
    }
}
