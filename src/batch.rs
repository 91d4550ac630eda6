//! Per-reference pipeline and resumable batch processing.

use chrono::{DateTime, Utc};
use futures::future;
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::RefineConfig;
use crate::error::{RefineError, Result};
use crate::refine::model::{BibliographicRecord, Decision, Query, RankedCandidate, RankedScore, Rid, UrlCandidate};
use crate::refine::query::generate_queries;
use crate::refine::ranking::{CandidateRanker, HttpScoringOracle};
use crate::refine::search::{
    format_cost, search_client_from_config, to_dollars, to_micros, CostLedger, SearchClient, SearchResult,
};
use crate::refine::selection::{commit_decision, Selector};
use crate::refine::validation::UrlValidator;
use crate::store::{write_atomic, ReferenceStore};

/// Resumable record of a batch run. Missing keys load as their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchProgress {
    pub processed_rids: BTreeSet<Rid>,
    pub failed_rids: BTreeMap<Rid, String>,
    pub cumulative_cost: f64,
    pub started_at: DateTime<Utc>,
    pub checkpointed_at: Option<DateTime<Utc>>,
}

impl Default for BatchProgress {
    fn default() -> Self {
        Self {
            processed_rids: BTreeSet::new(),
            failed_rids: BTreeMap::new(),
            cumulative_cost: 0.0,
            started_at: Utc::now(),
            checkpointed_at: None,
        }
    }
}

/// Owns a [`BatchProgress`] and its file.
#[derive(Debug)]
pub struct ProgressTracker {
    path: PathBuf,
    progress: BatchProgress,
}

impl ProgressTracker {
    /// Loads progress from `path`, starting fresh when the file is absent or empty.
    pub fn load(path: &Path) -> Result<Self> {
        let progress = if path.exists() {
            let contents = fs::read_to_string(path)?;
            if contents.trim().is_empty() {
                BatchProgress::default()
            } else {
                serde_json::from_str(&contents)?
            }
        } else {
            BatchProgress::default()
        };
        if !progress.processed_rids.is_empty() || !progress.failed_rids.is_empty() {
            info!(
                "Resuming batch from {:?}: {} processed, {} failed",
                path,
                progress.processed_rids.len(),
                progress.failed_rids.len()
            );
        }
        Ok(Self {
            path: path.to_path_buf(),
            progress,
        })
    }

    pub fn progress(&self) -> &BatchProgress {
        &self.progress
    }

    pub fn is_processed(&self, rid: Rid) -> bool {
        self.progress.processed_rids.contains(&rid)
    }

    pub fn mark_processed(&mut self, rid: Rid) {
        self.progress.failed_rids.remove(&rid);
        self.progress.processed_rids.insert(rid);
    }

    pub fn mark_failed(&mut self, rid: Rid, reason: impl Into<String>) {
        self.progress.failed_rids.insert(rid, reason.into());
    }

    pub fn set_cumulative_cost(&mut self, cost: f64) {
        self.progress.cumulative_cost = cost;
    }

    /// Rewrites the progress file atomically.
    pub fn checkpoint(&mut self) -> Result<()> {
        self.progress.checkpointed_at = Some(Utc::now());
        write_atomic(&self.path, &serde_json::to_string_pretty(&self.progress)?)
    }
}

/// Cooperative stop signal, checked between references.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Ranked candidates of one reference and the URLs selected from them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RankingResult {
    pub rid: Rid,
    pub scores: Vec<RankedScore>,
    pub ranked: Vec<RankedCandidate>,
    pub primary: Option<UrlCandidate>,
    pub secondary: Option<UrlCandidate>,
    /// Validation transport failures and oracle batch failures absorbed while ranking.
    pub errors: Vec<String>,
}

/// What processing one reference produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceOutcome {
    pub rid: Rid,
    pub decision: Option<Decision>,
    pub queries_executed: u32,
    pub candidates: usize,
    pub errors: Vec<String>,
    /// True when an operator-finalized decision already existed and was kept.
    pub skipped: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failed_ids: Vec<Rid>,
    pub failures: BTreeMap<Rid, String>,
    /// Cost of this run.
    pub cost: f64,
    pub cumulative_cost: f64,
    pub avg_cost_per_reference: f64,
    pub queries_executed: u64,
    pub oracle_calls: u64,
    pub cancelled: bool,
}

impl BatchSummary {
    pub fn report(&self) -> String {
        let mut out = format!(
            "Processed: {}\nSkipped (finalized): {}\nFailed: {}\nQueries executed: {}\nOracle calls: {}\nCost: {}\nAverage cost per reference: {}\nCumulative cost: {}\n",
            self.processed,
            self.skipped,
            self.failed,
            self.queries_executed,
            self.oracle_calls,
            format_cost(self.cost),
            format_cost(self.avg_cost_per_reference),
            format_cost(self.cumulative_cost),
        );
        for (rid, reason) in &self.failures {
            out.push_str(&format!("  rid {}: {}\n", rid, reason));
        }
        if self.cancelled {
            out.push_str("Batch was cancelled; rerun to resume.\n");
        }
        out
    }
}

/// Query generation, search, validation, ranking and selection for references.
pub struct BatchPipeline {
    search: SearchClient,
    validator: UrlValidator,
    ranker: CandidateRanker,
    selector: Selector,
    store: Arc<dyn ReferenceStore>,
    ledger: Arc<CostLedger>,
    batch_version: String,
    concurrency: usize,
    cancel: CancelHandle,
}

impl BatchPipeline {
    pub fn new(
        search: SearchClient,
        validator: UrlValidator,
        ranker: CandidateRanker,
        selector: Selector,
        store: Arc<dyn ReferenceStore>,
        batch_version: impl Into<String>,
    ) -> Self {
        let ledger = search.ledger().clone();
        Self {
            search,
            validator,
            ranker,
            selector,
            store,
            ledger,
            batch_version: batch_version.into(),
            concurrency: 1,
            cancel: CancelHandle::default(),
        }
    }

    /// Wires HTTP-backed collaborators from `config`.
    pub fn from_config(config: &RefineConfig, store: Arc<dyn ReferenceStore>) -> Result<Self> {
        let ledger = Arc::new(CostLedger::from_config(config));
        let search = search_client_from_config(config, ledger.clone())?;
        let validator = UrlValidator::from_config(config)?;
        let oracle = HttpScoringOracle::from_config(config)?;
        let ranker = CandidateRanker::new(
            Arc::new(oracle),
            config.rules.clone(),
            config.oracle_batch_size,
            config.retry.clone(),
            ledger,
        );
        let selector = Selector::new(config.rules.thresholds);
        Ok(Self::new(search, validator, ranker, selector, store, config.batch_version.clone())
            .with_concurrency(config.batch_concurrency))
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn ledger(&self) -> &Arc<CostLedger> {
        &self.ledger
    }

    pub fn plan_queries(&self, bib: &BibliographicRecord) -> Result<Vec<Query>> {
        generate_queries(bib, self.search.query_config())
    }

    pub async fn search_for_reference(&self, bib: &BibliographicRecord) -> Result<SearchResult> {
        self.search.search_for_reference(bib).await
    }

    /// Validates candidates lacking a verdict, ranks them and selects PRIMARY and SECONDARY.
    pub async fn rank_candidates(
        &self,
        rid: Rid,
        bib: &BibliographicRecord,
        mut candidates: Vec<UrlCandidate>,
    ) -> RankingResult {
        let mut errors = Vec::new();
        let mut unvalidated: Vec<UrlCandidate> = candidates.iter().filter(|c| c.validity.is_none()).cloned().collect();
        if !unvalidated.is_empty() {
            errors.extend(self.validator.validate_all(&mut unvalidated).await);
            let mut verdicts = unvalidated.into_iter();
            for candidate in candidates.iter_mut().filter(|c| c.validity.is_none()) {
                if let Some(done) = verdicts.next() {
                    candidate.validity = done.validity;
                }
            }
        }

        let (ranked, oracle_errors) = self.ranker.rank_candidates(&mut candidates, bib).await;
        errors.extend(oracle_errors);
        let selection = self.selector.select(&ranked);
        RankingResult {
            rid,
            scores: ranked.iter().map(|r| r.score.clone()).collect(),
            primary: selection.primary.map(|p| p.candidate),
            secondary: selection.secondary.map(|s| s.candidate),
            ranked,
            errors,
        }
    }

    /// Runs the full pipeline for one reference and commits its decision.
    ///
    /// An operator-finalized decision already in the store is left untouched.
    /// When every query fails the reference fails and nothing is committed.
    pub async fn process_reference(&self, bib: &BibliographicRecord) -> Result<ReferenceOutcome> {
        if let Some(existing) = self.store.get_decision(bib.rid).await? {
            if existing.finalized {
                info!("Reference {} already finalized, keeping operator decision", bib.rid);
                return Ok(ReferenceOutcome {
                    rid: bib.rid,
                    decision: Some(existing),
                    queries_executed: 0,
                    candidates: 0,
                    errors: Vec::new(),
                    skipped: true,
                });
            }
        }

        let search = self.search_for_reference(bib).await?;
        if search.queries_executed == 0 {
            if let Some(last_error) = search.errors.last() {
                return Err(RefineError::SearchExhausted {
                    rid: bib.rid,
                    last_error: last_error.clone(),
                });
            }
        }
        let candidate_count = search.url_candidates.len();
        let ranking = self.rank_candidates(bib.rid, bib, search.url_candidates).await;
        let mut errors = search.errors;
        errors.extend(ranking.errors.iter().cloned());

        let decision = Decision {
            primary_url: ranking.primary.as_ref().map(|c| c.url.clone()),
            secondary_url: ranking.secondary.as_ref().map(|c| c.url.clone()),
            ..Decision::for_record(bib, &self.batch_version)
        };
        commit_decision(self.store.as_ref(), &decision).await?;

        Ok(ReferenceOutcome {
            rid: bib.rid,
            decision: Some(decision),
            queries_executed: search.queries_executed,
            candidates: candidate_count,
            errors,
            skipped: false,
        })
    }

    /// Processes `references` in order, checkpointing to `progress_path` after each.
    ///
    /// Rids already recorded as processed are skipped; previously failed rids
    /// are retried. A failing reference is recorded with its reason and never
    /// stops the batch.
    pub async fn process_batch(&self, references: &[BibliographicRecord], progress_path: &Path) -> Result<BatchSummary> {
        let mut tracker = ProgressTracker::load(progress_path)?;
        let base_micros = to_micros(tracker.progress().cumulative_cost);
        let start = self.ledger.snapshot();

        let pending: Vec<&BibliographicRecord> = references.iter().filter(|b| !tracker.is_processed(b.rid)).collect();
        info!(
            "Batch of {} references: {} pending, {} already processed",
            references.len(),
            pending.len(),
            references.len() - pending.len()
        );

        let cancel = self.cancel.clone();
        let mut results = stream::iter(pending)
            .take_while(move |_| future::ready(!cancel.is_cancelled()))
            .map(|bib| async move { (bib.rid, self.process_reference(bib).await) })
            .buffer_unordered(self.concurrency);

        let mut summary = BatchSummary::default();
        while let Some((rid, outcome)) = results.next().await {
            match outcome {
                Ok(outcome) => {
                    if outcome.skipped {
                        summary.skipped += 1;
                    } else {
                        summary.processed += 1;
                        for error in &outcome.errors {
                            debug!("Reference {}: {}", rid, error);
                        }
                    }
                    tracker.mark_processed(rid);
                }
                Err(e) => {
                    warn!("Reference {} failed: {}", rid, e);
                    tracker.mark_failed(rid, e.to_string());
                }
            }
            let spent = self.ledger.snapshot().total_micros - start.total_micros;
            tracker.set_cumulative_cost(to_dollars(base_micros + spent));
            tracker.checkpoint()?;
        }

        let end = self.ledger.snapshot();
        summary.cancelled = self.cancel.is_cancelled();
        summary.cost = to_dollars(end.total_micros - start.total_micros);
        summary.queries_executed = end.queries_executed - start.queries_executed;
        summary.oracle_calls = end.oracle_calls - start.oracle_calls;
        summary.avg_cost_per_reference = if summary.processed > 0 {
            summary.cost / summary.processed as f64
        } else {
            0.0
        };
        summary.cumulative_cost = tracker.progress().cumulative_cost;
        let pending_failures: BTreeMap<Rid, String> = references
            .iter()
            .filter_map(|b| tracker.progress().failed_rids.get(&b.rid).map(|r| (b.rid, r.clone())))
            .collect();
        summary.failed = pending_failures.len();
        summary.failed_ids = pending_failures.keys().copied().collect();
        summary.failures = pending_failures;

        info!(
            "Batch done: {} processed, {} failed, cost {}",
            summary.processed,
            summary.failed,
            format_cost(summary.cost)
        );
        Ok(summary)
    }

    /// Processes every reference the store holds, in rid order.
    pub async fn process_store_batch(&self, progress_path: &Path) -> Result<BatchSummary> {
        let mut references = Vec::new();
        let mut cursor = None;
        while let Some(rid) = self.store.next_reference_id(cursor).await? {
            references.push(self.store.get_reference(rid).await?);
            cursor = Some(rid);
        }
        self.process_batch(&references, progress_path).await
    }
}
