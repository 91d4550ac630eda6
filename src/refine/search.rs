use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use log::{info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{QueryConfig, RefineConfig, RetryPolicy};
use crate::error::{RefineError, Result};
use crate::refine::model::{BibliographicRecord, Query, QueryType, SearchHit, UrlCandidate, UrlType};
use crate::refine::query::generate_queries;
use crate::refine::{extract_domain, normalize_url, with_retry, DOI_REGEX};

const MICROS_PER_DOLLAR: f64 = 1_000_000.0;

/// A web-search API, billed per call.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>>;
}

/// Google Programmable Search (Custom Search JSON API) backend.
pub struct GoogleSearchBackend {
    client: Client,
    base_url: String,
    api_key: String,
    cx: String,
}

impl GoogleSearchBackend {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, cx: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            cx: cx.into(),
        })
    }

    pub fn from_config(config: &RefineConfig) -> Result<Self> {
        Self::new(
            config.search_base_url.clone(),
            config.search_api_key.clone(),
            config.search_cx.clone(),
            config.request_timeout,
        )
    }
}

#[async_trait]
impl SearchBackend for GoogleSearchBackend {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let url = format!("{}/customsearch/v1", self.base_url);
        let num = limit.clamp(1, 10).to_string();
        let response = self
            .client
            .get(&url)
            .query(&[
                ("key", self.api_key.as_str()),
                ("cx", self.cx.as_str()),
                ("q", query),
                ("num", num.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!("Search API returned status {} for query: {}", status, query);
            return Err(RefineError::HttpStatus(status.as_u16()));
        }

        let json: Value = response.json().await?;
        let hits = json
            .get("items")
            .and_then(|items| items.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let link = item.get("link").and_then(|l| l.as_str())?;
                        Some(SearchHit {
                            url: link.to_string(),
                            title: item.get("title").and_then(|t| t.as_str()).unwrap_or("").to_string(),
                            snippet: item.get("snippet").and_then(|s| s.as_str()).unwrap_or("").to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(hits)
    }
}

#[derive(Debug)]
struct LedgerState {
    day: NaiveDate,
    used_today: u32,
    queries_executed: u64,
    oracle_calls: u64,
}

impl LedgerState {
    fn fresh() -> Self {
        Self {
            day: Utc::now().date_naive(),
            used_today: 0,
            queries_executed: 0,
            oracle_calls: 0,
        }
    }

    fn roll_day(&mut self) {
        let today = Utc::now().date_naive();
        if today != self.day {
            self.day = today;
            self.used_today = 0;
        }
    }
}

/// Running totals of billed API usage and the daily search quota.
///
/// Shared by every pipeline working on a batch; all updates go through one lock.
#[derive(Debug)]
pub struct CostLedger {
    query_price_micros: u64,
    oracle_price_micros: u64,
    daily_quota: u32,
    state: Mutex<LedgerState>,
}

/// Point-in-time view of a [`CostLedger`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostSnapshot {
    pub queries_executed: u64,
    pub oracle_calls: u64,
    pub search_cost: f64,
    pub oracle_cost: f64,
    pub total_cost: f64,
    /// Total cost in millionths of a dollar.
    pub total_micros: u64,
    pub remaining_quota: u32,
}

pub(crate) fn to_micros(dollars: f64) -> u64 {
    (dollars.max(0.0) * MICROS_PER_DOLLAR).round() as u64
}

pub(crate) fn to_dollars(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_DOLLAR
}

/// Formats an amount in dollars with three decimals.
pub fn format_cost(dollars: f64) -> String {
    format!("${:.3}", dollars)
}

impl CostLedger {
    pub fn new(query_unit_price: f64, oracle_unit_price: f64, daily_quota: u32) -> Self {
        Self {
            query_price_micros: to_micros(query_unit_price),
            oracle_price_micros: to_micros(oracle_unit_price),
            daily_quota,
            state: Mutex::new(LedgerState::fresh()),
        }
    }

    pub fn from_config(config: &RefineConfig) -> Self {
        Self::new(config.query_unit_price, config.oracle_unit_price, config.daily_query_quota)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserves quota for `count` queries, all or nothing.
    pub fn reserve(&self, count: u32) -> Result<()> {
        let mut state = self.lock();
        state.roll_day();
        let remaining = self.daily_quota.saturating_sub(state.used_today);
        if count > remaining {
            return Err(RefineError::QuotaExceeded {
                requested: count,
                remaining,
            });
        }
        state.used_today += count;
        Ok(())
    }

    /// Returns quota reserved for queries that were never billed.
    pub fn release(&self, count: u32) {
        let mut state = self.lock();
        state.used_today = state.used_today.saturating_sub(count);
    }

    pub fn record_query(&self) {
        self.lock().queries_executed += 1;
    }

    pub fn record_oracle_call(&self) {
        self.lock().oracle_calls += 1;
    }

    pub fn query_cost(&self, queries: u64) -> f64 {
        to_dollars(self.query_price_micros * queries)
    }

    pub fn remaining_quota(&self) -> u32 {
        let mut state = self.lock();
        state.roll_day();
        self.daily_quota.saturating_sub(state.used_today)
    }

    pub fn snapshot(&self) -> CostSnapshot {
        let mut state = self.lock();
        state.roll_day();
        let search = self.query_price_micros * state.queries_executed;
        let oracle = self.oracle_price_micros * state.oracle_calls;
        CostSnapshot {
            queries_executed: state.queries_executed,
            oracle_calls: state.oracle_calls,
            search_cost: to_dollars(search),
            oracle_cost: to_dollars(oracle),
            total_cost: to_dollars(search + oracle),
            total_micros: search + oracle,
            remaining_quota: self.daily_quota.saturating_sub(state.used_today),
        }
    }

    pub fn total_cost(&self) -> f64 {
        self.snapshot().total_cost
    }

    /// Clears all counters, including today's quota usage.
    pub fn reset(&self) {
        *self.lock() = LedgerState::fresh();
    }
}

/// A raw hit together with the query that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaggedHit {
    pub query: String,
    pub query_type: QueryType,
    pub position: usize,
    #[serde(flatten)]
    pub hit: SearchHit,
}

/// Everything searching for one reference produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub queries: Vec<Query>,
    pub queries_executed: u32,
    pub search_results: Vec<TaggedHit>,
    pub url_candidates: Vec<UrlCandidate>,
    pub cost: f64,
    pub errors: Vec<String>,
}

/// Classifies a URL by shape: PDF path, DOI host or path, web page, or anything else.
pub fn classify_url_type(url: &str) -> UrlType {
    let parsed = match url::Url::parse(url.trim()) {
        Ok(u) => u,
        Err(_) => return UrlType::Other,
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return UrlType::Other;
    }
    let path = parsed.path().to_lowercase();
    if path.ends_with(".pdf") {
        return UrlType::Pdf;
    }
    let host = parsed.host_str().unwrap_or("").to_lowercase();
    if host == "doi.org" || host.ends_with(".doi.org") || DOI_REGEX.is_match(parsed.path()) {
        return UrlType::Doi;
    }
    UrlType::Html
}

/// Deterministic prior from query type and result position.
pub fn initial_score(query_type: QueryType, position: usize) -> u8 {
    let base: i64 = match query_type {
        QueryType::Primary => 80,
        QueryType::Secondary => 60,
    };
    (base - 5 * position as i64).clamp(0, 100) as u8
}

/// Executes planned queries and turns hits into URL candidates.
pub struct SearchClient {
    backend: Arc<dyn SearchBackend>,
    ledger: Arc<CostLedger>,
    queries: QueryConfig,
    results_per_query: usize,
    retry: RetryPolicy,
}

impl SearchClient {
    pub fn new(
        backend: Arc<dyn SearchBackend>,
        ledger: Arc<CostLedger>,
        queries: QueryConfig,
        results_per_query: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            ledger,
            queries,
            results_per_query,
            retry,
        }
    }

    pub fn ledger(&self) -> &Arc<CostLedger> {
        &self.ledger
    }

    pub fn query_config(&self) -> &QueryConfig {
        &self.queries
    }

    /// Runs one query with retries and bills it once it succeeds.
    pub async fn search(&self, query: &Query) -> Result<Vec<SearchHit>> {
        let text = query.text.as_str();
        let limit = self.results_per_query;
        let hits = with_retry(&self.retry, "search query", || self.backend.search(text, limit)).await?;
        self.ledger.record_query();
        Ok(hits)
    }

    /// Plans, executes and merges all queries for one reference.
    ///
    /// Fails only for missing input or insufficient daily quota; individual
    /// query failures are collected in `errors`.
    pub async fn search_for_reference(&self, bib: &BibliographicRecord) -> Result<SearchResult> {
        let queries = generate_queries(bib, &self.queries)?;
        let planned = queries.len() as u32;
        self.ledger.reserve(planned)?;

        info!("Searching {} queries for reference {}", planned, bib.rid);

        let mut result = SearchResult {
            queries: queries.clone(),
            ..Default::default()
        };
        let mut seen: HashSet<String> = HashSet::new();

        for query in &queries {
            match self.search(query).await {
                Ok(hits) => {
                    result.queries_executed += 1;
                    for (position, hit) in hits.into_iter().enumerate() {
                        let key = normalize_url(&hit.url);
                        if key.is_empty() {
                            continue;
                        }
                        if seen.insert(key) {
                            let discovery_order = result.url_candidates.len();
                            result.url_candidates.push(UrlCandidate {
                                url: hit.url.trim().to_string(),
                                domain: extract_domain(&hit.url),
                                title: hit.title.clone(),
                                snippet: hit.snippet.clone(),
                                url_type: classify_url_type(&hit.url),
                                discovered_via_query: query.text.clone(),
                                initial_score: initial_score(query.query_type, position),
                                discovery_order,
                                is_aggregator: false,
                                validity: None,
                            });
                        }
                        result.search_results.push(TaggedHit {
                            query: query.text.clone(),
                            query_type: query.query_type,
                            position,
                            hit,
                        });
                    }
                }
                Err(e) => {
                    warn!("Query {:?} failed for reference {}: {}", query.text, bib.rid, e);
                    result.errors.push(format!("query {} ({:?}): {}", query.query_number, query.query_type, e));
                }
            }
        }

        self.ledger.release(planned - result.queries_executed);
        result.cost = self.ledger.query_cost(result.queries_executed as u64);

        info!(
            "Reference {}: {} candidates from {}/{} queries, cost {}",
            bib.rid,
            result.url_candidates.len(),
            result.queries_executed,
            planned,
            format_cost(result.cost)
        );
        Ok(result)
    }
}

/// Builds the HTTP-backed search client described by `config`.
pub fn search_client_from_config(config: &RefineConfig, ledger: Arc<CostLedger>) -> Result<SearchClient> {
    let backend = GoogleSearchBackend::from_config(config)?;
    Ok(SearchClient::new(
        Arc::new(backend),
        ledger,
        config.queries,
        config.results_per_query,
        config.retry.clone(),
    ))
}
