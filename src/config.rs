use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{RefineError, Result};

const DEFAULT_SEARCH_BASE_URL: &str = "https://www.googleapis.com";
const DEFAULT_ORACLE_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_ORACLE_MODEL: &str = "gpt-4o-mini";

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// How many queries of each kind to plan per reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryConfig {
    pub primary_query_count: usize,
    pub secondary_query_count: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            primary_query_count: 4,
            secondary_query_count: 4,
        }
    }
}

/// Retry settings shared by every network call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            max_elapsed: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits long; used by tests and dry runs.
    pub fn fast(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            max_elapsed: Duration::from_secs(2),
        }
    }
}

/// Host-pattern lists and adjustment values used by the ranker.
///
/// Patterns match when the candidate's host equals the pattern, ends with it
/// (`.gov`, `.edu`) or contains it (`hathitrust`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainRules {
    pub version: String,
    pub aggregators: Vec<String>,
    pub government: Vec<String>,
    pub institutional: Vec<String>,
    pub open_archives: Vec<String>,
    pub listing: Vec<String>,
    pub paywalled: Vec<String>,
    pub adjustments: DomainAdjustments,
    pub accessibility: AccessibilityBonuses,
    pub validity: ValidityPenalties,
    pub ceilings: AggregatorCeilings,
    pub thresholds: SelectionThresholds,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainAdjustments {
    pub government: i32,
    pub institutional: i32,
    pub open_archive: i32,
    pub listing: i32,
}

impl Default for DomainAdjustments {
    fn default() -> Self {
        Self {
            government: 15,
            institutional: 15,
            open_archive: 8,
            listing: -15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessibilityBonuses {
    pub trusted_pdf_primary: i32,
    pub free_access_secondary: i32,
    pub barrier_primary_penalty: i32,
}

impl Default for AccessibilityBonuses {
    fn default() -> Self {
        Self {
            trusted_pdf_primary: 5,
            free_access_secondary: 5,
            barrier_primary_penalty: -10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidityPenalties {
    pub content_type_mismatch: i32,
    pub content_anomalous: i32,
}

impl Default for ValidityPenalties {
    fn default() -> Self {
        Self {
            content_type_mismatch: -20,
            content_anomalous: -30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorCeilings {
    /// Cap on an aggregator's PRIMARY score.
    pub primary: u8,
    /// Cap used when no non-aggregator candidate offers a downloadable artifact.
    pub no_alternative: u8,
}

impl Default for AggregatorCeilings {
    fn default() -> Self {
        Self {
            primary: 40,
            no_alternative: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionThresholds {
    /// Minimum PRIMARY score for the PRIMARY role; candidates at or above it
    /// are treated as the work itself and never serve as SECONDARY.
    pub primary_accept: u8,
    /// Minimum SECONDARY score for the SECONDARY role.
    pub secondary_accept: u8,
}

impl Default for SelectionThresholds {
    fn default() -> Self {
        Self {
            primary_accept: 70,
            secondary_accept: 30,
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for DomainRules {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            aggregators: strings(&[
                "scholar.google.com",
                "researchgate.net",
                "academia.edu",
                "semanticscholar.org",
                "worldcat.org",
                "goodreads.com",
                "openlibrary.org",
                "librarything.com",
                "orcid.org",
                "dblp.org",
                "citeseerx.ist.psu.edu",
                "philpapers.org",
                "books.google.com",
            ]),
            government: strings(&[".gov", ".mil", ".gov.uk", ".gc.ca", ".europa.eu"]),
            institutional: strings(&[
                ".edu",
                ".ac.uk",
                "repository",
                "eprints",
                "dspace",
                "handle.net",
                "escholarship.org",
            ]),
            open_archives: strings(&[
                "archive.org",
                "arxiv.org",
                "hathitrust.org",
                "ncbi.nlm.nih.gov",
                "europepmc.org",
                "ssrn.com",
                "doaj.org",
                "zenodo.org",
                "doi.org",
            ]),
            listing: strings(&[
                "wikipedia.org",
                "britannica.com",
                "amazon.",
                "barnesandnoble.com",
                "reddit.com",
                "quora.com",
            ]),
            paywalled: strings(&[
                "sciencedirect.com",
                "springer.com",
                "wiley.com",
                "tandfonline.com",
                "sagepub.com",
                "jstor.org",
            ]),
            adjustments: DomainAdjustments::default(),
            accessibility: AccessibilityBonuses::default(),
            validity: ValidityPenalties::default(),
            ceilings: AggregatorCeilings::default(),
            thresholds: SelectionThresholds::default(),
        }
    }
}

impl DomainRules {
    /// Loads rules from a JSON file. Keys absent from the file keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        if contents.trim().is_empty() {
            debug!("Domain rules file {:?} is empty, using defaults", path);
            return Ok(Self::default());
        }
        let rules: DomainRules = serde_json::from_str(&contents)
            .map_err(|e| RefineError::Config(format!("invalid domain rules {:?}: {}", path, e)))?;
        info!("Loaded domain rules version {} from {:?}", rules.version, path);
        Ok(rules)
    }
}

/// Connection and tuning settings for the whole engine.
#[derive(Debug, Clone)]
pub struct RefineConfig {
    pub search_base_url: String,
    pub search_api_key: String,
    pub search_cx: String,
    pub oracle_base_url: String,
    pub oracle_api_key: String,
    pub oracle_model: String,
    pub queries: QueryConfig,
    pub results_per_query: usize,
    pub query_unit_price: f64,
    pub oracle_unit_price: f64,
    pub daily_query_quota: u32,
    pub oracle_batch_size: usize,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    pub validation_timeout: Duration,
    pub validation_body_timeout: Duration,
    pub validation_max_bytes: usize,
    pub validation_concurrency: usize,
    pub batch_concurrency: usize,
    pub batch_version: String,
    pub rules: DomainRules,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            search_base_url: DEFAULT_SEARCH_BASE_URL.to_string(),
            search_api_key: String::new(),
            search_cx: String::new(),
            oracle_base_url: DEFAULT_ORACLE_BASE_URL.to_string(),
            oracle_api_key: String::new(),
            oracle_model: DEFAULT_ORACLE_MODEL.to_string(),
            queries: QueryConfig::default(),
            results_per_query: 10,
            query_unit_price: 0.005,
            oracle_unit_price: 0.0,
            daily_query_quota: 100,
            oracle_batch_size: 10,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(15),
            validation_timeout: Duration::from_secs(10),
            validation_body_timeout: Duration::from_secs(10),
            validation_max_bytes: 100_000,
            validation_concurrency: 4,
            batch_concurrency: 1,
            batch_version: env!("CARGO_PKG_VERSION").to_string(),
            rules: DomainRules::default(),
        }
    }
}

impl RefineConfig {
    /// Builds the configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let max_timeout = env_or("API_TIMEOUT_SECS", 30u64);
        let retry = RetryPolicy {
            max_attempts: env_or("MAX_RETRIES", defaults.retry.max_attempts).max(1),
            max_elapsed: Duration::from_secs(max_timeout),
            ..defaults.retry.clone()
        };

        let rules = match std::env::var("DOMAIN_RULES_PATH") {
            Ok(path) if !path.trim().is_empty() => DomainRules::load(Path::new(path.trim()))?,
            _ => DomainRules::default(),
        };

        let validation_secs = env_or("VALIDATION_TIMEOUT_SECS", 10u64);

        Ok(Self {
            search_base_url: std::env::var("SEARCH_BASE_URL").unwrap_or(defaults.search_base_url),
            search_api_key: std::env::var("GOOGLE_CSE_API_KEY").unwrap_or_default(),
            search_cx: std::env::var("GOOGLE_CSE_CX").unwrap_or_default(),
            oracle_base_url: std::env::var("ORACLE_BASE_URL").unwrap_or(defaults.oracle_base_url),
            oracle_api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
            oracle_model: std::env::var("ORACLE_MODEL").unwrap_or(defaults.oracle_model),
            queries: QueryConfig {
                primary_query_count: env_or("PRIMARY_QUERY_COUNT", defaults.queries.primary_query_count),
                secondary_query_count: env_or("SECONDARY_QUERY_COUNT", defaults.queries.secondary_query_count),
            },
            results_per_query: env_or("RESULTS_PER_QUERY", defaults.results_per_query).clamp(1, 10),
            query_unit_price: env_or("QUERY_UNIT_PRICE", defaults.query_unit_price),
            oracle_unit_price: env_or("ORACLE_UNIT_PRICE", defaults.oracle_unit_price),
            daily_query_quota: env_or("DAILY_QUERY_QUOTA", defaults.daily_query_quota),
            oracle_batch_size: env_or("ORACLE_BATCH_SIZE", defaults.oracle_batch_size).max(1),
            retry,
            request_timeout: Duration::from_secs(env_or("REQUEST_TIMEOUT_SECS", 15u64)),
            validation_timeout: Duration::from_secs(validation_secs),
            validation_body_timeout: Duration::from_secs(validation_secs),
            validation_max_bytes: env_or("VALIDATION_MAX_BYTES", defaults.validation_max_bytes),
            validation_concurrency: env_or("VALIDATION_CONCURRENCY", defaults.validation_concurrency).max(1),
            batch_concurrency: env_or("BATCH_CONCURRENCY", defaults.batch_concurrency).max(1),
            batch_version: std::env::var("BATCH_VERSION").unwrap_or(defaults.batch_version),
            rules,
        })
    }
}
