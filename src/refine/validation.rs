use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{redirect::Policy, Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{RefineConfig, RetryPolicy};
use crate::error::{RefineError, Result};
use crate::refine::model::{AccessBarrier, UrlCandidate, UrlType, ValidationOutcome, ValidationVerdict};
use crate::refine::with_retry;

const MAX_REDIRECTS: usize = 5;
const USER_AGENT: &str = concat!("refrefine/", env!("CARGO_PKG_VERSION"));

const MISMATCH_CONFIDENCE: f64 = 0.65;
const ANOMALY_CONFIDENCE: f64 = 0.4;

fn compile(patterns: &[(&str, &'static str)]) -> Vec<(Regex, &'static str)> {
    patterns
        .iter()
        .map(|(p, name)| (Regex::new(&format!("(?i){}", p)).expect("Invalid validation regex pattern"), *name))
        .collect()
}

static SOFT_404_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    compile(&[
        (r"404.*not\s*found|not\s*found.*404", "404 not found"),
        (r"page\s*not\s*found|cannot\s*find.*page", "page not found"),
        (r"sorry.*couldn't\s*find|we\s*couldn't\s*locate", "apology for not found"),
        (r"oops.*nothing\s*here|there's\s*nothing\s*here", "nothing here"),
        (r"doi\s*not\s*found|doi.*not\s*available", "DOI not found"),
        (r"document\s*not\s*found|article\s*not\s*available", "document unavailable"),
        (r"item\s*not\s*found|handle\s*not\s*found", "item or handle not found"),
        (r"access\s*denied|has\s*been\s*removed|no\s*longer\s*available", "removed or denied"),
        (r"<title>[^<]*(404|not\s*found|error)[^<]*</title>", "error in title"),
    ])
});

static PAYWALL_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    compile(&[
        (r"subscribe.*continue|subscription.*required", "subscription required"),
        (r"\$\d+(\.\d{2})?\s*(to\s*)?(access|view|read|download)", "price to access"),
        (r"purchase.*access|buy.*article|pay.*view", "purchase required"),
        (r"paywall|payment.*required", "paywall detected"),
        (r"member(s)?\s*only|members?\s*exclusive", "members only"),
        (r"become\s*a\s*(member|subscriber)", "subscription prompt"),
        (r"upgrade\s*to\s*(premium|pro|plus)", "upgrade required"),
        (r"full\s*text.*\$|complete\s*article.*\$", "paid full text"),
    ])
});

static LOGIN_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    compile(&[
        (r"sign\s*in.*continue|log\s*in.*continue", "login to continue"),
        (r"authentication.*required|login.*required", "authentication required"),
        (r"institutional.*access|institution.*login", "institutional access"),
        (r"access.*through.*library", "library access"),
        (r"credentials.*required|authorized.*users?\s*only", "credentials required"),
        (r"please\s*(log\s*in|sign\s*in)", "login prompt"),
        (r"restricted.*access|access.*restricted", "restricted access"),
    ])
});

static PREVIEW_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    compile(&[
        (r"limited\s*preview|preview\s*only", "limited preview"),
        (r"first\s*\d+\s*pages?|sample\s*pages?", "sample pages"),
        (r"table\s*of\s*contents\s*only", "contents only"),
        (r"abstract\s*only|summary\s*only", "abstract only"),
        (r"partial\s*view|incomplete\s*view", "partial view"),
        (r"preview\s*unavailable|full\s*view\s*not\s*available", "no full view"),
    ])
});

fn first_match(body: &str, patterns: &[(Regex, &'static str)]) -> Option<&'static str> {
    patterns.iter().find(|(re, _)| re.is_match(body)).map(|(_, name)| *name)
}

/// What a fetch returned: status, declared content type and a bounded body prefix.
///
/// `body` carries why the prefix was not read when it is missing.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: std::result::Result<String, String>,
}

/// HTTP fetch capability used by the validator.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, max_bytes: usize) -> Result<FetchResponse>;
}

/// `reqwest`-backed fetcher with separate timeouts for the response head and the body read.
pub struct HttpFetcher {
    client: Client,
    head_timeout: Duration,
    body_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(head_timeout: Duration, body_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .redirect(Policy::limited(MAX_REDIRECTS))
            .user_agent(USER_AGENT)
            .connect_timeout(head_timeout)
            .build()?;
        Ok(Self {
            client,
            head_timeout,
            body_timeout,
        })
    }

    pub fn from_config(config: &RefineConfig) -> Result<Self> {
        Self::new(config.validation_timeout, config.validation_body_timeout)
    }
}

async fn read_prefix(mut response: reqwest::Response, max_bytes: usize) -> Result<String> {
    let mut bytes: Vec<u8> = Vec::new();
    while bytes.len() < max_bytes {
        match response.chunk().await? {
            Some(chunk) => bytes.extend_from_slice(&chunk),
            None => break,
        }
    }
    bytes.truncate(max_bytes);
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, max_bytes: usize) -> Result<FetchResponse> {
        let response = tokio::time::timeout(self.head_timeout, self.client.get(url).send())
            .await
            .map_err(|_| RefineError::Timeout)??;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_lowercase());

        // Error pages are never inspected, so skip reading them.
        if status >= 400 {
            return Ok(FetchResponse {
                status,
                content_type,
                body: Err(format!("not read for HTTP {}", status)),
            });
        }

        let body = match tokio::time::timeout(self.body_timeout, read_prefix(response, max_bytes)).await {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) => {
                debug!("Body read failed for {}: {}", url, e);
                Err(format!("read failed: {}", e))
            }
            Err(_) => {
                debug!("Body read timed out for {}", url);
                Err(format!("timed out after {:?}", self.body_timeout))
            }
        };

        Ok(FetchResponse {
            status,
            content_type,
            body,
        })
    }
}

/// Result of one validation level: a terminal verdict or a pass to the next level.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    Verdict(ValidationVerdict),
    Proceed,
}

pub type CheckFn = fn(&UrlCandidate, &Result<FetchResponse>) -> CheckOutcome;

/// One level of validation.
#[derive(Clone, Copy)]
pub struct Check {
    pub level: u8,
    pub name: &'static str,
    pub run: CheckFn,
}

/// Level 1: the URL must answer with a status below 400.
fn hard_404_check(_candidate: &UrlCandidate, fetched: &Result<FetchResponse>) -> CheckOutcome {
    match fetched {
        Err(e) if e.is_timeout() => CheckOutcome::Verdict(ValidationVerdict::unknown(1, "timed out fetching URL")),
        Err(e) => CheckOutcome::Verdict(ValidationVerdict::new(
            1,
            ValidationOutcome::Hard404,
            1.0,
            format!("fetch failed: {}", e),
        )),
        Ok(response) if response.status >= 400 => CheckOutcome::Verdict(ValidationVerdict::new(
            1,
            ValidationOutcome::Hard404,
            1.0,
            format!("HTTP {}", response.status),
        )),
        Ok(_) => CheckOutcome::Proceed,
    }
}

/// Level 2: a URL that promises a PDF must deliver one.
fn content_type_check(candidate: &UrlCandidate, fetched: &Result<FetchResponse>) -> CheckOutcome {
    let Ok(response) = fetched else {
        return CheckOutcome::Proceed;
    };
    if candidate.url_type != UrlType::Pdf {
        return CheckOutcome::Proceed;
    }
    match response.content_type.as_deref() {
        Some(ct) if !ct.contains("pdf") && !ct.contains("octet-stream") => CheckOutcome::Verdict(ValidationVerdict::new(
            2,
            ValidationOutcome::SoftContentTypeMismatch,
            MISMATCH_CONFIDENCE,
            format!("expected PDF, got {}", ct),
        )),
        _ => CheckOutcome::Proceed,
    }
}

/// Level 3: the body prefix must not read like a "not found" page.
fn content_anomaly_check(_candidate: &UrlCandidate, fetched: &Result<FetchResponse>) -> CheckOutcome {
    let Ok(response) = fetched else {
        return CheckOutcome::Proceed;
    };
    let body = match &response.body {
        Ok(body) => body.as_str(),
        Err(cause) => {
            return CheckOutcome::Verdict(ValidationVerdict::unknown(3, format!("body not read: {}", cause)));
        }
    };

    match first_match(body, &SOFT_404_PATTERNS) {
        Some(name) => CheckOutcome::Verdict(ValidationVerdict::new(
            3,
            ValidationOutcome::SoftContentAnomalous,
            ANOMALY_CONFIDENCE,
            format!("soft 404: {}", name),
        )),
        None => CheckOutcome::Proceed,
    }
}

/// Classifies the access barrier a page body shows, if any.
pub fn detect_access_barrier(body: &str) -> (AccessBarrier, String) {
    if let Some(name) = first_match(body, &PAYWALL_PATTERNS) {
        return (AccessBarrier::Paywall, format!("paywall: {}", name));
    }
    if let Some(name) = first_match(body, &LOGIN_PATTERNS) {
        return (AccessBarrier::LoginRequired, format!("login required: {}", name));
    }
    if let Some(name) = first_match(body, &PREVIEW_PATTERNS) {
        return (AccessBarrier::PreviewOnly, format!("preview only: {}", name));
    }
    (AccessBarrier::Open, "accessible content".to_string())
}

/// Whether `body` reads like a "not found" page served with a success status.
pub fn is_soft_404(body: &str) -> bool {
    first_match(body, &SOFT_404_PATTERNS).is_some()
}

pub fn default_checks() -> Vec<Check> {
    vec![
        Check {
            level: 1,
            name: "hard-404",
            run: hard_404_check,
        },
        Check {
            level: 2,
            name: "content-type",
            run: content_type_check,
        },
        Check {
            level: 3,
            name: "content-anomaly",
            run: content_anomaly_check,
        },
    ]
}

/// Runs the ordered validation levels against candidate URLs.
pub struct UrlValidator {
    fetcher: Arc<dyn Fetcher>,
    checks: Vec<Check>,
    max_bytes: usize,
    retry: RetryPolicy,
    concurrency: usize,
}

impl UrlValidator {
    pub fn new(fetcher: Arc<dyn Fetcher>, max_bytes: usize, retry: RetryPolicy) -> Self {
        Self {
            fetcher,
            checks: default_checks(),
            max_bytes,
            retry,
            concurrency: 4,
        }
    }

    pub fn from_config(config: &RefineConfig) -> Result<Self> {
        let fetcher = HttpFetcher::from_config(config)?;
        Ok(Self::new(Arc::new(fetcher), config.validation_max_bytes, config.retry.clone())
            .with_concurrency(config.validation_concurrency))
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Appends a further level, run after the existing ones.
    pub fn with_check(mut self, check: Check) -> Self {
        self.checks.push(check);
        self
    }

    async fn fetch(&self, url: &str) -> Result<FetchResponse> {
        let max_bytes = self.max_bytes;
        with_retry(&self.retry, "validation fetch", || async move {
            let response = self.fetcher.fetch(url, max_bytes).await?;
            if response.status == StatusCode::TOO_MANY_REQUESTS.as_u16() || response.status >= 500 {
                return Err(RefineError::HttpStatus(response.status));
            }
            Ok(response)
        })
        .await
    }

    /// Validates one candidate. Never fails: transport problems become verdicts.
    pub async fn validate(&self, candidate: &UrlCandidate) -> ValidationVerdict {
        self.validate_reporting(candidate).await.0
    }

    /// Like [`validate`](Self::validate), also returning the transport failure behind the verdict.
    async fn validate_reporting(&self, candidate: &UrlCandidate) -> (ValidationVerdict, Option<String>) {
        let fetched = self.fetch(&candidate.url).await;
        // Retried server errors surface as statuses so the hard-404 level sees them.
        let fetched = match fetched {
            Err(RefineError::HttpStatus(status)) => Ok(FetchResponse {
                status,
                content_type: None,
                body: Err(format!("not read for HTTP {}", status)),
            }),
            other => other,
        };
        let failure = fetched.as_ref().err().map(|e| {
            debug!("Fetch of {} failed: {}", candidate.url, e);
            format!("validation of {}: {}", candidate.url, e)
        });
        (self.run_checks(candidate, &fetched), failure)
    }

    fn run_checks(&self, candidate: &UrlCandidate, fetched: &Result<FetchResponse>) -> ValidationVerdict {
        for check in &self.checks {
            if let CheckOutcome::Verdict(verdict) = (check.run)(candidate, fetched) {
                debug!("{} -> {:?} at level {} ({})", candidate.url, verdict.outcome, check.level, check.name);
                return verdict;
            }
        }
        let level = self.checks.last().map(|c| c.level).unwrap_or(0);
        let (access, reason) = match fetched {
            Ok(FetchResponse { body: Ok(body), .. }) => detect_access_barrier(body),
            _ => (AccessBarrier::Unknown, "all checks passed".to_string()),
        };
        ValidationVerdict::new(level, ValidationOutcome::Valid, 1.0, reason).with_access(access)
    }

    /// Validates every candidate and attaches the verdicts.
    ///
    /// Returns one entry per candidate whose fetch failed at the transport level.
    pub async fn validate_all(&self, candidates: &mut [UrlCandidate]) -> Vec<String> {
        let results: Vec<(ValidationVerdict, Option<String>)> = stream::iter(candidates.iter())
            .map(|c| self.validate_reporting(c))
            .buffered(self.concurrency)
            .collect()
            .await;
        let mut errors = Vec::new();
        for (candidate, (verdict, failure)) in candidates.iter_mut().zip(results) {
            if verdict.outcome == ValidationOutcome::Hard404 {
                warn!("Dead link {}: {}", candidate.url, verdict.reason);
            }
            errors.extend(failure);
            candidate.validity = Some(verdict);
        }
        errors
    }
}
