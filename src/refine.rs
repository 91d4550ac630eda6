pub mod model;
pub mod query;
pub mod ranking;
pub mod search;
pub mod selection;
pub mod validation;

use backoff::{future::retry, ExponentialBackoff};
use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use std::future::Future;
use url::Url;

use crate::config::RetryPolicy;
use crate::error::Result;

// Commonly used regex patterns compiled once
pub(crate) static DOI_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b10\.\d{4,9}/[^\s]+").expect("Invalid DOI regex pattern")
});
pub(crate) static TOKEN_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[\p{L}\p{N}]+").expect("Invalid token regex pattern")
});

/// Query-string parameters that only track clicks and never identify content.
const TRACKING_PARAMS: &[&str] = &["utm_source", "utm_medium", "utm_campaign", "utm_term", "utm_content", "fbclid", "gclid"];

/// Runs `op` with exponential backoff, retrying transient failures at most
/// `policy.max_attempts` times in total.
pub(crate) async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let backoff = ExponentialBackoff {
        initial_interval: policy.initial_interval,
        max_interval: policy.max_interval,
        max_elapsed_time: Some(policy.max_elapsed),
        ..Default::default()
    };
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    let operation = || {
        attempt += 1;
        let current = attempt;
        let fut = op();
        async move {
            match fut.await {
                Ok(value) => Ok(value),
                Err(e) if e.is_transient() && current < max_attempts => {
                    warn!("{} failed (attempt {}/{}): {}", label, current, max_attempts, e);
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        }
    };

    retry(backoff, operation).await
}

/// Canonical form of a URL used as the candidate uniqueness key.
///
/// Lowercases scheme and host, drops `www.`, fragments, tracking parameters
/// and a trailing slash. Unparseable input is trimmed and lowercased.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let mut url = match Url::parse(trimmed) {
        Ok(u) => u,
        Err(_) => return trimmed.to_lowercase(),
    };
    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !TRACKING_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let host = url.host_str().unwrap_or("").trim_start_matches("www.").to_string();
    let path = url.path().trim_end_matches('/').to_string();
    let mut normalized = format!("{}://{}", url.scheme(), host);
    if let Some(port) = url.port() {
        normalized.push_str(&format!(":{}", port));
    }
    normalized.push_str(&path);
    if let Some(query) = url.query() {
        normalized.push('?');
        normalized.push_str(query);
    }
    normalized
}

/// Host of a URL without a leading `www.`; empty when the URL has no host.
pub fn extract_domain(raw: &str) -> String {
    Url::parse(raw.trim())
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_lowercase()))
        .unwrap_or_default()
}

/// Whether `domain` matches any of the host patterns.
pub fn domain_matches(domain: &str, patterns: &[String]) -> bool {
    let domain = domain.to_lowercase();
    patterns.iter().any(|p| {
        let p = p.to_lowercase();
        if p.starts_with('.') {
            domain.ends_with(&p)
        } else {
            domain.contains(&p)
        }
    })
}

/// Lowercased word tokens of `text`.
pub(crate) fn tokens(text: &str) -> Vec<String> {
    TOKEN_REGEX
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}
