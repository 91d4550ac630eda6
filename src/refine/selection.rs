use log::{info, warn};
use std::cmp::{Ordering, Reverse};

use crate::config::SelectionThresholds;
use crate::error::{RefineError, Result};
use crate::refine::model::{BibliographicRecord, Decision, RankedCandidate, Rid};
use crate::refine::normalize_url;
use crate::store::{OverrideEntry, ReferenceStore};

/// PRIMARY and SECONDARY picks for one reference; either may be absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub primary: Option<RankedCandidate>,
    pub secondary: Option<RankedCandidate>,
}

impl Selection {
    pub fn primary_url(&self) -> Option<&str> {
        self.primary.as_ref().map(|c| c.candidate.url.as_str())
    }

    pub fn secondary_url(&self) -> Option<&str> {
        self.secondary.as_ref().map(|c| c.candidate.url.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_none() && self.secondary.is_none()
    }
}

/// Applies the acceptance thresholds and the PRIMARY/SECONDARY exclusivity rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct Selector {
    thresholds: SelectionThresholds,
}

fn primary_order(a: &RankedCandidate, b: &RankedCandidate) -> Ordering {
    (a.score.primary_score, a.score.secondary_score, Reverse(a.candidate.discovery_order)).cmp(&(
        b.score.primary_score,
        b.score.secondary_score,
        Reverse(b.candidate.discovery_order),
    ))
}

fn secondary_order(a: &RankedCandidate, b: &RankedCandidate) -> Ordering {
    (a.score.secondary_score, Reverse(a.candidate.discovery_order))
        .cmp(&(b.score.secondary_score, Reverse(b.candidate.discovery_order)))
}

impl Selector {
    pub fn new(thresholds: SelectionThresholds) -> Self {
        Self { thresholds }
    }

    /// Picks the best PRIMARY, then the best SECONDARY among the rest.
    ///
    /// A candidate clearing the PRIMARY threshold is taken to be the work
    /// itself and never qualifies as SECONDARY, and the SECONDARY URL always
    /// differs from the PRIMARY URL.
    pub fn select(&self, ranked: &[RankedCandidate]) -> Selection {
        let primary_accept = self.thresholds.primary_accept;
        let secondary_accept = self.thresholds.secondary_accept;

        let primary = ranked
            .iter()
            .filter(|c| c.score.scored && c.score.primary_score >= primary_accept)
            .max_by(|a, b| primary_order(a, b))
            .cloned();

        let primary_key = primary.as_ref().map(|p| normalize_url(&p.candidate.url));
        let secondary = ranked
            .iter()
            .filter(|c| c.score.scored && c.score.secondary_score >= secondary_accept)
            .filter(|c| c.score.primary_score < primary_accept)
            .filter(|c| primary_key.as_deref() != Some(normalize_url(&c.candidate.url).as_str()))
            .max_by(|a, b| secondary_order(a, b))
            .cloned();

        Selection { primary, secondary }
    }

    /// Decision for `bib` carrying the selected URLs. Automatic decisions are never finalized.
    pub fn decide(&self, bib: &BibliographicRecord, selection: &Selection, batch_version: &str) -> Decision {
        Decision {
            primary_url: selection.primary_url().map(str::to_string),
            secondary_url: selection.secondary_url().map(str::to_string),
            ..Decision::for_record(bib, batch_version)
        }
    }
}

fn same_url(a: &Option<String>, b: &Option<String>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => normalize_url(a) == normalize_url(b),
        _ => false,
    }
}

fn incomplete(rid: Rid, reason: &str) -> RefineError {
    RefineError::DecisionIncomplete {
        rid,
        reason: reason.to_string(),
    }
}

/// Persists an automatic decision. Re-committing a rid replaces its decision.
pub async fn commit_decision(store: &dyn ReferenceStore, decision: &Decision) -> Result<()> {
    if same_url(&decision.primary_url, &decision.secondary_url) {
        return Err(incomplete(decision.rid, "PRIMARY and SECONDARY URLs are identical"));
    }
    store.save_decision(decision).await?;
    info!(
        "Committed decision for reference {} (primary: {}, secondary: {})",
        decision.rid,
        decision.primary_url.as_deref().unwrap_or("none"),
        decision.secondary_url.as_deref().unwrap_or("none")
    );
    Ok(())
}

/// Persists operator-chosen URLs, bypassing automatic selection.
///
/// Requires non-empty author, title, year and relevance and both URLs;
/// nothing is written when any is missing. The stored decision is finalized
/// and the change is appended to the override log.
pub async fn commit_override(store: &dyn ReferenceStore, mut decision: Decision) -> Result<Decision> {
    let rid = decision.rid;
    let required = [
        ("author", &decision.author),
        ("title", &decision.title),
        ("year", &decision.year),
        ("relevance", &decision.relevance),
    ];
    let missing: Vec<&str> = required
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| *name)
        .collect();
    if !missing.is_empty() {
        warn!("Rejected override for reference {}: missing {}", rid, missing.join(", "));
        return Err(incomplete(rid, &format!("missing {}", missing.join(", "))));
    }

    let has = |url: &Option<String>| url.as_deref().map(|u| !u.trim().is_empty()).unwrap_or(false);
    if !has(&decision.primary_url) || !has(&decision.secondary_url) {
        return Err(incomplete(rid, "both PRIMARY and SECONDARY URLs are required"));
    }
    if same_url(&decision.primary_url, &decision.secondary_url) {
        return Err(incomplete(rid, "PRIMARY and SECONDARY URLs are identical"));
    }

    decision.finalized = true;
    let before = store.get_decision(rid).await?;
    store.save_decision(&decision).await?;

    let changed = before
        .as_ref()
        .map(|b| b.primary_url != decision.primary_url || b.secondary_url != decision.secondary_url || !b.finalized)
        .unwrap_or(true);
    if changed {
        store.log_override(&OverrideEntry::new(before, decision.clone())).await?;
    }

    info!("Operator override committed for reference {}", rid);
    Ok(decision)
}
