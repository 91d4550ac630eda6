use serde::{Deserialize, Serialize};

/// Stable identifier of one reference within a manuscript.
pub type Rid = u64;

/// Bibliographic metadata of one reference, as held by the reference store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BibliographicRecord {
    pub rid: Rid,
    pub author: String,
    pub title: String,
    pub year: String,
    pub publication: String,
    pub doi: Option<String>,
    pub full_text: Option<String>,
    pub relevance: Option<String>,
    pub biblio_extra: Option<String>,
}

impl BibliographicRecord {
    pub fn new(rid: Rid, title: impl Into<String>) -> Self {
        Self {
            rid,
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn with_year(mut self, year: impl Into<String>) -> Self {
        self.year = year.into();
        self
    }

    pub fn with_publication(mut self, publication: impl Into<String>) -> Self {
        self.publication = publication.into();
        self
    }

    pub fn with_doi(mut self, doi: impl Into<String>) -> Self {
        self.doi = Some(doi.into());
        self
    }

    pub fn with_relevance(mut self, relevance: impl Into<String>) -> Self {
        self.relevance = Some(relevance.into());
        self
    }

    /// True when no field carries text a query could be built from.
    pub fn has_usable_text(&self) -> bool {
        let doi = self.doi.as_deref().unwrap_or("");
        [self.title.as_str(), self.author.as_str(), self.publication.as_str(), doi]
            .iter()
            .any(|f| f.chars().any(char::is_alphanumeric))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    Primary,
    Secondary,
}

/// A single search query planned for a reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub text: String,
    #[serde(rename = "type")]
    pub query_type: QueryType,
    pub rid: Rid,
    pub query_number: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UrlType {
    #[serde(rename = "PDF")]
    Pdf,
    #[serde(rename = "HTML")]
    Html,
    #[serde(rename = "DOI")]
    Doi,
    Other,
}

/// One raw search hit as returned by the search backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationOutcome {
    Hard404,
    SoftContentTypeMismatch,
    SoftContentAnomalous,
    Valid,
    /// The check could not complete (timeout); neutral evidence.
    Unknown,
}

/// Access barriers spotted in the body of an otherwise valid page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessBarrier {
    Open,
    Paywall,
    LoginRequired,
    PreviewOnly,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationVerdict {
    pub level: u8,
    pub outcome: ValidationOutcome,
    pub confidence: f64,
    pub access: AccessBarrier,
    pub reason: String,
}

impl ValidationVerdict {
    pub fn new(level: u8, outcome: ValidationOutcome, confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            level,
            outcome,
            confidence,
            access: AccessBarrier::Unknown,
            reason: reason.into(),
        }
    }

    pub fn unknown(level: u8, reason: impl Into<String>) -> Self {
        Self::new(level, ValidationOutcome::Unknown, 0.5, reason)
    }

    pub fn with_access(mut self, access: AccessBarrier) -> Self {
        self.access = access;
        self
    }
}

/// A deduplicated URL found while searching for one reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlCandidate {
    pub url: String,
    pub domain: String,
    pub title: String,
    #[serde(default)]
    pub snippet: String,
    pub url_type: UrlType,
    pub discovered_via_query: String,
    pub initial_score: u8,
    /// Position in discovery order across all queries of the reference.
    #[serde(default)]
    pub discovery_order: usize,
    #[serde(default)]
    pub is_aggregator: bool,
    #[serde(default)]
    pub validity: Option<ValidationVerdict>,
}

/// Scores for one candidate after oracle scoring and deterministic adjustment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedScore {
    pub url: String,
    pub primary_score: u8,
    pub secondary_score: u8,
    pub is_aggregator: bool,
    /// False when the oracle could not score this candidate.
    pub scored: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate {
    pub candidate: UrlCandidate,
    pub score: RankedScore,
}

/// The durable outcome of processing one reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Decision {
    pub rid: Rid,
    pub primary_url: Option<String>,
    pub secondary_url: Option<String>,
    pub author: String,
    pub title: String,
    pub year: String,
    pub relevance: String,
    pub biblio_extra: String,
    pub finalized: bool,
    pub batch_version: String,
}

impl Decision {
    /// Builds an unfinalized decision carrying the record's descriptive fields.
    pub fn for_record(bib: &BibliographicRecord, batch_version: &str) -> Self {
        Self {
            rid: bib.rid,
            primary_url: None,
            secondary_url: None,
            author: bib.author.clone(),
            title: bib.title.clone(),
            year: bib.year.clone(),
            relevance: bib.relevance.clone().unwrap_or_default(),
            biblio_extra: bib.biblio_extra.clone().unwrap_or_default(),
            finalized: false,
            batch_version: batch_version.to_string(),
        }
    }
}
