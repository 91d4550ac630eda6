//! Finds, validates, ranks and selects PRIMARY and SECONDARY URLs for
//! bibliography references.

pub mod batch;
pub mod config;
pub mod error;
pub mod refine;
pub mod store;

pub use batch::{BatchPipeline, BatchProgress, BatchSummary, CancelHandle, ProgressTracker};
pub use config::{DomainRules, QueryConfig, RefineConfig, RetryPolicy};
pub use error::{RefineError, Result};
pub use refine::model::{BibliographicRecord, Decision, Query, QueryType, Rid, UrlCandidate, UrlType};
pub use store::{JsonReferenceStore, MemoryReferenceStore, ReferenceStore};
