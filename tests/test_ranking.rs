use async_trait::async_trait;
use mockito::{Matcher, Server};
use refrefine::refine::extract_domain;
use refrefine::refine::model::{AccessBarrier, UrlCandidate, ValidationOutcome, ValidationVerdict};
use refrefine::refine::ranking::{parse_oracle_reply, CandidateRanker, HttpScoringOracle, OracleScore, ScoringOracle};
use refrefine::refine::search::{classify_url_type, CostLedger};
use refrefine::{BibliographicRecord, DomainRules, RefineError, Result, RetryPolicy};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Runtime;

struct StubOracle {
    scores: HashMap<String, (f64, f64)>,
    batches: Mutex<Vec<Vec<String>>>,
}

impl StubOracle {
    fn new(scores: &[(&str, f64, f64)]) -> Self {
        Self {
            scores: scores.iter().map(|(u, p, s)| (u.to_string(), (*p, *s))).collect(),
            batches: Mutex::new(Vec::new()),
        }
    }

    fn sent_urls(&self) -> Vec<String> {
        self.batches.lock().unwrap().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl ScoringOracle for StubOracle {
    async fn rank_batch(&self, _bib: &BibliographicRecord, candidates: &[UrlCandidate]) -> Result<Vec<OracleScore>> {
        self.batches
            .lock()
            .unwrap()
            .push(candidates.iter().map(|c| c.url.clone()).collect());
        if candidates.iter().any(|c| c.url.contains("fail")) {
            return Err(RefineError::OracleFailure("malformed response".to_string()));
        }
        Ok(candidates
            .iter()
            .filter_map(|c| {
                self.scores.get(&c.url).map(|(p, s)| OracleScore {
                    url: c.url.clone(),
                    primary_score: *p,
                    secondary_score: *s,
                })
            })
            .collect())
    }
}

fn candidate(url: &str, order: usize) -> UrlCandidate {
    UrlCandidate {
        url: url.to_string(),
        domain: extract_domain(url),
        title: String::new(),
        snippet: String::new(),
        url_type: classify_url_type(url),
        discovered_via_query: String::new(),
        initial_score: 50,
        discovery_order: order,
        is_aggregator: false,
        validity: None,
    }
}

fn with_verdict(mut c: UrlCandidate, outcome: ValidationOutcome, access: AccessBarrier) -> UrlCandidate {
    c.validity = Some(ValidationVerdict::new(3, outcome, 1.0, "test").with_access(access));
    c
}

fn bib() -> BibliographicRecord {
    BibliographicRecord::new(1, "The filter bubble").with_author("Pariser, E.")
}

fn ranker(oracle: Arc<StubOracle>, batch_size: usize, ledger: Arc<CostLedger>) -> CandidateRanker {
    CandidateRanker::new(oracle, DomainRules::default(), batch_size, RetryPolicy::fast(1), ledger)
}

const AGGREGATOR: &str = "https://scholar.google.com/citations?user=abc";
const HARVARD_PDF: &str = "https://dash.harvard.edu/bitstream/filter-bubble.pdf";
const WIKIPEDIA: &str = "https://en.wikipedia.org/wiki/Filter_bubble";

#[test]
fn test_aggregator_capped_when_downloadable_alternative_exists() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let oracle = Arc::new(StubOracle::new(&[(AGGREGATOR, 95.0, 50.0), (HARVARD_PDF, 70.0, 20.0)]));
        let ledger = Arc::new(CostLedger::new(0.005, 0.0, 100));
        let ranker = ranker(oracle, 10, ledger);

        let mut candidates = vec![candidate(AGGREGATOR, 0), candidate(HARVARD_PDF, 1)];
        let ceiling = ranker.penalize_aggregators(&mut candidates);
        assert_eq!(ceiling, 40);
        assert!(candidates[0].is_aggregator);
        assert!(!candidates[1].is_aggregator);

        let scores = ranker.rank(&candidates, &bib()).await.scores;
        assert_eq!(scores[0].primary_score, 40);
        assert!(scores[0].is_aggregator);
        // .edu tier bonus plus the trusted-PDF bonus.
        assert_eq!(scores[1].primary_score, 90);
        assert_eq!(scores[1].secondary_score, 35);
    });
}

#[test]
fn test_aggregator_gets_higher_ceiling_without_alternative() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let oracle = Arc::new(StubOracle::new(&[(AGGREGATOR, 95.0, 50.0), (WIKIPEDIA, 50.0, 40.0)]));
        let ranker = ranker(oracle, 10, Arc::new(CostLedger::new(0.005, 0.0, 100)));

        let candidates = vec![candidate(AGGREGATOR, 0), candidate(WIKIPEDIA, 1)];
        let scores = ranker.rank(&candidates, &bib()).await.scores;
        assert_eq!(scores[0].primary_score, 60);
        // Listing sites are pushed down on both axes.
        assert_eq!(scores[1].primary_score, 35);
        assert_eq!(scores[1].secondary_score, 25);
    });
}

#[test]
fn test_scores_are_clamped_and_validity_adjusted() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let mismatch = "https://example.com/fake.pdf";
        let paywalled = "https://www.sciencedirect.com/science/article/pii/1";
        let open_review = "https://www.nybooks.com/articles/filter-bubble-review";
        let oracle = Arc::new(StubOracle::new(&[
            (HARVARD_PDF, 98.0, 10.0),
            (mismatch, 80.0, 10.0),
            (paywalled, 80.0, 40.0),
            (open_review, 10.0, 60.0),
        ]));
        let ranker = ranker(oracle, 10, Arc::new(CostLedger::new(0.005, 0.0, 100)));

        let candidates = vec![
            with_verdict(candidate(HARVARD_PDF, 0), ValidationOutcome::Valid, AccessBarrier::Open),
            with_verdict(
                candidate(mismatch, 1),
                ValidationOutcome::SoftContentTypeMismatch,
                AccessBarrier::Unknown,
            ),
            with_verdict(candidate(paywalled, 2), ValidationOutcome::Valid, AccessBarrier::Paywall),
            with_verdict(candidate(open_review, 3), ValidationOutcome::Valid, AccessBarrier::Open),
        ];
        let scores = ranker.rank(&candidates, &bib()).await.scores;

        assert_eq!(scores[0].primary_score, 100);
        assert_eq!(scores[1].primary_score, 60);
        assert_eq!(scores[2].primary_score, 70);
        assert_eq!(scores[2].secondary_score, 40);
        assert_eq!(scores[3].secondary_score, 65);
        assert!(scores.iter().all(|s| s.scored));
    });
}

#[test]
fn test_dead_links_are_not_sent_to_the_oracle() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let dead = "https://example.org/removed";
        let oracle = Arc::new(StubOracle::new(&[(HARVARD_PDF, 80.0, 10.0), (dead, 99.0, 99.0)]));
        let ranker = ranker(oracle.clone(), 10, Arc::new(CostLedger::new(0.005, 0.0, 100)));

        let candidates = vec![
            candidate(HARVARD_PDF, 0),
            with_verdict(candidate(dead, 1), ValidationOutcome::Hard404, AccessBarrier::Unknown),
        ];
        let scores = ranker.rank(&candidates, &bib()).await.scores;

        assert_eq!(oracle.sent_urls(), vec![HARVARD_PDF.to_string()]);
        assert_eq!(scores[1].primary_score, 0);
        assert_eq!(scores[1].secondary_score, 0);
        assert!(!scores[1].scored);
    });
}

#[test]
fn test_failed_batch_leaves_only_its_candidates_unscored() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let urls = [
            "https://a.example.org/1",
            "https://b.example.org/fail",
            "https://c.example.org/3",
            "https://d.example.org/4",
            "https://e.example.org/5",
        ];
        let oracle = Arc::new(StubOracle::new(&urls.iter().map(|u| (*u, 50.0, 50.0)).collect::<Vec<_>>()));
        let ledger = Arc::new(CostLedger::new(0.005, 0.0, 100));
        let ranker = ranker(oracle.clone(), 2, ledger.clone());

        let candidates: Vec<_> = urls.iter().enumerate().map(|(i, u)| candidate(u, i)).collect();
        let outcome = ranker.rank(&candidates, &bib()).await;

        assert_eq!(oracle.batches.lock().unwrap().len(), 3);
        let scored: Vec<bool> = outcome.scores.iter().map(|s| s.scored).collect();
        assert_eq!(scored, vec![false, false, true, true, true]);
        assert_eq!(ledger.snapshot().oracle_calls, 2);

        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].starts_with("oracle batch 1 (2 candidates)"));
        assert!(outcome.errors[0].contains("malformed response"));
    });
}

#[test]
fn test_aggregator_pdf_gets_no_trusted_bonus() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let academia_pdf = "https://www.academia.edu/12345/filter-bubble.pdf";
        let oracle = Arc::new(StubOracle::new(&[(academia_pdf, 20.0, 10.0)]));
        let ranker = ranker(oracle, 10, Arc::new(CostLedger::new(0.005, 0.0, 100)));

        let candidates = vec![candidate(academia_pdf, 0)];
        let outcome = ranker.rank(&candidates, &bib()).await;
        assert!(outcome.errors.is_empty());
        assert!(outcome.scores[0].is_aggregator);
        // No .edu tier bonus and no trusted-PDF bonus for an aggregator.
        assert_eq!(outcome.scores[0].primary_score, 20);
        assert_eq!(outcome.scores[0].secondary_score, 10);
    });
}

#[test]
fn test_http_oracle_parses_chat_reply() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let mut server = Server::new_async().await;
        let reply = format!(
            "Scores follow:\n[{{\"url\": \"{}\", \"primary_score\": 88, \"secondary_score\": 12}}]",
            HARVARD_PDF
        );
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer test-key")
            .match_body(Matcher::PartialJson(json!({"model": "gpt-4o-mini"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"choices": [{"message": {"role": "assistant", "content": reply}}]}).to_string())
            .create_async()
            .await;

        let oracle = HttpScoringOracle::new(server.url(), "test-key", "gpt-4o-mini", Duration::from_secs(5)).unwrap();
        let scores = oracle.rank_batch(&bib(), &[candidate(HARVARD_PDF, 0)]).await.unwrap();
        mock.assert_async().await;

        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].url, HARVARD_PDF);
        assert_eq!(scores[0].primary_score, 88.0);
    });
}

#[test]
fn test_http_oracle_client_error_is_oracle_failure() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(401)
            .create_async()
            .await;

        let oracle = HttpScoringOracle::new(server.url(), "bad", "gpt-4o-mini", Duration::from_secs(5)).unwrap();
        let result = oracle.rank_batch(&bib(), &[candidate(HARVARD_PDF, 0)]).await;
        assert!(matches!(result, Err(RefineError::OracleFailure(_))));
    });
}

#[test]
fn test_parse_oracle_reply() {
    let scores = parse_oracle_reply(r#"[{"url": "https://x.org", "primaryScore": 10, "secondaryScore": 90}]"#).unwrap();
    assert_eq!(scores[0].secondary_score, 90.0);
    assert!(matches!(parse_oracle_reply("no scores today"), Err(RefineError::OracleFailure(_))));
}
