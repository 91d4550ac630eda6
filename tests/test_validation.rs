use async_trait::async_trait;
use mockito::Server;
use refrefine::refine::model::{AccessBarrier, UrlCandidate, ValidationOutcome, ValidationVerdict};
use refrefine::refine::search::classify_url_type;
use refrefine::refine::validation::{
    detect_access_barrier, is_soft_404, Check, CheckOutcome, FetchResponse, Fetcher, HttpFetcher, UrlValidator,
};
use refrefine::refine::extract_domain;
use refrefine::{RefineError, Result, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

fn candidate(url: &str) -> UrlCandidate {
    UrlCandidate {
        url: url.to_string(),
        domain: extract_domain(url),
        title: "The filter bubble".to_string(),
        snippet: String::new(),
        url_type: classify_url_type(url),
        discovered_via_query: "\"The filter bubble\" Pariser 2011".to_string(),
        initial_score: 75,
        discovery_order: 0,
        is_aggregator: false,
        validity: None,
    }
}

fn http_validator() -> UrlValidator {
    let fetcher = HttpFetcher::new(Duration::from_secs(5), Duration::from_secs(5)).unwrap();
    UrlValidator::new(Arc::new(fetcher), 100_000, RetryPolicy::fast(2))
}

#[test]
fn test_three_levels_against_mock_server() {
    let rt = Runtime::new().unwrap();

    rt.block_on(async {
        let mut server = Server::new_async().await;
        let _dead = server.mock("GET", "/dead").with_status(404).create_async().await;
        let _html_pdf = server
            .mock("GET", "/fake.pdf")
            .with_status(200)
            .with_header("content-type", "text/html; charset=utf-8")
            .with_body("<html><body>Landing page</body></html>")
            .create_async()
            .await;
        let _real_pdf = server
            .mock("GET", "/real.pdf")
            .with_status(200)
            .with_header("content-type", "application/pdf")
            .with_body("%PDF-1.4 The filter bubble, chapter one")
            .create_async()
            .await;
        let _soft_404 = server
            .mock("GET", "/gone")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body("<html><head><title>Page Not Found</title></head><body>Sorry</body></html>")
            .create_async()
            .await;
        let _open = server
            .mock("GET", "/article")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body("<html><head><title>The filter bubble</title></head><body>Chapter one.</body></html>")
            .create_async()
            .await;

        let validator = http_validator();
        let base = server.url();

        let dead = validator.validate(&candidate(&format!("{}/dead", base))).await;
        assert_eq!(dead.outcome, ValidationOutcome::Hard404);
        assert_eq!(dead.level, 1);
        assert_eq!(dead.confidence, 1.0);

        let mismatch = validator.validate(&candidate(&format!("{}/fake.pdf", base))).await;
        assert_eq!(mismatch.outcome, ValidationOutcome::SoftContentTypeMismatch);
        assert_eq!(mismatch.level, 2);
        assert!(mismatch.confidence >= 0.6 && mismatch.confidence <= 0.7);

        let pdf = validator.validate(&candidate(&format!("{}/real.pdf", base))).await;
        assert_eq!(pdf.outcome, ValidationOutcome::Valid);
        assert_eq!(pdf.confidence, 1.0);

        let soft = validator.validate(&candidate(&format!("{}/gone", base))).await;
        assert_eq!(soft.outcome, ValidationOutcome::SoftContentAnomalous);
        assert_eq!(soft.level, 3);
        assert_eq!(soft.confidence, 0.4);

        let open = validator.validate(&candidate(&format!("{}/article", base))).await;
        assert_eq!(open.outcome, ValidationOutcome::Valid);
        assert_eq!(open.access, AccessBarrier::Open);
    });
}

#[test]
fn test_server_errors_are_retried_then_dead() {
    let rt = Runtime::new().unwrap();

    rt.block_on(async {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/flaky")
            .with_status(503)
            .expect(2)
            .create_async()
            .await;

        let verdict = http_validator()
            .validate(&candidate(&format!("{}/flaky", server.url())))
            .await;
        mock.assert_async().await;
        assert_eq!(verdict.outcome, ValidationOutcome::Hard404);
        assert!(verdict.reason.contains("503"));
    });
}

#[test]
fn test_connection_failure_is_dead() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let verdict = http_validator().validate(&candidate("http://127.0.0.1:1/nothing")).await;
        assert_eq!(verdict.outcome, ValidationOutcome::Hard404);
        assert_eq!(verdict.confidence, 1.0);
    });
}

struct StubFetcher {
    response: fn() -> Result<FetchResponse>,
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(&self, _url: &str, _max_bytes: usize) -> Result<FetchResponse> {
        (self.response)()
    }
}

fn stub_validator(response: fn() -> Result<FetchResponse>) -> UrlValidator {
    UrlValidator::new(Arc::new(StubFetcher { response }), 100_000, RetryPolicy::fast(2))
}

#[test]
fn test_timeouts_are_unknown_not_dead() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let head = stub_validator(|| Err(RefineError::Timeout))
            .validate(&candidate("https://example.org/slow"))
            .await;
        assert_eq!(head.outcome, ValidationOutcome::Unknown);
        assert_eq!(head.level, 1);
        assert_eq!(head.confidence, 0.5);

        let body = stub_validator(|| {
            Ok(FetchResponse {
                status: 200,
                content_type: Some("text/html".to_string()),
                body: Err("timed out after 5s".to_string()),
            })
        })
        .validate(&candidate("https://example.org/slow-body"))
        .await;
        assert_eq!(body.outcome, ValidationOutcome::Unknown);
        assert_eq!(body.level, 3);
        assert!(body.reason.contains("timed out"));
    });
}

#[test]
fn test_body_read_failure_reports_its_cause() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let verdict = stub_validator(|| {
            Ok(FetchResponse {
                status: 200,
                content_type: Some("text/html".to_string()),
                body: Err("read failed: connection reset by peer".to_string()),
            })
        })
        .validate(&candidate("https://example.org/reset"))
        .await;
        assert_eq!(verdict.outcome, ValidationOutcome::Unknown);
        assert_eq!(verdict.level, 3);
        assert!(verdict.reason.contains("connection reset by peer"));
        assert!(!verdict.reason.contains("timed out"));
    });
}

#[test]
fn test_validate_all_reports_transport_failures() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let validator = stub_validator(|| Err(RefineError::Timeout));
        let mut candidates = vec![candidate("https://a.org/1"), candidate("https://b.org/2")];
        let errors = validator.validate_all(&mut candidates).await;

        assert_eq!(errors.len(), 2);
        assert!(errors[0].starts_with("validation of https://a.org/1"));
        assert!(errors[1].contains("timed out"));
        for c in &candidates {
            assert_eq!(c.validity.as_ref().unwrap().outcome, ValidationOutcome::Unknown);
        }
    });
}

#[test]
fn test_access_barriers_are_recorded_on_valid_pages() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let paywalled = stub_validator(|| {
            Ok(FetchResponse {
                status: 200,
                content_type: Some("text/html".to_string()),
                body: Ok("<p>Subscribe to continue reading this article.</p>".to_string()),
            })
        })
        .validate(&candidate("https://www.nytimes.com/review"))
        .await;
        assert_eq!(paywalled.outcome, ValidationOutcome::Valid);
        assert_eq!(paywalled.access, AccessBarrier::Paywall);
    });

    assert_eq!(detect_access_barrier("Please log in to view the article").0, AccessBarrier::LoginRequired);
    assert_eq!(detect_access_barrier("Limited preview of this book").0, AccessBarrier::PreviewOnly);
    assert_eq!(detect_access_barrier("Chapter one of the work").0, AccessBarrier::Open);
    assert!(is_soft_404("We couldn't locate that document"));
    assert!(!is_soft_404("The filter bubble, chapter one"));
}

fn reject_everything(_c: &UrlCandidate, _f: &Result<FetchResponse>) -> CheckOutcome {
    CheckOutcome::Verdict(ValidationVerdict::new(
        4,
        ValidationOutcome::SoftContentAnomalous,
        0.3,
        "structural check failed",
    ))
}

#[test]
fn test_additional_level_runs_after_the_others() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let validator = stub_validator(|| {
            Ok(FetchResponse {
                status: 200,
                content_type: Some("application/pdf".to_string()),
                body: Ok("%PDF-1.4".to_string()),
            })
        })
        .with_check(Check {
            level: 4,
            name: "pdf-structure",
            run: reject_everything,
        });

        let verdict = validator.validate(&candidate("https://example.edu/paper.pdf")).await;
        assert_eq!(verdict.level, 4);
        assert_eq!(verdict.outcome, ValidationOutcome::SoftContentAnomalous);

        // Earlier levels still short-circuit.
        let dead = stub_validator(|| {
            Ok(FetchResponse {
                status: 410,
                content_type: None,
                body: Err("not read for HTTP 410".to_string()),
            })
        })
        .with_check(Check {
            level: 4,
            name: "pdf-structure",
            run: reject_everything,
        })
        .validate(&candidate("https://example.edu/paper.pdf"))
        .await;
        assert_eq!(dead.level, 1);
        assert_eq!(dead.outcome, ValidationOutcome::Hard404);
    });
}

#[test]
fn test_validate_all_attaches_verdicts_without_touching_scores() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let validator = stub_validator(|| {
            Ok(FetchResponse {
                status: 404,
                content_type: None,
                body: Err("not read for HTTP 404".to_string()),
            })
        });
        let mut candidates = vec![candidate("https://a.org/1"), candidate("https://b.org/2")];
        let errors = validator.validate_all(&mut candidates).await;
        assert!(errors.is_empty());
        for c in &candidates {
            assert_eq!(c.initial_score, 75);
            assert_eq!(c.validity.as_ref().unwrap().outcome, ValidationOutcome::Hard404);
        }
    });
}
