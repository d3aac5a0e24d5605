//! The job HTTP surface end to end: start, poll, cancel, download.
#![cfg(feature = "server")]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use scrapecore::clock::ManualClock;
use scrapecore::config::{Config, FetchSecurityConfig};
use scrapecore::joblog::NullJobLogSink;
use scrapecore::{Fetcher, HostRegistry, JobOrchestrator, Metrics, ProcessorConfig};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn app() -> (MockServer, axum::Router) {
    let server = MockServer::start().await;
    let clock = Arc::new(ManualClock::new());
    let config = Arc::new(Config::default());
    let registry = HostRegistry::new(config, clock.clone());
    let fetcher = Arc::new(Fetcher::new(registry, Arc::new(Metrics::new()), &FetchSecurityConfig::default(), clock.clone()).unwrap());
    let orchestrator = JobOrchestrator::new(fetcher, None, ProcessorConfig::default(), Arc::new(NullJobLogSink), clock, Duration::from_secs(3600));
    (server, scrapecore::http_api::router(orchestrator))
}

#[tokio::test]
async fn start_then_status_then_download_round_trip() {
    let (server, router) = app().await;
    Mock::given(method("GET")).and(path("/doc")).respond_with(ResponseTemplate::new(200).set_body_string("body")).mount(&server).await;

    let body = serde_json::json!({ "mode": "list", "input": { "urls": [format!("{}/doc", server.uri())] } });
    let request = Request::post("/scrape/start").header("content-type", "application/json").body(Body::from(body.to_string())).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let job_id = parsed["jobId"].as_str().unwrap().to_string();

    let mut status_code = StatusCode::OK;
    for _ in 0..50 {
        let request = Request::get(format!("/scrape/status/{job_id}")).body(Body::empty()).unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        status_code = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        if parsed["status"] == "completed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status_code, StatusCode::OK);

    let request = Request::get(format!("/scrape/download/{job_id}?format=json")).body(Body::empty()).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_job_status_is_404() {
    let (_server, router) = app().await;
    let request = Request::get(format!("/scrape/status/{}", uuid::Uuid::new_v4())).body(Body::empty()).unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn start_with_empty_urls_is_400() {
    let (_server, router) = app().await;
    let body = serde_json::json!({ "mode": "list", "input": { "urls": [] } });
    let request = Request::post("/scrape/start").header("content-type", "application/json").body(Body::from(body.to_string())).unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
