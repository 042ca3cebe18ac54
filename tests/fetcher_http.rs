//! Fetch protocol tests against a mock HTTP server: pagination shapes,
//! retry/backoff, the max-pages bound, and auth placement.

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use automation_runner::config::{AuthMode, FetchConfig};
use automation_runner::fetcher::SignalFetcher;
use automation_runner::types::FetchError;

fn test_config(url: String) -> FetchConfig {
    FetchConfig {
        signals_url: Some(url),
        max_retries: 2,
        base_backoff: Duration::from_millis(1),
        ..FetchConfig::default()
    }
}

fn item(symbol: &str) -> serde_json::Value {
    json!({
        "symbol": symbol,
        "bias": "BULLISH",
        "timeframes": {"D1": {"signal": "BUY"}}
    })
}

#[tokio::test]
async fn bare_list_is_a_single_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/signals"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([item("EURUSD")])))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = SignalFetcher::new(test_config(format!("{}/signals", server.uri()))).unwrap();
    let (signals, meta) = fetcher.fetch_all().await.unwrap();

    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].symbol, "EURUSD");
    assert_eq!(meta.pages_fetched, 1);
    assert_eq!(meta.source, "api");
}

#[tokio::test]
async fn next_url_pagination_fetches_both_pages() {
    let server = MockServer::start().await;

    // Page 2 is reached through the "next" URL verbatim, so the page
    // number parameter is absent there.
    Mock::given(method("GET"))
        .and(path("/signals"))
        .and(query_param("cursor", "p2"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"data": [item("GBPUSD")], "next": null})),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/signals"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [item("EURUSD")],
            "next": format!("{}/signals?cursor=p2", server.uri())
        })))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = SignalFetcher::new(test_config(format!("{}/signals", server.uri()))).unwrap();
    let (signals, meta) = fetcher.fetch_all().await.unwrap();

    assert_eq!(meta.pages_fetched, 2);
    assert_eq!(meta.signals_count, 2);
    let symbols: Vec<_> = signals.iter().map(|s| s.symbol.as_str()).collect();
    assert_eq!(symbols, vec!["EURUSD", "GBPUSD"]);
}

#[tokio::test]
async fn page_counter_pagination() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/signals"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [item("EURUSD")], "page": 1, "total_pages": 2
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/signals"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [item("GBPUSD")], "page": 2, "total_pages": 2
        })))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = SignalFetcher::new(test_config(format!("{}/signals", server.uri()))).unwrap();
    let (signals, meta) = fetcher.fetch_all().await.unwrap();

    assert_eq!(meta.pages_fetched, 2);
    assert_eq!(signals.len(), 2);
}

#[tokio::test]
async fn unbounded_next_chain_stops_at_max_pages() {
    let server = MockServer::start().await;

    // Every response points back at itself.
    Mock::given(method("GET"))
        .and(path("/signals"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [item("EURUSD")],
            "next": format!("{}/signals", server.uri())
        })))
        .mount(&server)
        .await;

    let config = FetchConfig {
        max_pages: 3,
        ..test_config(format!("{}/signals", server.uri()))
    };
    let fetcher = SignalFetcher::new(config).unwrap();
    let (signals, meta) = fetcher.fetch_all().await.unwrap();

    assert_eq!(meta.pages_fetched, 3);
    assert_eq!(signals.len(), 3);
}

#[tokio::test]
async fn transient_errors_are_retried_per_page() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/signals"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/signals"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([item("EURUSD")])))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = SignalFetcher::new(test_config(format!("{}/signals", server.uri()))).unwrap();
    let (signals, meta) = fetcher.fetch_all().await.unwrap();

    assert_eq!(signals.len(), 1);
    assert_eq!(meta.pages_fetched, 1);
}

#[tokio::test]
async fn exhausted_retries_are_a_terminal_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/signals"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream broken"))
        .expect(2)
        .mount(&server)
        .await;

    let fetcher = SignalFetcher::new(test_config(format!("{}/signals", server.uri()))).unwrap();
    let err = fetcher.fetch_all().await.unwrap_err();

    match err {
        FetchError::RetriesExhausted { attempts, last_error } => {
            assert_eq!(attempts, 2);
            assert!(last_error.contains("500"), "last_error: {last_error}");
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_url_fails_without_requests() {
    let fetcher = SignalFetcher::new(FetchConfig::default()).unwrap();
    let err = fetcher.fetch_all().await.unwrap_err();
    assert!(matches!(err, FetchError::MissingUrl));
}

#[tokio::test]
async fn query_auth_is_sent_as_a_parameter() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/signals"))
        .and(query_param("api_key", "tok"))
        .and(query_param("limit", "200"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let config = FetchConfig {
        api_key: Some("tok".to_string()),
        auth_mode: AuthMode::Query,
        ..test_config(format!("{}/signals", server.uri()))
    };
    let fetcher = SignalFetcher::new(config).unwrap();
    let (signals, _) = fetcher.fetch_all().await.unwrap();
    assert!(signals.is_empty());
}

#[tokio::test]
async fn bearer_auth_is_sent_as_a_header() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/signals"))
        .and(wiremock::matchers::header("Authorization", "Bearer tok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let config = FetchConfig {
        api_key: Some("tok".to_string()),
        ..test_config(format!("{}/signals", server.uri()))
    };
    let fetcher = SignalFetcher::new(config).unwrap();
    fetcher.fetch_all().await.unwrap();
}

#[tokio::test]
async fn file_mode_uses_the_same_parser() {
    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("signals.json");
    std::fs::write(
        &file_path,
        json!({"data": [item("EURUSD"), {"no_symbol": true}]}).to_string(),
    )
    .unwrap();

    let fetcher = SignalFetcher::new(FetchConfig::default()).unwrap();
    let (signals, meta) = fetcher.load_from_file(&file_path).await.unwrap();

    assert_eq!(signals.len(), 1);
    assert_eq!(meta.source, "file");
    assert_eq!(meta.signals_count, 1);

    // A file that is not JSON at all is a terminal error, not zero signals.
    std::fs::write(&file_path, "not json").unwrap();
    let err = fetcher.load_from_file(&file_path).await.unwrap_err();
    assert!(matches!(err, FetchError::InvalidJson { .. }));
}
