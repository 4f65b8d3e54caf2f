use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use httpmock::MockServer;
use serde_json::json;
use tidecache::transport::{Transport, TransportExt, UploadForm};
use tidecache::{CacheConfig, QueryClient, TransportError};

use crate::args::{Cli, Commands, GetArgs};
use crate::client::{CliError, HttpTransport};

fn transport(server: &MockServer) -> HttpTransport {
    let base = server.base_url().parse().expect("mock base url");
    HttpTransport::new(base, Duration::from_secs(5)).expect("transport")
}

fn get_args(path: &str, concurrency: u32, repeat: u32, stale_ms: Option<u64>) -> GetArgs {
    GetArgs {
        path: path.to_string(),
        query: Vec::new(),
        concurrency,
        repeat,
        stale_ms,
    }
}

#[test]
fn parse_get_arguments() {
    let cli = Cli::parse_from([
        "tidecache",
        "--base-url",
        "http://localhost:8080/api/",
        "get",
        "documents",
        "--query",
        "status=active",
        "--concurrency",
        "4",
        "--repeat",
        "2",
        "--stale-ms",
        "60000",
    ]);

    assert_eq!(
        cli.config.overrides.base_url.as_deref(),
        Some("http://localhost:8080/api/")
    );
    let Commands::Get(args) = cli.command;
    assert_eq!(args.path, "documents");
    assert_eq!(args.query, vec![("status".to_string(), "active".to_string())]);
    assert_eq!(args.concurrency, 4);
    assert_eq!(args.repeat, 2);
    assert_eq!(args.stale_ms, Some(60_000));
}

#[test]
fn malformed_query_pair_is_rejected() {
    let result = Cli::try_parse_from(["tidecache", "get", "documents", "--query", "status"]);
    assert!(result.is_err());
}

#[test]
fn paths_resolve_below_the_base() {
    let transport = HttpTransport::new(
        "https://api.example.test/v1".parse().expect("url"),
        Duration::from_secs(1),
    )
    .expect("transport");

    assert_eq!(
        transport.url("/documents/42").expect("url").as_str(),
        "https://api.example.test/v1/documents/42"
    );
}

#[test]
fn missing_base_url_is_reported() {
    let settings = tidecache::config::HttpSettings {
        base_url: None,
        timeout: Duration::from_secs(1),
    };
    let err = HttpTransport::from_settings(&settings).expect_err("no base url");
    assert!(matches!(err, CliError::MissingBaseUrl));
}

#[tokio::test]
async fn get_sends_query_and_decodes_body() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method("GET")
            .path("/documents")
            .query_param("status", "active");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"[{"id":1}]"#);
    });

    let body = transport(&server)
        .get("documents", &[("status".to_string(), "active".to_string())])
        .await
        .expect("body");

    assert_eq!(body, json!([{"id": 1}]));
    mock.assert();
}

#[tokio::test]
async fn post_sends_json_body() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method("POST")
            .path("/folders")
            .json_body(json!({"name": "Inbox"}));
        then.status(201)
            .header("content-type", "application/json")
            .body(r#"{"id":9,"name":"Inbox"}"#);
    });

    let created: serde_json::Value = transport(&server)
        .post_json("folders", &json!({"name": "Inbox"}))
        .await
        .expect("created");

    assert_eq!(created["id"], 9);
    mock.assert();
}

#[tokio::test]
async fn empty_success_body_is_null() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method("DELETE").path("/documents/42");
        then.status(204);
    });

    let body = transport(&server).delete("documents/42").await.expect("deleted");
    assert!(body.is_null());
    mock.assert();
}

#[tokio::test]
async fn upload_posts_multipart() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method("POST")
            .path("/uploads")
            .header_exists("content-type")
            .body_includes("hello");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"ok":true}"#);
    });

    let form = UploadForm::new()
        .text("folder", "9")
        .file("file", "notes.txt", b"hello".to_vec())
        .content_type("text/plain");
    let body = transport(&server).upload("uploads", form).await.expect("uploaded");

    assert_eq!(body, json!({"ok": true}));
    mock.assert();
}

#[tokio::test]
async fn server_errors_are_normalized() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method("GET").path("/workflows/3");
        then.status(503)
            .header("content-type", "application/json")
            .body(r#"{"message":"maintenance","retry_after":30}"#);
    });

    let err = transport(&server)
        .get("workflows/3", &[])
        .await
        .expect_err("unavailable");

    assert_eq!(err.message(), "maintenance");
    assert!(err.is_retryable());
    assert!(matches!(err, TransportError::Server { status: 503, .. }));
    assert_eq!(
        err.details(),
        Some(json!({"message": "maintenance", "retry_after": 30}))
    );
}

#[tokio::test]
async fn not_found_is_not_retryable() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method("GET").path("/documents/404");
        then.status(404).body("no such document");
    });

    let err = transport(&server)
        .get("documents/404", &[])
        .await
        .expect_err("missing");

    assert_eq!(err.message(), "no such document");
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn validation_errors_carry_fields() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method("PATCH").path("/documents/42");
        then.status(422)
            .header("content-type", "application/json")
            .body(r#"{"message":"invalid document","errors":{"name":["is required"]}}"#);
    });

    let err = transport(&server)
        .patch("documents/42", json!({"name": ""}))
        .await
        .expect_err("invalid");

    assert!(matches!(err, TransportError::Validation { .. }));
    assert_eq!(err.message(), "invalid document");
    assert_eq!(err.details(), Some(json!({"name": ["is required"]})));
}

#[tokio::test]
async fn malformed_body_is_a_decode_error() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method("GET").path("/notifications");
        then.status(200).body("<html>");
    });

    let err = transport(&server)
        .get("notifications", &[])
        .await
        .expect_err("not json");
    assert!(matches!(err, TransportError::Decode { .. }));
}

#[tokio::test]
async fn timeouts_are_retryable_network_errors() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method("GET").path("/slow");
        then.status(200).body("{}").delay(Duration::from_millis(500));
    });

    let base = server.base_url().parse().expect("mock base url");
    let transport = HttpTransport::new(base, Duration::from_millis(50)).expect("transport");
    let err = transport.get("slow", &[]).await.expect_err("timed out");

    assert!(matches!(err, TransportError::Network { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn concurrent_rounds_share_requests() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method("GET").path("/documents/42");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"id":42,"name":"A"}"#)
            .delay(Duration::from_millis(50));
    });

    let client = QueryClient::new(CacheConfig::default());
    let transport: Arc<dyn Transport> = Arc::new(transport(&server));

    let report = crate::get::run(&client, transport, &get_args("documents/42", 4, 3, Some(60_000)))
        .await
        .expect("report");

    assert_eq!(report.reads, 12);
    assert_eq!(report.network_calls, 1);
    assert_eq!(*report.body, json!({"id": 42, "name": "A"}));
    assert_eq!(report.summary(), "reads: 12, network calls: 1");
    mock.assert_calls(1);
}

#[tokio::test]
async fn stale_bodies_are_refetched_each_round() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method("GET").path("/notifications");
        then.status(200)
            .header("content-type", "application/json")
            .body("[]");
    });

    let client = QueryClient::new(CacheConfig::default());
    let transport: Arc<dyn Transport> = Arc::new(transport(&server));

    let report = crate::get::run(&client, transport, &get_args("notifications", 1, 3, Some(0)))
        .await
        .expect("report");

    assert_eq!(report.network_calls, 3);
    mock.assert_calls(3);
}
