//! Safety guards exercised through the tool runtime: path containment, SSRF
//! classification, and command gating, all failing closed with their stable
//! codes.

mod common;

use common::{build_stack, StackOptions};
use moonbot::bus::CancelToken;
use moonbot::errors::ErrorCode;
use moonbot::orchestrator::planner::EchoPlanner;
use moonbot::safety::net::validate_url;
use moonbot::safety::path::contain;
use moonbot::tools::fs::{FsListTool, FsReadTool, FsWriteTool};
use moonbot::tools::http::HttpRequestTool;
use moonbot::tools::InvokeOutcome;
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;

fn stack() -> common::Stack {
    build_stack(
        Arc::new(EchoPlanner),
        vec![
            Arc::new(FsReadTool),
            Arc::new(FsWriteTool),
            Arc::new(FsListTool),
            Arc::new(HttpRequestTool::new()),
        ],
        StackOptions::default(),
    )
}

async fn invoke(stack: &common::Stack, tool: &str, input: serde_json::Value) -> InvokeOutcome {
    stack
        .runtime
        .invoke(tool, "sess", input, "agent", "user", &CancelToken::new())
        .await
}

fn failure_code(outcome: InvokeOutcome) -> ErrorCode {
    match outcome {
        InvokeOutcome::Failure { error, .. } => error.code,
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn traversal_read_is_invalid_path() {
    let stack = stack();
    let outcome = invoke(&stack, "fs.read", json!({"path": "../etc/passwd"})).await;
    assert_eq!(failure_code(outcome), ErrorCode::InvalidPath);
}

#[tokio::test]
async fn absolute_escape_write_is_invalid_path() {
    let stack = stack();
    let outcome = invoke(
        &stack,
        "fs.write",
        json!({"path": "/etc/cron.d/task", "content": "x"}),
    )
    .await;
    assert_eq!(failure_code(outcome), ErrorCode::InvalidPath);
}

#[tokio::test]
async fn contained_read_round_trips() {
    let stack = stack();
    std::fs::write(stack.workspace.join("hello.txt"), "content").unwrap();
    match invoke(&stack, "fs.read", json!({"path": "hello.txt"})).await {
        InvokeOutcome::Success { data, .. } => assert_eq!(data["content"], "content"),
        other => panic!("expected success, got {:?}", other),
    }
}

#[tokio::test]
async fn fs_list_of_workspace_root() {
    let stack = stack();
    std::fs::write(stack.workspace.join("a.txt"), "").unwrap();
    match invoke(&stack, "fs.list", json!({"path": "."})).await {
        InvokeOutcome::Success { data, .. } => {
            assert!(data["entries"]
                .as_array()
                .unwrap()
                .iter()
                .any(|e| e == "a.txt"));
        }
        other => panic!("expected success, got {:?}", other),
    }
}

#[tokio::test]
async fn metadata_endpoint_is_blocked_without_connecting() {
    let stack = stack();
    let outcome = invoke(
        &stack,
        "http.request",
        json!({"url": "http://169.254.169.254/latest/meta-data/"}),
    )
    .await;
    assert_eq!(failure_code(outcome), ErrorCode::SsrfBlocked);
}

#[tokio::test]
async fn private_ranges_and_schemes_blocked_through_runtime() {
    let stack = stack();
    for (url, code) in [
        ("http://127.0.0.1/", ErrorCode::SsrfBlocked),
        ("http://10.0.0.8/", ErrorCode::SsrfBlocked),
        ("http://192.168.0.1/", ErrorCode::SsrfBlocked),
        ("http://[::1]/", ErrorCode::SsrfBlocked),
        ("ftp://example.com/", ErrorCode::ProtocolNotAllowed),
        ("file:///etc/passwd", ErrorCode::ProtocolNotAllowed),
    ] {
        let outcome = invoke(&stack, "http.request", json!({"url": url})).await;
        assert_eq!(failure_code(outcome), code, "{}", url);
    }
}

#[test]
fn ssrf_matrix_pure() {
    for url in [
        "http://169.254.1.1/",
        "http://172.16.5.5/",
        "http://0.0.0.0/",
        "http://[fe80::1]/",
        "http://[::ffff:192.168.1.1]/",
    ] {
        assert!(validate_url(url).is_err(), "{}", url);
    }
    assert!(validate_url("https://example.com/x").is_ok());
}

proptest! {
    /// Any input that still names a parent directory after normalization, or
    /// that resolves outside the root, must be rejected; accepted paths must
    /// resolve under the root.
    #[test]
    fn containment_never_escapes(segments in prop::collection::vec("[a-z]{1,8}|\\.\\.", 1..6)) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ws");
        std::fs::create_dir_all(&root).unwrap();
        let root_resolved = root.canonicalize().unwrap();
        let input = segments.join("/");

        match contain(&input, &root) {
            Ok(resolved) => {
                prop_assert!(
                    resolved == root_resolved || resolved.starts_with(&root_resolved),
                    "accepted path {} resolved outside root: {}",
                    input,
                    resolved.display()
                );
            }
            Err(err) => {
                prop_assert_eq!(err.code, ErrorCode::InvalidPath);
            }
        }
    }
}
