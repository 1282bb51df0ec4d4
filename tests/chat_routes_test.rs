// ABOUTME: Integration tests for the chat route handlers
// ABOUTME: Tests SSE turn streams, synchronous rejections, rate limiting, and conversation CRUD
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

mod common;
mod helpers;

use std::sync::Arc;

use axum::http::StatusCode;
use common::{create_test_server_resources, ScriptedClient};
use helpers::axum_test::{AxumTestRequest, AxumTestResponse};
use parley_server::{
    config::environment::RateLimitConfig, errors::ErrorCode, server::router,
};
use serde_json::{json, Value};

// ============================================================================
// Test Helpers
// ============================================================================

fn generous_limits() -> RateLimitConfig {
    RateLimitConfig {
        requests_per_window: 100,
        window_seconds: 60,
        token_budget: 1_000_000,
        token_window_seconds: 3600,
        ..RateLimitConfig::default()
    }
}

async fn setup(client: ScriptedClient, limits: RateLimitConfig) -> axum::Router {
    let resources = create_test_server_resources(Arc::new(client), limits).await;
    router(resources)
}

async fn start_turn(app: axum::Router, owner: &str, body: Value) -> AxumTestResponse {
    AxumTestRequest::post("/api/chat/turns")
        .owner(owner)
        .json(&body)
        .send(app)
        .await
}

fn event_types(events: &[Value]) -> Vec<&str> {
    events
        .iter()
        .map(|event| event["type"].as_str().unwrap())
        .collect()
}

// ============================================================================
// Turn streaming
// ============================================================================

#[tokio::test]
async fn test_turn_streams_start_chunks_and_end() {
    let app = setup(
        ScriptedClient::streaming(["Hel", "lo, ", "world"]),
        generous_limits(),
    )
    .await;

    let response = start_turn(app, "alice", json!({ "prompt": "Say hello" })).await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert!(response
        .header("content-type")
        .unwrap()
        .starts_with("text/event-stream"));
    assert_eq!(response.header("x-ratelimit-limit"), Some("100"));

    let events = response.sse_events();
    assert_eq!(event_types(&events), ["start", "chunk", "chunk", "chunk", "end"]);

    let start = &events[0];
    assert_eq!(start["created"], true);
    assert!(start["user_message_id"].is_string());

    assert_eq!(events[3]["accumulated"], "Hello, world");
    assert_eq!(events[3]["sequence"], 3);

    let end = &events[4];
    assert_eq!(end["status"], "complete");
    assert_eq!(end["chunk_count"], 3);
    assert_eq!(end["conversation_id"], start["conversation_id"]);
    assert!(end["assistant_message_id"].is_string());
    assert!(end["token_usage"]["total"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn test_upstream_failure_ends_stream_with_error_event() {
    let app = setup(
        ScriptedClient::streaming(["partial"]).then_fail(ErrorCode::ExternalServiceError, "boom"),
        generous_limits(),
    )
    .await;

    let response = start_turn(app, "alice", json!({ "prompt": "Go" })).await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let events = response.sse_events();
    assert_eq!(event_types(&events), ["start", "chunk", "error"]);
    let error = &events[2];
    assert_eq!(error["code"], "EXTERNAL_SERVICE_ERROR");
    assert_eq!(error["details"]["partial"], true);
    assert_eq!(error["details"]["chunk_count"], 1);
}

#[tokio::test]
async fn test_follow_up_turn_on_existing_conversation() {
    let app = setup(ScriptedClient::streaming(["ok"]), generous_limits()).await;

    let first = start_turn(app.clone(), "alice", json!({ "prompt": "One" })).await;
    let conversation_id = first.sse_events()[0]["conversation_id"].clone();

    let second = start_turn(
        app,
        "alice",
        json!({ "prompt": "Two", "conversationId": conversation_id }),
    )
    .await;
    let events = second.sse_events();
    assert_eq!(events[0]["created"], false);
    assert_eq!(events[0]["conversation_id"], conversation_id);
    assert_eq!(events.last().unwrap()["type"], "end");
}

// ============================================================================
// Synchronous rejections
// ============================================================================

#[tokio::test]
async fn test_empty_prompt_rejected_before_streaming() {
    let app = setup(ScriptedClient::streaming(["never"]), generous_limits()).await;

    let response = start_turn(app, "alice", json!({ "prompt": "" })).await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "INVALID_INPUT");
}

#[tokio::test]
async fn test_out_of_range_config_rejected() {
    let app = setup(ScriptedClient::streaming(["never"]), generous_limits()).await;

    let response = start_turn(
        app,
        "alice",
        json!({ "prompt": "hi", "config": { "topP": 1.5 } }),
    )
    .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "VALUE_OUT_OF_RANGE");
}

#[tokio::test]
async fn test_malformed_body_rejected() {
    let app = setup(ScriptedClient::streaming(["never"]), generous_limits()).await;

    let response = AxumTestRequest::post("/api/chat/turns")
        .owner("alice")
        .raw_json("{not json")
        .send(app)
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "INVALID_INPUT");
}

#[tokio::test]
async fn test_unknown_conversation_is_not_found() {
    let app = setup(ScriptedClient::streaming(["never"]), generous_limits()).await;

    let response = start_turn(
        app,
        "alice",
        json!({ "prompt": "hi", "conversationId": "does-not-exist" }),
    )
    .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "RESOURCE_NOT_FOUND");
}

#[tokio::test]
async fn test_request_window_refusal_is_429_with_retry_after() {
    let limits = RateLimitConfig {
        requests_per_window: 1,
        ..generous_limits()
    };
    let app = setup(ScriptedClient::streaming(["ok"]), limits).await;

    let first = start_turn(app.clone(), "alice", json!({ "prompt": "one" })).await;
    assert_eq!(first.status_code(), StatusCode::OK);

    let second = start_turn(app.clone(), "alice", json!({ "prompt": "two" })).await;
    assert_eq!(second.status_code(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(second.header("x-ratelimit-limit"), Some("1"));
    let retry_after: u64 = second.header("retry-after").unwrap().parse().unwrap();
    assert!(retry_after > 0 && retry_after <= 60);
    let body: Value = second.json();
    assert_eq!(body["error"]["code"], "RATE_LIMIT_EXCEEDED");

    // A different identity has its own window
    let other = start_turn(app, "bob", json!({ "prompt": "three" })).await;
    assert_eq!(other.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn test_rejected_requests_keep_their_request_slot() {
    let limits = RateLimitConfig {
        requests_per_window: 1,
        ..generous_limits()
    };
    let app = setup(ScriptedClient::streaming(["ok"]), limits).await;

    let empty = start_turn(app.clone(), "alice", json!({ "prompt": "" })).await;
    assert_eq!(empty.status_code(), StatusCode::BAD_REQUEST);

    let malformed = AxumTestRequest::post("/api/chat/turns")
        .owner("alice")
        .raw_json("{not json")
        .send(app.clone())
        .await;
    assert_eq!(malformed.status_code(), StatusCode::BAD_REQUEST);

    let missing = start_turn(
        app.clone(),
        "alice",
        json!({ "prompt": "hi", "conversationId": "does-not-exist" }),
    )
    .await;
    assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);

    let bad_generate = AxumTestRequest::post("/api/chat/generate")
        .owner("alice")
        .json(&json!({ "prompt": "hi", "config": { "temperature": 3.0 } }))
        .send(app.clone())
        .await;
    assert_eq!(bad_generate.status_code(), StatusCode::BAD_REQUEST);

    let accepted = start_turn(app.clone(), "alice", json!({ "prompt": "real" })).await;
    assert_eq!(accepted.status_code(), StatusCode::OK);
    assert_eq!(accepted.header("x-ratelimit-remaining"), Some("0"));

    let refused = start_turn(app, "alice", json!({ "prompt": "again" })).await;
    assert_eq!(refused.status_code(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_spent_token_budget_is_429_quota_exceeded() {
    let limits = RateLimitConfig {
        token_budget: 5,
        ..generous_limits()
    };
    let app = setup(ScriptedClient::streaming(["a few words here"]), limits).await;

    let first = start_turn(app.clone(), "alice", json!({ "prompt": "spend it" })).await;
    assert_eq!(first.sse_events().last().unwrap()["type"], "end");

    let second = start_turn(app, "alice", json!({ "prompt": "again" })).await;
    assert_eq!(second.status_code(), StatusCode::TOO_MANY_REQUESTS);
    let body: Value = second.json();
    assert_eq!(body["error"]["code"], "QUOTA_EXCEEDED");
}

// ============================================================================
// One-shot generation
// ============================================================================

#[tokio::test]
async fn test_generate_returns_text_and_usage() {
    let app = setup(ScriptedClient::streaming(["Hello", " there"]), generous_limits()).await;

    let response = AxumTestRequest::post("/api/chat/generate")
        .owner("alice")
        .json(&json!({ "prompt": "greet me" }))
        .send(app)
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let body: Value = response.json();
    assert_eq!(body["text"], "Hello there");
    assert_eq!(body["model"], "scripted-model");
    assert_eq!(
        body["token_usage"]["total"],
        ScriptedClient::exact_count("greet me") + ScriptedClient::exact_count("Hello there")
    );
}

// ============================================================================
// Conversation management
// ============================================================================

#[tokio::test]
async fn test_conversation_crud_over_http() {
    let app = setup(ScriptedClient::streaming(["answer"]), generous_limits()).await;

    let turn = start_turn(app.clone(), "alice", json!({ "prompt": "Plan my week" })).await;
    let conversation_id = turn.sse_events()[0]["conversation_id"]
        .as_str()
        .unwrap()
        .to_owned();
    let path = format!("/api/chat/conversations/{conversation_id}");

    let listed: Value = AxumTestRequest::get("/api/chat/conversations")
        .owner("alice")
        .send(app.clone())
        .await
        .json();
    assert_eq!(listed["total"], 1);
    assert_eq!(listed["conversations"][0]["title"], "Plan my week");

    let detail = AxumTestRequest::get(&path).owner("alice").send(app.clone()).await;
    assert_eq!(detail.status_code(), StatusCode::OK);
    let detail: Value = detail.json();
    assert_eq!(detail["messages"].as_array().unwrap().len(), 2);
    assert_eq!(detail["messages"][1]["content"], "answer");

    let hidden = AxumTestRequest::get(&path).owner("mallory").send(app.clone()).await;
    assert_eq!(hidden.status_code(), StatusCode::NOT_FOUND);

    let patched = AxumTestRequest::patch(&path)
        .owner("alice")
        .json(&json!({ "title": "Weekly plan", "pinned": true, "tags": ["Plans"] }))
        .send(app.clone())
        .await;
    assert_eq!(patched.status_code(), StatusCode::OK);
    let patched: Value = patched.json();
    assert_eq!(patched["title"], "Weekly plan");
    assert_eq!(patched["pinned"], true);
    assert_eq!(patched["tags"], json!(["plans"]));

    let blank = AxumTestRequest::patch(&path)
        .owner("alice")
        .json(&json!({ "title": "  " }))
        .send(app.clone())
        .await;
    assert_eq!(blank.status_code(), StatusCode::BAD_REQUEST);

    let deleted = AxumTestRequest::delete(&path).owner("alice").send(app.clone()).await;
    assert_eq!(deleted.status_code(), StatusCode::NO_CONTENT);

    let gone = AxumTestRequest::delete(&path).owner("alice").send(app).await;
    assert_eq!(gone.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_long_owner_ids_keep_conversations_separate() {
    let app = setup(ScriptedClient::streaming(["noted"]), generous_limits()).await;
    let owner = "a".repeat(128);
    let other = "m".repeat(128);

    let turn = start_turn(app.clone(), &owner, json!({ "prompt": "my private note" })).await;
    let conversation_id = turn.sse_events()[0]["conversation_id"]
        .as_str()
        .unwrap()
        .to_owned();

    let listed: Value = AxumTestRequest::get("/api/chat/conversations")
        .owner(&other)
        .send(app.clone())
        .await
        .json();
    assert_eq!(listed["total"], 0);

    let path = format!("/api/chat/conversations/{conversation_id}");
    let hidden = AxumTestRequest::get(&path).owner(&other).send(app.clone()).await;
    assert_eq!(hidden.status_code(), StatusCode::NOT_FOUND);

    let anonymous: Value = AxumTestRequest::get("/api/chat/conversations")
        .send(app.clone())
        .await
        .json();
    assert_eq!(anonymous["total"], 0);

    let own: Value = AxumTestRequest::get("/api/chat/conversations")
        .owner(&owner)
        .send(app)
        .await
        .json();
    assert_eq!(own["total"], 1);
}

#[tokio::test]
async fn test_oversized_owner_id_is_rejected() {
    let app = setup(ScriptedClient::streaming(["never"]), generous_limits()).await;
    let oversized = "a".repeat(129);

    let turn = start_turn(app.clone(), &oversized, json!({ "prompt": "hello" })).await;
    assert_eq!(turn.status_code(), StatusCode::BAD_REQUEST);
    let body: Value = turn.json();
    assert_eq!(body["error"]["code"], "INVALID_INPUT");

    let listed = AxumTestRequest::get("/api/chat/conversations")
        .owner(&oversized)
        .send(app.clone())
        .await;
    assert_eq!(listed.status_code(), StatusCode::BAD_REQUEST);

    // Nothing was created under any scope
    let anonymous: Value = AxumTestRequest::get("/api/chat/conversations")
        .send(app)
        .await
        .json();
    assert_eq!(anonymous["total"], 0);
}

#[tokio::test]
async fn test_anonymous_callers_share_conversations() {
    let app = setup(ScriptedClient::streaming(["hi"]), generous_limits()).await;

    let turn = AxumTestRequest::post("/api/chat/turns")
        .json(&json!({ "prompt": "anyone" }))
        .send(app.clone())
        .await;
    assert_eq!(turn.status_code(), StatusCode::OK);

    let listed: Value = AxumTestRequest::get("/api/chat/conversations")
        .send(app)
        .await
        .json();
    assert_eq!(listed["total"], 1);
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn test_health_reports_degradation_level() {
    let app = setup(ScriptedClient::streaming(["-"]), generous_limits()).await;

    let response = AxumTestRequest::get("/health").send(app).await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["degradation"], "normal");
    assert_eq!(body["ceiling_factor"], 1.0);
}
