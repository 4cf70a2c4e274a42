use axum::http::StatusCode;
use http_body_util::BodyExt;
use serde_json::json;
use tempfile::TempDir;
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Stand-in agent: drains the prompt, then reports the story named in
/// `RALPH_STORY_ID` (a version-scoped id such as `v1:1.1.1`) as complete.
/// Story 1.1.3 always reports itself blocked.
const AGENT_SCRIPT: &str = r#"cat > /dev/null
case "$RALPH_STORY_ID" in
  *:1.1.3) echo "<story-blocked>need staging credentials</story-blocked>" ;;
  *) echo "working on $RALPH_STORY_ID"; echo "<story-complete>$RALPH_STORY_ID</story-complete>" ;;
esac"#;

/// Bootstrap a Ralph project with VCS disabled, the stand-in agent and a
/// three-story PRD in version `v1`.
fn init_project(dir: &TempDir) {
    let mut config = ralph_core::config::Config::new("test-project");
    config.vcs.enabled = false;
    config.agent.command = "sh".into();
    config.agent.args = vec!["-c".into(), AGENT_SCRIPT.into()];
    config.execution.claude_timeout_secs = 30;
    config.save(dir.path()).unwrap();

    let store = ralph_core::Store::open_project(dir.path()).unwrap();
    let doc: ralph_core::prd::PrdDocument = serde_json::from_value(json!({
        "version": "v1",
        "title": "First release",
        "stories": [
            {
                "id": "1.1.1",
                "title": "Add login endpoint",
                "description": "POST /login returns a session token for valid credentials.",
                "acceptance": ["returns 200 with a token", "returns 401 for a bad password"]
            },
            {
                "id": "1.1.2",
                "title": "Add logout endpoint",
                "acceptance": []
            },
            {
                "id": "1.1.3",
                "title": "Deploy to staging",
                "description": "Ship the build to the staging cluster.",
                "acceptance": ["staging serves the new build"]
            }
        ]
    }))
    .unwrap();
    store.import_prd(doc).unwrap();
}

fn app(dir: &TempDir) -> axum::Router {
    ralph_server::build_router(dir.path().to_path_buf()).unwrap()
}

async fn send(
    app: axum::Router,
    req: axum::http::Request<axum::body::Body>,
) -> (StatusCode, serde_json::Value) {
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// Send a GET request via `oneshot` and return (status, parsed JSON body).
async fn get(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    send(app, req).await
}

/// Send a request with a JSON body via `oneshot` and return (status, parsed JSON body).
async fn with_json(
    app: axum::Router,
    method: &str,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    send(app, req).await
}

async fn post_json(
    app: axum::Router,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    with_json(app, "POST", uri, body).await
}

async fn put_json(
    app: axum::Router,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    with_json(app, "PUT", uri, body).await
}

/// POST a raw body, bypassing JSON serialization.
async fn post_raw(
    app: axum::Router,
    uri: &str,
    content_type: Option<&str>,
    body: &'static str,
) -> (StatusCode, serde_json::Value) {
    let mut req = axum::http::Request::builder().method("POST").uri(uri);
    if let Some(content_type) = content_type {
        req = req.header("content-type", content_type);
    }
    send(app, req.body(axum::body::Body::from(body)).unwrap()).await
}

fn assert_json_error(status: StatusCode, body: &serde_json::Value) {
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
    assert!(body["error"].is_string(), "expected a JSON error body, got {body}");
}

// ---------------------------------------------------------------------------
// State and PRD
// ---------------------------------------------------------------------------

#[test]
fn uninitialized_root_fails_to_build() {
    let dir = TempDir::new().unwrap();
    assert!(ralph_server::build_router(dir.path().to_path_buf()).is_err());
}

#[tokio::test]
async fn state_starts_idle() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let (status, body) = get(app(&dir), "/api/state").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "idle");
    assert!(body["current_story"].is_null());
}

#[tokio::test]
async fn versions_and_prd() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let (status, body) = get(app(&dir), "/api/versions").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["id"], "v1");
    assert_eq!(body[0]["progress"]["total"], 3);

    let (status, body) = get(app(&dir), "/api/prd?version=v1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stories"].as_array().unwrap().len(), 3);

    let (status, _) = get(app(&dir), "/api/prd?version=v9").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn import_then_update_stories() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let (status, body) = post_json(
        app(&dir),
        "/api/prd",
        json!({
            "version": "v2",
            "stories": [{ "id": "2.1.1", "title": "Billing page", "dependsOn": ["v1:1.1.1"] }]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["created"], json!(["v2:2.1.1"]));

    let (status, body) = put_json(
        app(&dir),
        "/api/prd",
        json!({ "id": "2.1.1", "priority": 2, "tags": ["billing"] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stories"][0]["priority"], 2);

    let (status, body) = put_json(
        app(&dir),
        "/api/prd",
        json!({ "stories": [
            { "id": "1.1.2", "description": "Clears the session." },
            { "id": "1.1.3", "skipped": true, "skipReason": "not this release" }
        ]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stories"].as_array().unwrap().len(), 2);
    assert_eq!(body["stories"][1]["skipped"], true);

    let (status, _) =
        put_json(app(&dir), "/api/prd", json!({ "id": "9.9.9", "priority": 1 })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn versions_reuse_story_numbers() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let (status, body) = post_json(
        app(&dir),
        "/api/prd",
        json!({
            "version": "v2",
            "stories": [{ "id": "1.1.1", "title": "Invite teammates" }]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["created"], json!(["v2:1.1.1"]));

    let (_, body) = get(app(&dir), "/api/story/v1:1.1.1").await;
    assert_eq!(body["story"]["title"], "Add login endpoint");
    // Bare ids resolve to the newest version when nothing is running.
    let (_, body) = get(app(&dir), "/api/story/1.1.1").await;
    assert_eq!(body["story"]["title"], "Invite teammates");

    let (status, body) = put_json(
        app(&dir),
        "/api/prd",
        json!({ "version": "v1", "stories": [{ "id": "1.1.1", "priority": 3 }] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["stories"][0]["id"], "v1:1.1.1");
    assert_eq!(body["stories"][0]["priority"], 3);

    let (status, _) = put_json(
        app(&dir),
        "/api/prd",
        json!({ "id": "1.1.2", "version": "v2", "priority": 1 }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn import_rejects_mismatched_version_prefix() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let (status, body) = post_json(
        app(&dir),
        "/api/prd",
        json!({
            "version": "v2",
            "stories": [{ "id": "v1:3.1.1", "title": "Wrong release" }]
        }),
    )
    .await;
    assert_json_error(status, &body);
    assert!(body["error"].as_str().unwrap().contains("v1"));
}

#[tokio::test]
async fn alignment_skips_removed_stories() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let (status, body) = put_json(
        app(&dir),
        "/api/prd/align",
        json!({
            "version": "v1",
            "modifications": [{ "storyId": "1.1.2", "suggested_intent": "Let users end a session" }],
            "newStories": [{
                "phase": 1,
                "epic": 1,
                "title": "Password reset",
                "acceptance": ["email is sent"]
            }],
            "removals": ["1.1.3"]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["summary"], json!({ "applied": 1, "added": 1, "removed": 1 }));
    let removed = body["stories"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["id"] == "v1:1.1.3")
        .unwrap();
    assert_eq!(removed["skipped"], true);
}

#[tokio::test]
async fn story_detail_and_not_found() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let (status, body) = get(app(&dir), "/api/story/1.1.1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["story"]["title"], "Add login endpoint");
    assert_eq!(body["status"], "pending");
    assert_eq!(body["handoffs"]["phase"], "idle");
    assert_eq!(body["checkpoints"], json!([]));

    let (status, body) = get(app(&dir), "/api/story/STORY-4.4.4").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("4.4.4"));
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_requires_known_action() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let (status, _) = post_json(app(&dir), "/api/run", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, body) = post_json(app(&dir), "/api/run", json!({ "action": "launch" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("launch"));
}

#[tokio::test]
async fn malformed_json_is_a_json_400() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    for uri in ["/api/run", "/api/signal", "/api/handoffs", "/api/prd", "/api/tasks"] {
        let (status, body) =
            post_raw(app(&dir), uri, Some("application/json"), r#"{"action":"#).await;
        assert_json_error(status, &body);
    }

    let (status, body) = post_raw(
        app(&dir),
        "/api/run",
        None,
        r#"{"action":"start"}"#,
    )
    .await;
    assert_json_error(status, &body);
}

#[tokio::test]
async fn mistyped_fields_are_a_json_400() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let (status, body) = post_json(
        app(&dir),
        "/api/run",
        json!({ "action": "start", "config": { "maxIterations": "lots" } }),
    )
    .await;
    assert_json_error(status, &body);

    let (status, body) = post_json(
        app(&dir),
        "/api/prd",
        json!({ "version": "v2", "stories": "none yet" }),
    )
    .await;
    assert_json_error(status, &body);

    let (status, body) = put_json(app(&dir), "/api/prd", json!({ "id": 7 })).await;
    assert_json_error(status, &body);

    // Nothing ran.
    let (_, body) = get(app(&dir), "/api/run").await;
    assert_eq!(body["state"]["status"], "idle");
}

#[tokio::test]
async fn get_run_shows_next_story() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let (status, body) = get(app(&dir), "/api/run").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], "v1");
    assert_eq!(body["state"]["status"], "idle");
    assert!(body["nextStory"]["id"].is_string());
    assert_eq!(body["scoredStories"].as_array().unwrap().len(), 3);
    assert!(body["gate"].is_null());
}

#[tokio::test]
async fn run_completes_a_story_without_vcs() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let (status, body) = post_json(
        app(&dir),
        "/api/run",
        json!({ "action": "start", "version": "v1", "config": { "singleStoryId": "1.1.1" } }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["halt"], "story_complete");
    assert_eq!(body["completed"], json!(["v1:1.1.1"]));
    assert_eq!(body["state"]["last_completed"], "v1:1.1.1");
    assert_eq!(body["state"]["status"], "idle");
    assert_eq!(body["progress"]["merged"], 1);

    let (_, story) = get(app(&dir), "/api/story/1.1.1").await;
    assert_eq!(story["story"]["passes"], true);
    assert_eq!(story["story"]["merged"], true);
    assert_eq!(story["executionLog"][0]["status"], "complete");
    // Checkpoints are dropped once the story is done.
    assert_eq!(story["checkpoints"], json!([]));

    let (_, metrics) = get(app(&dir), "/api/metrics").await;
    assert_eq!(metrics["runs"], 1);
    assert_eq!(metrics["completed"], 1);
}

#[tokio::test]
async fn validation_gate_holds_then_proceeds() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let only_1_1_2 = json!({ "singleStoryId": "1.1.2" });

    let (status, body) = post_json(
        app(&dir),
        "/api/run",
        json!({ "action": "start", "config": only_1_1_2 }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["halt"], "waiting_gate");
    assert_eq!(body["gate"]["type"], "validation");
    assert_eq!(body["gate"]["storyId"], "v1:1.1.2");
    assert!(!body["gate"]["questions"].as_array().unwrap().is_empty());
    assert_eq!(body["state"]["status"], "waiting_gate");

    // Asking again without an answer returns the same gate.
    let (_, body) = get(app(&dir), "/api/run").await;
    assert_eq!(body["gate"]["type"], "validation");

    // An answer for the wrong gate is rejected.
    let (status, _) = post_json(
        app(&dir),
        "/api/run",
        json!({
            "action": "continue",
            "gateResponse": { "type": "pr_review", "response": { "action": "merge" } }
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = post_json(
        app(&dir),
        "/api/run",
        json!({
            "action": "continue",
            "config": only_1_1_2,
            "gateResponse": {
                "type": "validation",
                "response": { "action": "clarify", "clarification": "Logout clears the cookie." }
            }
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["halt"], "story_complete");
    assert_eq!(body["completed"], json!(["v1:1.1.2"]));
}

#[tokio::test]
async fn blocked_agent_then_skip() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let only_1_1_3 = json!({ "singleStoryId": "1.1.3" });

    let (status, body) = post_json(
        app(&dir),
        "/api/run",
        json!({ "action": "start", "config": only_1_1_3 }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["halt"], "blocked");
    assert_eq!(body["gate"]["type"], "blocked");
    assert!(body["gate"]["message"]
        .as_str()
        .unwrap()
        .contains("need staging credentials"));
    assert_eq!(body["state"]["status"], "blocked");
    assert_eq!(body["state"]["failure_count"], 1);

    let (status, body) = post_json(
        app(&dir),
        "/api/run",
        json!({
            "action": "continue",
            "config": only_1_1_3,
            "gateResponse": { "response": { "action": "skip" } }
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["skipped"], json!(["v1:1.1.3"]));
    assert_eq!(body["halt"], "complete");

    let (_, story) = get(app(&dir), "/api/story/1.1.3").await;
    assert_eq!(story["story"]["skipped"], true);
    assert_eq!(story["status"], "skipped");
}

#[tokio::test]
async fn gate_response_without_gate_is_rejected() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let (status, body) = post_json(
        app(&dir),
        "/api/run",
        json!({
            "action": "start",
            "gateResponse": { "type": "validation", "response": { "action": "proceed" } }
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("gateResponse"));
}

#[tokio::test]
async fn stop_and_reset() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let (status, body) = post_json(app(&dir), "/api/run", json!({ "action": "stop" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"]["status"], "idle");

    let (status, body) = post_json(app(&dir), "/api/run", json!({ "action": "reset" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["action"], "reset");
    assert_eq!(body["timedOutHandoffs"], 0);
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

#[tokio::test]
async fn signal_complete_marks_story_passed() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let (status, body) = post_json(
        app(&dir),
        "/api/signal",
        json!({ "storyId": "1.1.1", "action": "complete", "prUrl": "https://example.com/pr/3" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["changed"], true);
    assert_eq!(body["story"]["passes"], true);

    let (status, body) = get(app(&dir), "/api/signal?storyId=1.1.1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "passed");
    assert_eq!(body["prUrl"], "https://example.com/pr/3");
}

#[tokio::test]
async fn signal_progress_changes_nothing() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let (status, body) = post_json(
        app(&dir),
        "/api/signal",
        json!({ "storyId": "1.1.1", "action": "progress", "message": "tests passing" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["changed"], false);
    assert_eq!(body["story"]["passes"], false);
}

#[tokio::test]
async fn signal_validation_errors() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let (status, _) = post_json(app(&dir), "/api/signal", json!({ "action": "complete" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = post_json(
        app(&dir),
        "/api/signal",
        json!({ "storyId": "1.1.1", "action": "finished" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = post_json(
        app(&dir),
        "/api/signal",
        json!({ "storyId": "7.7.7", "action": "complete" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Handoffs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn handoff_lifecycle() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let create = json!({
        "action": "create",
        "storyId": "1.1.1",
        "fromAgent": "implementer",
        "toAgent": "reviewer",
        "payload": { "branch": "feat/story-1.1.1" }
    });
    let (status, body) = post_json(app(&dir), "/api/handoffs", create.clone()).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let first = body["handoff"]["id"].as_i64().unwrap();
    assert_eq!(body["handoff"]["status"], "pending");

    // A second pending handoff to the same agent conflicts.
    let (status, body) = post_json(app(&dir), "/api/handoffs", create).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["existing"]["id"], first);

    let (status, body) = get(app(&dir), "/api/handoffs?storyId=1.1.1&agent=reviewer").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], first);

    let (status, body) = post_json(
        app(&dir),
        "/api/handoffs",
        json!({
            "action": "reject",
            "handoffId": first,
            "reason": "missing tests",
            "return": true
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["handoff"]["status"], "rejected");
    assert_eq!(body["returned"]["to_agent"], "implementer");
    let returned = body["returned"]["id"].as_i64().unwrap();

    let (status, body) = post_json(
        app(&dir),
        "/api/handoffs",
        json!({ "action": "accept", "handoffId": returned }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["handoff"]["status"], "accepted");

    let (status, body) = get(app(&dir), "/api/handoffs?storyId=1.1.1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["handoffs"].as_array().unwrap().len(), 2);
    assert!(body["pending"].is_null());
}

#[tokio::test]
async fn handoff_validation_errors() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let (status, _) = post_json(app(&dir), "/api/handoffs", json!({ "action": "pass" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_json(
        app(&dir),
        "/api/handoffs",
        json!({
            "action": "create",
            "storyId": "1.1.1",
            "fromAgent": "analyst",
            "toAgent": "documenter"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_json(
        app(&dir),
        "/api/handoffs",
        json!({ "action": "accept", "handoffId": 999 }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = get(app(&dir), "/api/handoffs").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn task_queue_endpoints() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let (status, body) = post_json(
        app(&dir),
        "/api/prd/generate",
        json!({ "version": "v1", "description": "Add audit logging" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["task"]["type"], "generate");
    assert_eq!(body["task"]["version"], "v1");
    let id = body["task"]["id"].as_str().unwrap().to_string();

    let (status, body) = get(app(&dir), &format!("/api/tasks/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["params"]["description"], "Add audit logging");

    let (status, body) = get(app(&dir), "/api/tasks?type=generate").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tasks"].as_array().unwrap().len(), 1);

    let (status, body) = with_json(
        app(&dir),
        "PATCH",
        &format!("/api/tasks/{id}"),
        json!({ "action": "read" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["read_at"].is_string());

    let (status, _) = with_json(
        app(&dir),
        "PATCH",
        &format!("/api/tasks/{id}"),
        json!({ "action": "archive" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = post_json(app(&dir), "/api/tasks/read-all", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["updated"].is_number());

    let req = axum::http::Request::builder()
        .method("DELETE")
        .uri(format!("/api/tasks/{id}"))
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, body) = send(app(&dir), req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], true);

    let (status, _) = get(app(&dir), &format!("/api/tasks/{id}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn task_params_are_validated() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let (status, _) = post_json(app(&dir), "/api/prd/generate", json!({ "version": "v1" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_json(
        app(&dir),
        "/api/tasks",
        json!({ "type": "summarize", "version": "v1" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Story edits take their version from the story.
    let (status, body) = post_json(
        app(&dir),
        "/api/prd/refine/edit",
        json!({ "storyId": "1.1.2", "requestedChanges": "Split into two stories" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["task"]["type"], "story-edit");
    assert_eq!(body["task"]["version"], "v1");
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn events_is_an_sse_stream() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let req = axum::http::Request::builder()
        .uri("/api/events")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app(&dir).oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(content_type.starts_with("text/event-stream"));

    // The first frame is the current run state.
    let mut body = response.into_body();
    let frame = body.frame().await.unwrap().unwrap();
    let text = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();
    assert!(text.starts_with("data: "));
    assert!(text.contains(r#""type":"run_state""#));
}
