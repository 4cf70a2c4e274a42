#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

const AGENT_SCRIPT: &str = r#"cat > /dev/null
case "$RALPH_STORY_ID" in
  *:1.1.3) echo "<story-blocked>need staging credentials</story-blocked>" ;;
  *) echo "<story-complete>$RALPH_STORY_ID</story-complete>" ;;
esac"#;

const PRD: &str = r#"{
  "version": "v1",
  "title": "First release",
  "stories": [
    {
      "id": "1.1.1",
      "title": "Add login endpoint",
      "description": "POST /login returns a session token for valid credentials.",
      "acceptance": ["returns 200 with a token", "returns 401 for a bad password"]
    },
    { "id": "1.1.2", "title": "Add logout endpoint", "dependsOn": ["1.1.1"] },
    {
      "id": "1.1.3",
      "title": "Deploy to staging",
      "description": "Ship the build to the staging cluster.",
      "acceptance": ["staging serves the new build"]
    }
  ]
}"#;

fn ralph(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("ralph").unwrap();
    cmd.current_dir(dir.path()).env("RALPH_ROOT", dir.path());
    cmd.env_remove("RALPH_SIGNAL_URL");
    cmd
}

/// `ralph init`, a mock agent, no git, and the v1 PRD imported.
fn init_project(dir: &TempDir) {
    ralph(dir).arg("init").assert().success();

    let mut config = ralph_core::config::Config::load(dir.path()).unwrap();
    config.vcs.enabled = false;
    config.agent.command = "sh".into();
    config.agent.args = vec!["-c".into(), AGENT_SCRIPT.into()];
    config.execution.claude_timeout_secs = 30;
    config.save(dir.path()).unwrap();

    let prd = dir.path().join("prd.json");
    std::fs::write(&prd, PRD).unwrap();
    ralph(dir).arg("import").arg(&prd).assert().success();
}

fn json_out(cmd: &mut Command) -> Value {
    let output = cmd.arg("--json").output().unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

// ---------------------------------------------------------------------------
// ralph init
// ---------------------------------------------------------------------------

#[test]
fn init_creates_project_files() {
    let dir = TempDir::new().unwrap();
    ralph(&dir)
        .args(["init", "--name", "demo"])
        .assert()
        .success()
        .stdout(predicate::str::contains("created: .ralph/config.yaml"));

    assert!(dir.path().join(".ralph/config.yaml").is_file());
    assert!(dir.path().join(".ralph/ralph.db").is_file());
    assert!(dir.path().join(".ralph/prompt.md").is_file());

    let config = ralph_core::config::Config::load(dir.path()).unwrap();
    assert_eq!(config.project.name, "demo");
    assert_eq!(config.server.port, 3141);
}

#[test]
fn init_is_idempotent() {
    let dir = TempDir::new().unwrap();
    ralph(&dir).arg("init").assert().success();
    std::fs::write(dir.path().join(".ralph/prompt.md"), "custom template").unwrap();

    ralph(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("exists:  .ralph/prompt.md"));

    let prompt = std::fs::read_to_string(dir.path().join(".ralph/prompt.md")).unwrap();
    assert_eq!(prompt, "custom template");
}

#[test]
fn commands_fail_before_init() {
    let dir = TempDir::new().unwrap();
    ralph(&dir)
        .arg("state")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("ralph init"));
}

// ---------------------------------------------------------------------------
// PRD, state, next, story
// ---------------------------------------------------------------------------

#[test]
fn import_then_state_shows_progress() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    ralph(&dir)
        .arg("state")
        .assert()
        .success()
        .stdout(predicate::str::contains("Status:     idle"))
        .stdout(predicate::str::contains("v1"));

    let state = json_out(ralph(&dir).arg("state"));
    assert_eq!(state["state"]["status"], "idle");
    assert_eq!(state["versions"][0]["id"], "v1");
    assert_eq!(state["versions"][0]["progress"]["total"], 3);
}

#[test]
fn import_reads_yaml() {
    let dir = TempDir::new().unwrap();
    ralph(&dir).arg("init").assert().success();
    let prd = dir.path().join("prd.yaml");
    std::fs::write(
        &prd,
        "version: v2\ntitle: Second\nstories:\n  - id: 2.1.1\n    title: Search\n",
    )
    .unwrap();

    ralph(&dir)
        .arg("import")
        .arg(&prd)
        .assert()
        .success()
        .stdout(predicate::str::contains("Imported v2: 1 created, 0 updated"));
}

#[test]
fn import_rejects_missing_file() {
    let dir = TempDir::new().unwrap();
    ralph(&dir).arg("init").assert().success();
    ralph(&dir)
        .args(["import", "nope.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read"));
}

#[test]
fn next_ranks_only_runnable_stories() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let next = json_out(ralph(&dir).args(["next", "--version", "v1"]));
    let ids: Vec<&str> = next["scoredStories"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["story_id"].as_str().unwrap())
        .collect();
    // 1.1.2 waits on 1.1.1.
    assert!(ids.contains(&"v1:1.1.1"));
    assert!(ids.contains(&"v1:1.1.3"));
    assert!(!ids.contains(&"v1:1.1.2"));
}

#[test]
fn story_shows_detail() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    ralph(&dir)
        .args(["story", "1.1.2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Add logout endpoint"))
        .stdout(predicate::str::contains("unmet: 1.1.1"));

    ralph(&dir)
        .args(["story", "9.9.9"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("9.9.9"));
}

// ---------------------------------------------------------------------------
// ralph run
// ---------------------------------------------------------------------------

#[test]
fn run_completes_a_story() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    ralph(&dir)
        .args(["run", "--story", "1.1.1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("story complete"))
        .stdout(predicate::str::contains("completed: v1:1.1.1"));

    let story = json_out(ralph(&dir).args(["story", "1.1.1"]));
    assert_eq!(story["story"]["merged"], true);
    assert_eq!(story["status"], "merged");
}

#[test]
fn run_stops_at_validation_gate_then_resumes() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    ralph(&dir)
        .args(["run", "--story", "1.1.1"])
        .assert()
        .success();

    ralph(&dir)
        .args(["run", "--story", "1.1.2"])
        .assert()
        .code(3)
        .stdout(predicate::str::contains("Gate [validation] on v1:1.1.2"))
        .stderr(predicate::str::contains("waiting at the validation gate"));

    ralph(&dir)
        .args([
            "run",
            "--story",
            "1.1.2",
            "--answer",
            "clarify",
            "-m",
            "Logout clears the session cookie.",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("completed: v1:1.1.2"));
}

#[test]
fn blocked_agent_exits_2_and_skip_clears_it() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let output = ralph(&dir)
        .args(["run", "--story", "1.1.3", "--json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    let report: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["halt"], "blocked");
    assert_eq!(report["gate"]["type"], "blocked");
    assert!(report["gate"]["message"]
        .as_str()
        .unwrap()
        .contains("need staging credentials"));

    // Without an answer the same gate comes back.
    ralph(&dir)
        .args(["run", "--story", "1.1.3"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("1.1.3 is blocked"));

    ralph(&dir)
        .args(["run", "--story", "1.1.3", "--answer", "skip"])
        .assert()
        .success()
        .stdout(predicate::str::contains("skipped:   v1:1.1.3"));

    let story = json_out(ralph(&dir).args(["story", "1.1.3"]));
    assert_eq!(story["status"], "skipped");
}

#[test]
fn blocked_signal_and_tag_count_one_failure() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    // The agent posts a blocked signal and also prints the tag.
    let script = r#"cat > /dev/null
"$RALPH_BIN" signal "$RALPH_STORY_ID" blocked --local -m "need staging credentials" > /dev/null
echo "<story-blocked>need staging credentials</story-blocked>""#;
    let mut config = ralph_core::config::Config::load(dir.path()).unwrap();
    config.agent.args = vec!["-c".into(), script.into()];
    config.save(dir.path()).unwrap();

    let output = ralph(&dir)
        .env("RALPH_BIN", assert_cmd::cargo::cargo_bin("ralph"))
        .args(["run", "--story", "1.1.3", "--json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    let report: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["halt"], "blocked");
    assert_eq!(report["state"]["failure_count"], 1);
    assert_eq!(report["state"]["last_error"], "need staging credentials");
}

#[test]
fn run_rejects_unknown_answer() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    ralph(&dir)
        .args(["run", "--answer", "maybe"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("unknown gate answer"));
}

#[test]
fn reset_returns_to_idle() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    ralph(&dir)
        .args(["run", "--story", "1.1.3"])
        .assert()
        .code(2);

    ralph(&dir)
        .arg("reset")
        .assert()
        .success()
        .stdout(predicate::str::contains("status: idle"));

    let state = json_out(ralph(&dir).arg("state"));
    assert_eq!(state["state"]["status"], "idle");
    assert_eq!(state["state"]["current_story"], Value::Null);
}

// ---------------------------------------------------------------------------
// ralph signal
// ---------------------------------------------------------------------------

#[test]
fn local_signal_marks_story_passed() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    ralph(&dir)
        .args(["signal", "1.1.1", "complete", "--local", "-m", "done"])
        .assert()
        .success()
        .stdout(predicate::str::contains("complete signalled for 1.1.1"));

    let story = json_out(ralph(&dir).args(["story", "1.1.1"]));
    assert_eq!(story["story"]["passes"], true);

    ralph(&dir)
        .args(["signal", "1.1.1", "progress", "--local"])
        .assert()
        .success()
        .stdout(predicate::str::contains("(no change)"));
}

#[test]
fn signal_rejects_unknown_action() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    ralph(&dir)
        .args(["signal", "1.1.1", "finished", "--local"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("finished"));
}

#[test]
fn remote_signal_without_server_fails() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    ralph(&dir)
        .args([
            "signal",
            "1.1.1",
            "complete",
            "--url",
            "http://127.0.0.1:9/api/signal",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to reach"));
}

// ---------------------------------------------------------------------------
// ralph handoff
// ---------------------------------------------------------------------------

#[test]
fn handoff_lifecycle() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let created = json_out(ralph(&dir).args([
        "handoff",
        "create",
        "1.1.1",
        "analyst",
        "implementer",
        "--payload",
        r#"{"plan":"add route"}"#,
    ]));
    let id = created["handoff"]["id"].as_i64().unwrap();
    assert_eq!(created["handoff"]["status"], "pending");

    // A second pending handoff to the same agent conflicts.
    ralph(&dir)
        .args(["handoff", "create", "1.1.1", "analyst", "implementer"])
        .assert()
        .failure();

    ralph(&dir)
        .args(["handoff", "pending", "1.1.1", "implementer"])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("Handoff {id} pending")));

    let rejected = json_out(ralph(&dir).args([
        "handoff",
        "reject",
        id.to_string().as_str(),
        "plan",
        "is",
        "incomplete",
        "--return",
    ]));
    assert_eq!(rejected["handoff"]["status"], "rejected");
    assert_eq!(rejected["handoff"]["rejection_reason"], "plan is incomplete");
    assert_eq!(rejected["returned"]["to_agent"], "analyst");
    let returned = rejected["returned"]["id"].as_i64().unwrap();

    ralph(&dir)
        .args(["handoff", "accept", returned.to_string().as_str()])
        .assert()
        .success()
        .stdout(predicate::str::contains("accepted"));

    ralph(&dir)
        .args(["handoff", "show", "1.1.1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("rejected"))
        .stdout(predicate::str::contains("accepted"));
}

#[test]
fn handoff_rejects_illegal_transition() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    ralph(&dir)
        .args(["handoff", "create", "1.1.1", "analyst", "documenter"])
        .assert()
        .failure();
    ralph(&dir)
        .args(["handoff", "create", "1.1.1", "analyst", "janitor"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("janitor"));
}

// ---------------------------------------------------------------------------
// ralph tasks
// ---------------------------------------------------------------------------

#[test]
fn tasks_queue_and_soft_delete() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let added = json_out(ralph(&dir).args([
        "tasks",
        "add",
        "generate",
        "-p",
        "description=Password reset by email",
    ]));
    let id = added["task"]["id"].as_str().unwrap().to_string();
    assert_eq!(added["task"]["type"], "generate");
    assert_eq!(added["task"]["status"], "queued");
    assert_eq!(added["task"]["version"], "v1");

    let listed = json_out(ralph(&dir).args(["tasks", "list", "--active"]));
    assert_eq!(listed["tasks"].as_array().unwrap().len(), 1);

    ralph(&dir)
        .args(["tasks", "delete", id.as_str()])
        .assert()
        .success()
        .stdout(predicate::str::contains("deleted"));
    let listed = json_out(ralph(&dir).args(["tasks", "list"]));
    assert!(listed["tasks"].as_array().unwrap().is_empty());

    ralph(&dir).args(["tasks", "restore", id.as_str()]).assert().success();
    let shown = json_out(ralph(&dir).args(["tasks", "show", id.as_str()]));
    assert_eq!(shown["deleted_at"], Value::Null);

    ralph(&dir)
        .args(["tasks", "delete", id.as_str(), "--purge"])
        .assert()
        .success();
    ralph(&dir).args(["tasks", "show", id.as_str()]).assert().failure();
}

#[test]
fn tasks_validate_params() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    ralph(&dir)
        .args(["tasks", "add", "generate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("description"));
    ralph(&dir)
        .args(["tasks", "add", "rewrite"])
        .assert()
        .failure();
}

#[test]
fn story_edit_task_uses_the_story_version() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let added = json_out(ralph(&dir).args([
        "tasks",
        "add",
        "story-edit",
        "-p",
        "storyId=1.1.2",
        "-p",
        "requestedChanges=Add acceptance criteria",
    ]));
    assert_eq!(added["task"]["version"], "v1");
    assert_eq!(added["task"]["params"]["storyId"], "1.1.2");
}
