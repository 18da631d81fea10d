use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

/// Environment options that would override the test config.
const ENV_OVERRIDES: &[&str] = &[
    "WATCH_PATHS",
    "GIT_WATCH_PATHS",
    "EXCLUDE_PATTERNS",
    "DEBOUNCE_SEC",
    "EVENT_DB",
    "VECTOR_DB",
    "GIT_AUTO_DISCOVER",
    "LLM_BACKEND",
];

fn amem_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("amem");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("files")).unwrap();

    let config_content = format!(
        r#"[db]
events = "{root}/data/events.db"
vectors = "{root}/data/vectors.db"

[watch]
paths = ["{root}/files"]
debounce_secs = 0.2

[git]
repos = ["{root}/repo"]

[embedding]
provider = "hash"
dims = 128

[retrieval]
top_k = 3

[llm]
provider = "stub"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("amem.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_amem(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = amem_binary();
    let mut cmd = Command::new(&binary);
    for var in ENV_OVERRIDES {
        cmd.env_remove(var);
    }
    let output = cmd
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run amem binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn run_git(dir: &Path, args: &[&str]) -> Output {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run git {:?}: {}", args, e));
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    output
}

fn create_test_git_repo(root: &Path, messages: &[&str]) -> PathBuf {
    let repo = root.join("repo");
    fs::create_dir_all(&repo).unwrap();
    run_git(&repo, &["init", "-b", "main"]);
    run_git(&repo, &["config", "user.email", "test@test.com"]);
    run_git(&repo, &["config", "user.name", "Test"]);
    for (i, message) in messages.iter().enumerate() {
        fs::write(repo.join("log.txt"), format!("entry {}\n", i)).unwrap();
        run_git(&repo, &["add", "."]);
        run_git(&repo, &["commit", "-m", message]);
    }
    repo
}

#[test]
fn test_init_creates_databases() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_amem(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/events.db").exists());
    assert!(tmp.path().join("data/vectors.db").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_amem(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_amem(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_invalid_config_is_rejected() {
    let (_tmp, config_path) = setup_test_env();
    let content = fs::read_to_string(&config_path).unwrap();
    fs::write(
        &config_path,
        content.replace("debounce_secs = 0.2", "debounce_secs = 0"),
    )
    .unwrap();

    let (_, stderr, success) = run_amem(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("debounce_secs"), "stderr={}", stderr);
}

#[test]
fn test_events_empty() {
    let (_tmp, config_path) = setup_test_env();
    run_amem(&config_path, &["init"]);

    let (stdout, stderr, success) = run_amem(&config_path, &["events"]);
    assert!(success, "events failed: {}", stderr);
    assert!(stdout.contains("No events."));
}

#[test]
fn test_poll_git_records_commits_once() {
    let (tmp, config_path) = setup_test_env();
    create_test_git_repo(tmp.path(), &["Add parser", "Fix tokenizer", "Write docs"]);
    run_amem(&config_path, &["init"]);

    let (stdout, stderr, success) = run_amem(&config_path, &["poll-git"]);
    assert!(success, "poll-git failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("3 new commits"), "stdout={}", stdout);

    // A second process resumes from the last recorded commit
    let (stdout, _, success) = run_amem(&config_path, &["poll-git"]);
    assert!(success);
    assert!(stdout.contains("0 new commits"), "stdout={}", stdout);
    assert!(stdout.contains("0 already recorded"), "stdout={}", stdout);

    let (stdout, _, success) = run_amem(&config_path, &["events", "--kind", "COMMIT"]);
    assert!(success);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 3, "stdout={}", stdout);
    assert!(lines[0].contains("Add parser"));
    assert!(lines[1].contains("Fix tokenizer"));
    assert!(lines[2].contains("Write docs"));
}

#[test]
fn test_events_json_output() {
    let (tmp, config_path) = setup_test_env();
    create_test_git_repo(tmp.path(), &["Only commit"]);
    run_amem(&config_path, &["init"]);
    run_amem(&config_path, &["poll-git"]);

    let (stdout, stderr, success) = run_amem(&config_path, &["events", "--json"]);
    assert!(success, "events --json failed: {}", stderr);
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let events = parsed.as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["kind"], "COMMIT");
    assert_eq!(events[0]["detail"], "Only commit");
}

#[test]
fn test_events_rejects_unknown_kind() {
    let (_tmp, config_path) = setup_test_env();
    run_amem(&config_path, &["init"]);

    let (_, _, success) = run_amem(&config_path, &["events", "--kind", "EXPLODED"]);
    assert!(!success);
}

#[test]
fn test_note_index_and_search() {
    let (_tmp, config_path) = setup_test_env();
    run_amem(&config_path, &["init"]);

    let (stdout, stderr, success) = run_amem(
        &config_path,
        &[
            "note",
            "add",
            "--title",
            "release",
            "tag the release after the changelog review",
        ],
    );
    assert!(success, "note add failed: {}", stderr);
    assert!(stdout.contains("Added note 1."));

    let (_, _, success) = run_amem(&config_path, &["note", "add", "   "]);
    assert!(!success, "empty note should be rejected");

    let (stdout, stderr, success) = run_amem(&config_path, &["index"]);
    assert!(success, "index failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Indexed 1 item(s)"), "stdout={}", stdout);

    let (stdout, stderr, success) = run_amem(&config_path, &["search", "changelog review"]);
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.contains("NOTE release: tag the release"), "stdout={}", stdout);
    assert!(stdout.contains("ref: note:1"), "stdout={}", stdout);
}

#[test]
fn test_index_is_idempotent() {
    let (tmp, config_path) = setup_test_env();
    create_test_git_repo(tmp.path(), &["First", "Second"]);
    run_amem(&config_path, &["init"]);
    run_amem(&config_path, &["poll-git"]);

    let (stdout, _, success) = run_amem(&config_path, &["index"]);
    assert!(success);
    assert!(stdout.contains("Indexed 2 item(s); 2 entries"), "stdout={}", stdout);

    let (stdout, _, success) = run_amem(&config_path, &["index"]);
    assert!(success);
    assert!(stdout.contains("Indexed 0 item(s); 2 entries"), "stdout={}", stdout);

    let (stdout, _, success) = run_amem(&config_path, &["index", "--rebuild"]);
    assert!(success);
    assert!(stdout.contains("Indexed 2 item(s); 2 entries"), "stdout={}", stdout);
}

#[test]
fn test_search_filters_by_source() {
    let (tmp, config_path) = setup_test_env();
    create_test_git_repo(tmp.path(), &["Refactor parser"]);
    run_amem(&config_path, &["init"]);
    run_amem(&config_path, &["poll-git"]);
    run_amem(&config_path, &["note", "add", "parser ideas for later"]);
    run_amem(&config_path, &["index"]);

    let (stdout, _, success) = run_amem(&config_path, &["search", "parser", "--source", "git"]);
    assert!(success);
    assert!(stdout.contains("COMMIT"), "stdout={}", stdout);
    assert!(!stdout.contains("NOTE"), "stdout={}", stdout);

    let (stdout, _, success) = run_amem(&config_path, &["search", "parser", "--source", "note"]);
    assert!(success);
    assert!(stdout.contains("NOTE"), "stdout={}", stdout);
    assert!(!stdout.contains("COMMIT"), "stdout={}", stdout);
}

#[test]
fn test_ask_with_stub_generator() {
    let (tmp, config_path) = setup_test_env();
    create_test_git_repo(tmp.path(), &["Fix flaky login test", "Bump version"]);
    run_amem(&config_path, &["init"]);
    run_amem(&config_path, &["poll-git"]);
    run_amem(&config_path, &["index"]);

    let (stdout, stderr, success) = run_amem(
        &config_path,
        &["ask", "what did I fix?", "--today", "--show-prompt"],
    );
    assert!(success, "ask failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("[stub] 2 context item(s)"), "stdout={}", stdout);
    assert!(stderr.contains("QUESTION:\nwhat did I fix?"), "stderr={}", stderr);
    assert!(stderr.contains("Fix flaky login test"), "stderr={}", stderr);
}

#[test]
fn test_ask_with_empty_memory() {
    let (_tmp, config_path) = setup_test_env();
    run_amem(&config_path, &["init"]);

    let (stdout, stderr, success) = run_amem(&config_path, &["ask", "anything?", "--show-prompt"]);
    assert!(success, "ask failed: {}", stderr);
    assert!(stdout.contains("[stub] 0 context item(s)"));
    assert!(stderr.contains("(no matching activity recorded)"));
}

#[test]
fn test_status_reports_backlog() {
    let (tmp, config_path) = setup_test_env();
    create_test_git_repo(tmp.path(), &["One", "Two"]);
    run_amem(&config_path, &["init"]);

    let (stdout, _, success) = run_amem(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("indexer:        never run"), "stdout={}", stdout);

    run_amem(&config_path, &["poll-git"]);
    let (stdout, _, success) = run_amem(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("events:         2"), "stdout={}", stdout);
    assert!(stdout.contains("(2 pending)"), "stdout={}", stdout);

    run_amem(&config_path, &["index"]);
    let (stdout, _, success) = run_amem(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("(0 pending)"), "stdout={}", stdout);
    assert!(stdout.contains("indexer:        IDLE"), "stdout={}", stdout);
}

#[test]
fn test_completions_without_config() {
    let output = Command::new(amem_binary())
        .args(["--config", "/nonexistent/amem.toml", "completions", "bash"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("amem"));
}
