use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn dax_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("dax");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    fs::write(
        root.join("data/tickets.json"),
        r#"{"tickets": [
            {"key": "TK-1", "summary": "Fix login bug", "description": "SSO redirect loops forever"},
            {"key": "TK-2", "summary": "Add dark mode", "description": "Theme toggle in settings"}
        ]}"#,
    )
    .unwrap();
    fs::write(
        root.join("data/commits.json"),
        r#"{"commits": [
            {"sha": "9f2c4e1a", "message": "feat: cache parsed configs", "author": {"name": "Ana", "email": "ana@example.com"}}
        ]}"#,
    )
    .unwrap();

    let config_content = format!(
        r#"[index]
dir = "{root}/data/indexes"

[embedding]
provider = "hash"
dims = 1024

[generation]
provider = "echo"

[chat]
sessions_dir = "{root}/data/sessions"

[tools]
config = "{root}/tools.json"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("dax.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_dax(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = dax_binary();
    let workdir = config_path.parent().unwrap().parent().unwrap();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .current_dir(workdir)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run dax binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_tools_list_shows_builtins() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_dax(&config_path, &["tools", "list"]);
    assert!(success, "tools list failed: {}", stderr);
    assert!(stdout.contains("check_git_conventions"));
    assert!(stdout.contains("search_knowledge_base"));
    assert!(stdout.contains("builtin"));
}

#[test]
fn test_tools_run_demo() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_dax(
        &config_path,
        &["tools", "run", "check_git_conventions", "--arg", "query=demo"],
    );
    assert!(success, "tools run failed: {}", stderr);
    assert!(stdout.contains("demo data"));
}

#[test]
fn test_tools_run_unknown_fails() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_dax(&config_path, &["tools", "run", "nope"]);
    assert!(!success);
    assert!(stderr.contains("tool not found: nope"), "stderr: {}", stderr);
}

#[test]
fn test_custom_tools_file_renames_tool() {
    let (tmp, config_path) = setup_test_env();
    fs::write(
        tmp.path().join("tools.json"),
        r#"[{"name": "conventions", "ref": "check_git_conventions", "description": "Commit style"}]"#,
    )
    .unwrap();

    let (stdout, _, success) = run_dax(&config_path, &["tools", "list"]);
    assert!(success);
    assert!(stdout.contains("conventions"));
    assert!(!stdout.contains("search_knowledge_base"));

    let (stdout, _, success) = run_dax(
        &config_path,
        &["tools", "run", "conventions", "--arg", "query=demo"],
    );
    assert!(success);
    assert!(stdout.contains("demo data"));
}

#[test]
fn test_tools_file_with_unknown_ref_fails() {
    let (tmp, config_path) = setup_test_env();
    fs::write(
        tmp.path().join("tools.json"),
        r#"[{"name": "x", "ref": "does_not_exist"}]"#,
    )
    .unwrap();

    let (_, stderr, success) = run_dax(&config_path, &["tools", "list"]);
    assert!(!success);
    assert!(stderr.contains("does_not_exist"), "stderr: {}", stderr);
}

#[test]
fn test_ingest_then_search_jira() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_dax(
        &config_path,
        &["ingest", "jira", "--input", "data/tickets.json"],
    );
    assert!(success, "ingest failed: {}", stderr);
    assert!(stdout.contains("Ingested 2 jira records"));

    let (stdout, stderr, success) = run_dax(&config_path, &["search", "login", "--limit", "1"]);
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.contains("1. ["));
    assert!(stdout.contains("TK-1"));
    assert!(!stdout.contains("TK-2"));
}

#[test]
fn test_ingest_twice_keeps_count() {
    let (_tmp, config_path) = setup_test_env();

    run_dax(&config_path, &["ingest", "jira", "--input", "data/tickets.json"]);
    let (stdout, _, success) = run_dax(
        &config_path,
        &["ingest", "jira", "--input", "data/tickets.json"],
    );
    assert!(success);
    assert!(stdout.contains("(2 documents total)"));
}

#[test]
fn test_ingest_invalid_payload_names_field() {
    let (tmp, config_path) = setup_test_env();
    fs::write(
        tmp.path().join("data/bad.json"),
        r#"{"tickets": [{"key": "A"}, {"summary": "missing"}]}"#,
    )
    .unwrap();

    let (_, stderr, success) = run_dax(
        &config_path,
        &["ingest", "jira", "--input", "data/bad.json"],
    );
    assert!(!success);
    assert!(stderr.contains("tickets[1].key"), "stderr: {}", stderr);
}

#[test]
fn test_merge_indexes() {
    let (tmp, config_path) = setup_test_env();

    run_dax(
        &config_path,
        &["ingest", "jira", "--input", "data/tickets.json", "--index", "jira"],
    );
    run_dax(
        &config_path,
        &["ingest", "git", "--input", "data/commits.json", "--index", "git"],
    );

    let out = tmp.path().join("data/indexes/knowledge.idx");
    let (stdout, stderr, success) = run_dax(
        &config_path,
        &[
            "merge",
            out.to_str().unwrap(),
            "data/indexes/jira.idx",
            "data/indexes/git.idx",
        ],
    );
    assert!(success, "merge failed: {}", stderr);
    assert!(stdout.contains("(3 documents)"));

    let (stdout, _, success) = run_dax(&config_path, &["search", "cache parsed configs"]);
    assert!(success);
    assert!(stdout.contains("1. ["));
    assert!(stdout.contains("9f2c4e1a"));
}

#[test]
fn test_chat_one_shot_uses_index() {
    let (_tmp, config_path) = setup_test_env();

    run_dax(&config_path, &["ingest", "jira", "--input", "data/tickets.json"]);
    let (stdout, stderr, success) = run_dax(
        &config_path,
        &["chat", "--message", "what about the login bug?"],
    );
    assert!(success, "chat failed: {}", stderr);
    assert!(stdout.contains("Relevant context"));
    assert!(stdout.contains("TK-1"));
}

#[test]
fn test_search_without_index_fails() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_dax(&config_path, &["search", "anything"]);
    assert!(!success);
    assert!(stderr.contains("Failed to open index"), "stderr: {}", stderr);
}
