//! Raw data sources: local git history and JIRA search.
//!
//! Both produce JSON payloads in the shapes [`crate::ingest`] accepts, so
//! a fetch can be written to disk, inspected, and ingested later.
//!
//! Git access shells out to the `git` binary. Remote repositories are
//! shallow-cloned into a temporary directory that is removed afterwards.
//! JIRA access uses the REST v2 search endpoint with basic auth.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::process::Command;

use crate::config::JiraConfig;

const RECORD_SEP: char = '\x1e';
const FIELD_SEP: char = '\x1f';

/// Run `git` in `repo` and return stdout.
fn git(repo: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .with_context(|| format!("Failed to execute 'git {}'. Is git installed?", args[0]))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git {} failed: {}", args[0], stderr.trim());
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Parse `git log --name-only` output produced with [`LOG_FORMAT`].
fn parse_log(raw: &str) -> Vec<Value> {
    raw.split(RECORD_SEP)
        .filter(|r| !r.trim().is_empty())
        .filter_map(|record| {
            let fields: Vec<&str> = record.split(FIELD_SEP).collect();
            if fields.len() < 7 {
                return None;
            }
            let sha = fields[0].trim();
            let changed_files: Vec<&str> = fields[6]
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .collect();
            Some(json!({
                "sha": sha,
                "short_sha": sha.chars().take(7).collect::<String>(),
                "message": fields[5].trim(),
                "author": { "name": fields[1], "email": fields[2] },
                "authored_date": fields[3],
                "committed_date": fields[4],
                "changed_files": changed_files,
            }))
        })
        .collect()
}

const LOG_FORMAT: &str = "--format=%x1e%H%x1f%an%x1f%ae%x1f%aI%x1f%cI%x1f%B%x1f";

/// Read the last `max_commits` commits of `repo` into the git payload shape:
/// `{repository, metadata, commits}`.
pub fn fetch_git_history(repo: &Path, max_commits: usize) -> Result<Value> {
    if !repo.join(".git").exists() && git(repo, &["rev-parse", "--git-dir"]).is_err() {
        bail!("Invalid git repository: {}", repo.display());
    }

    let limit = format!("-n{}", max_commits);
    let raw = git(repo, &["log", &limit, "--name-only", LOG_FORMAT])?;
    let commits = parse_log(&raw);

    let branch = git(repo, &["rev-parse", "--abbrev-ref", "HEAD"])
        .map(|b| b.trim().to_string())
        .unwrap_or_default();
    let branch = if branch.is_empty() || branch == "HEAD" {
        "detached".to_string()
    } else {
        branch
    };
    let remote_url = git(repo, &["remote", "get-url", "origin"])
        .ok()
        .map(|u| u.trim().to_string());

    tracing::info!(repo = %repo.display(), commits = commits.len(), "fetched git history");

    Ok(json!({
        "repository": {
            "path": repo.display().to_string(),
            "current_branch": branch,
            "remote_url": remote_url,
        },
        "metadata": {
            "total_commits_fetched": commits.len(),
            "max_commits_requested": max_commits,
            "fetch_timestamp": chrono::Utc::now().to_rfc3339(),
        },
        "commits": commits,
    }))
}

/// GitHub HTTPS URLs get the token as userinfo; anything else is used as is.
fn authenticated_url(url: &str, token: Option<&str>) -> String {
    match token.filter(|t| !t.is_empty()) {
        Some(token) if url.starts_with("https://github.com/") => {
            url.replacen("https://github.com/", &format!("https://{}@github.com/", token), 1)
        }
        _ => url.to_string(),
    }
}

/// Shallow-clone `url` and read its last `max_commits` commits.
///
/// `branch` is checked out when given; if the clone of that branch fails
/// the default branch is used instead. The payload reports the URL without
/// the token, and the clone is deleted before returning.
pub fn fetch_remote_git_history(
    url: &str,
    branch: Option<&str>,
    token: Option<&str>,
    max_commits: usize,
) -> Result<Value> {
    let checkout = tempfile::Builder::new()
        .prefix("dax_clone_")
        .tempdir()
        .context("Failed to create a temporary clone directory")?;
    let source = authenticated_url(url, token);
    let depth = (max_commits + 10).to_string();
    let redact = |e: anyhow::Error| match token.filter(|t| !t.is_empty()) {
        Some(t) => anyhow::anyhow!("{}", format!("{:#}", e).replace(t, "***")),
        None => e,
    };

    let clone = |branch: Option<&str>, target: &str| -> Result<std::path::PathBuf> {
        let mut args = vec!["clone", "--depth", depth.as_str()];
        if let Some(b) = branch {
            args.extend(["--branch", b]);
        }
        args.extend([source.as_str(), target]);
        git(checkout.path(), &args)?;
        Ok(checkout.path().join(target))
    };

    let repo = match clone(branch, "branch") {
        Ok(repo) => repo,
        Err(e) if branch.is_some() => {
            tracing::warn!(url, branch, error = %redact(e), "branch clone failed, using default branch");
            clone(None, "default").map_err(redact)?
        }
        Err(e) => return Err(redact(e)),
    };

    let mut payload = fetch_git_history(&repo, max_commits)?;
    payload["repository"]["path"] = json!(url);
    payload["repository"]["remote_url"] = json!(url);
    tracing::info!(url, "fetched remote git history");
    Ok(payload)
}

/// Subjects of the last `n` commits, newest first.
pub fn recent_subjects(repo: &Path, n: usize) -> Result<Vec<String>> {
    let limit = format!("-n{}", n);
    let raw = git(repo, &["log", &limit, "--format=%s"])?;
    Ok(raw.lines().map(|l| l.to_string()).collect())
}

/// Conventional prefixes (`feat`, `fix(scope)`, ...) with their counts,
/// most common first.
pub fn commit_prefixes(subjects: &[String]) -> Vec<(String, usize)> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for subject in subjects {
        if let Some((prefix, _)) = subject.split_once(':') {
            let prefix = prefix.trim();
            if !prefix.is_empty() && !prefix.contains(' ') {
                *counts.entry(prefix.to_string()).or_default() += 1;
            }
        }
    }
    let mut ranked: Vec<_> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

/// Authors of the last `n` commits ranked by commit count, plus the number
/// of commits examined.
pub fn contributors(repo: &Path, n: usize) -> Result<(Vec<(String, usize)>, usize)> {
    let limit = format!("-n{}", n);
    let raw = git(repo, &["log", &limit, "--format=%an"])?;
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut total = 0;
    for author in raw.lines().filter(|l| !l.is_empty()) {
        *counts.entry(author.to_string()).or_default() += 1;
        total += 1;
    }
    let mut ranked: Vec<_> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    Ok((ranked, total))
}

/// Convert a JIRA REST search response into ticket records.
pub fn tickets_from_search(response: &Value) -> Vec<Value> {
    let issues = response
        .get("issues")
        .and_then(|i| i.as_array())
        .cloned()
        .unwrap_or_default();

    issues
        .iter()
        .map(|issue| {
            let fields = issue.get("fields").cloned().unwrap_or(Value::Null);
            let text = |key: &str| -> Value {
                match fields.get(key) {
                    Some(Value::String(s)) => Value::String(s.clone()),
                    _ => Value::String(String::new()),
                }
            };
            let named = |key: &str| -> Value {
                fields
                    .get(key)
                    .and_then(|v| v.get("name").or_else(|| v.get("displayName")))
                    .cloned()
                    .unwrap_or(Value::Null)
            };
            json!({
                "key": issue.get("key").cloned().unwrap_or(Value::Null),
                "id": issue.get("id").cloned().unwrap_or(Value::Null),
                "summary": text("summary"),
                "description": text("description"),
                "status": named("status"),
                "issue_type": named("issuetype"),
                "assignee": named("assignee"),
                "created": text("created"),
                "updated": text("updated"),
            })
        })
        .collect()
}

/// Run a JQL search and return the jira payload `{"tickets": [...]}`.
pub async fn fetch_jira_tickets(config: &JiraConfig, jql: &str) -> Result<Value> {
    let domain = config
        .domain
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("jira.domain is not configured"))?;
    let user = config
        .user
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("jira.user is not configured"))?;
    let token = std::env::var(&config.token_env)
        .map_err(|_| anyhow::anyhow!("{} environment variable not set", config.token_env))?;

    let url = format!("{}/rest/api/2/search", domain.trim_end_matches('/'));
    let max_results = config.max_results.to_string();
    let response = reqwest::Client::new()
        .get(&url)
        .basic_auth(user, Some(token))
        .query(&[
            ("jql", jql),
            ("maxResults", max_results.as_str()),
            (
                "fields",
                "summary,description,status,issuetype,assignee,created,updated",
            ),
        ])
        .send()
        .await
        .with_context(|| format!("JIRA request to {} failed", url))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("JIRA API error {}: {}", status, body);
    }

    let body: Value = response.json().await?;
    let tickets = tickets_from_search(&body);
    tracing::info!(jql, tickets = tickets.len(), "fetched JIRA tickets");
    Ok(json!({ "tickets": tickets }))
}

/// Write a payload as pretty JSON, creating parent directories.
pub fn write_payload(path: &Path, payload: &Value) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(payload)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
