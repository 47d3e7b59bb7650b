use std::process::{Command, ExitStatus};
use std::sync::LazyLock;

use chrono::{DateTime, FixedOffset, Utc};
use log::debug;
use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("git {args}: exited with code {status}")]
    Git { args: String, status: ExitStatus },

    #[error("git output is not valid utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

/// State of the working tree at process start: everything the resolution
/// needs from version control, captured once.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub sha: String,
    pub git_ref: String,
    pub commit_date: DateTime<FixedOffset>,
    pub remote_url: String,
    pub default_branch: String,
}

/// Repository descriptor feeding the OCI label/annotation base set.
#[derive(Debug, Clone, Default)]
pub struct Repo {
    pub name: String,
    pub description: String,
    pub url: String,
    pub default_branch: String,
    pub license: String,
}

fn git(dir: &str, args: &[&str]) -> Result<String, Error> {
    let output = Command::new("git").arg("-C").arg(dir).args(args).output()?;
    if !output.status.success() {
        return Err(Error::Git {
            args: args.join(" "),
            status: output.status,
        });
    }
    Ok(String::from_utf8(output.stdout)?.trim().to_string())
}

/// Inspect the repository at `dir` and capture the resolution snapshot.
pub fn snapshot(dir: &str) -> Result<Snapshot, Error> {
    let sha = git(dir, &["rev-parse", "HEAD"])?;

    // Branch ref first; on a detached HEAD fall back to an exact tag,
    // and failing that to the literal "HEAD".
    let git_ref = match git(dir, &["symbolic-ref", "-q", "HEAD"]) {
        Ok(r) if !r.is_empty() => r,
        _ => match git(dir, &["describe", "--tags", "--exact-match"]) {
            Ok(tag) if !tag.is_empty() => format!("refs/tags/{tag}"),
            _ => "HEAD".to_string(),
        },
    };

    let commit_date = git(dir, &["show", "-s", "--format=%cI", "HEAD"])
        .ok()
        .and_then(|date| DateTime::parse_from_rfc3339(&date).ok())
        .unwrap_or_else(|| Utc::now().fixed_offset());

    let remote_url = git(dir, &["remote", "get-url", "origin"]).unwrap_or_default();
    let default_branch = default_branch(dir);

    debug!("git snapshot: sha={sha} ref={git_ref} default_branch={default_branch}");

    Ok(Snapshot {
        sha,
        git_ref,
        commit_date,
        remote_url,
        default_branch,
    })
}

fn default_branch(dir: &str) -> String {
    if let Ok(head) = git(dir, &["rev-parse", "--symbolic-full-name", "refs/remotes/origin/HEAD"]) {
        if let Some(branch) = head.strip_prefix("refs/remotes/origin/") {
            return branch.to_string();
        }
    }
    if let Ok(branches) = git(dir, &["branch", "-r", "--format=%(refname:short)"]) {
        let all: Vec<&str> = branches.lines().map(str::trim).collect();
        if all.contains(&"origin/main") {
            return "main".to_string();
        }
        if all.contains(&"origin/master") {
            return "master".to_string();
        }
    }
    "main".to_string()
}

// SSH: git@github.com:user/repo.git
// HTTPS: https://github.com/user/repo.git
static SSH_REMOTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^git@([^:]+):([^/]+)/(.+?)(?:\.git)?$").expect("invalid regex"));
static HTTP_REMOTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://([^/]+)/([^/]+)/(.+?)(?:\.git)?$").expect("invalid regex")
});

/// Derive the repository descriptor from a remote URL.
/// Unrecognized URL shapes fall back to the last path component.
pub fn repo_from_remote_url(remote_url: &str, default_branch: &str) -> Repo {
    let mut repo = Repo {
        default_branch: default_branch.to_string(),
        ..Default::default()
    };
    if remote_url.is_empty() {
        return repo;
    }

    if let Some(caps) = SSH_REMOTE
        .captures(remote_url)
        .or_else(|| HTTP_REMOTE.captures(remote_url))
    {
        let (host, user, name) = (&caps[1], &caps[2], &caps[3]);
        repo.name = name.to_string();
        repo.url = format!("https://{host}/{user}/{name}");
    } else {
        repo.name = remote_url
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .trim_end_matches(".git")
            .to_string();
        repo.url = remote_url.to_string();
    }
    repo
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_from_ssh_remote() {
        let repo = repo_from_remote_url("git@github.com:moby/buildkit.git", "master");
        assert_eq!(repo.name, "buildkit");
        assert_eq!(repo.url, "https://github.com/moby/buildkit");
        assert_eq!(repo.default_branch, "master");
    }

    #[test]
    fn repo_from_https_remote() {
        let repo = repo_from_remote_url("https://github.com/test/repo.git", "main");
        assert_eq!(repo.name, "repo");
        assert_eq!(repo.url, "https://github.com/test/repo");

        let repo = repo_from_remote_url("https://gitlab.example.com/test/repo", "main");
        assert_eq!(repo.name, "repo");
        assert_eq!(repo.url, "https://gitlab.example.com/test/repo");
    }

    #[test]
    fn repo_from_unrecognized_remote() {
        let repo = repo_from_remote_url("ssh://host/some/path/thing.git", "main");
        assert_eq!(repo.name, "thing");
        assert_eq!(repo.url, "ssh://host/some/path/thing.git");
    }

    #[test]
    fn repo_from_empty_remote() {
        let repo = repo_from_remote_url("", "main");
        assert_eq!(repo.name, "");
        assert_eq!(repo.url, "");
        assert_eq!(repo.default_branch, "main");
    }
}
