use chrono::{DateTime, FixedOffset, Utc};
use thiserror::Error;

use crate::git;

pub const DEFAULT_SHORT_SHA_LENGTH: usize = 7;

/// Overrides the number of characters kept by the `sha` template function
/// and `type=sha,format=short` tag rules.
pub const SHORT_SHA_LENGTH_ENV: &str = "DOCKER_METADATA_SHORT_SHA_LENGTH";

/// Comma-separated list of annotation levels, e.g. "manifest,index".
pub const ANNOTATIONS_LEVELS_ENV: &str = "DOCKER_METADATA_ANNOTATIONS_LEVELS";

pub const EVENT_NAME_ENV: &str = "GITHUB_EVENT_NAME";

#[derive(Error, Debug)]
pub enum Error {
    #[error("{SHORT_SHA_LENGTH_ENV} is not a valid number: {0}")]
    ShortShaLength(String),
}

/// Immutable snapshot driving one resolution run.
///
/// Captured once before resolution starts so that repeated evaluation of
/// the `date` and `sha` template functions stays referentially transparent
/// within the run.
#[derive(Debug, Clone)]
pub struct Context {
    pub sha: String,
    pub git_ref: String,
    pub commit_date: DateTime<FixedOffset>,
    pub event_name: String,
    pub now: DateTime<Utc>,
    pub short_sha_length: usize,
}

impl Context {
    pub fn from_snapshot(snapshot: &git::Snapshot) -> Result<Self, Error> {
        Ok(Self {
            sha: snapshot.sha.clone(),
            git_ref: snapshot.git_ref.clone(),
            commit_date: snapshot.commit_date,
            event_name: std::env::var(EVENT_NAME_ENV).unwrap_or_else(|_| "push".into()),
            now: Utc::now(),
            short_sha_length: short_sha_length_from_env()?,
        })
    }

    /// Branch name, if the current ref is a branch ref.
    pub fn branch(&self) -> Option<&str> {
        self.git_ref.strip_prefix("refs/heads/")
    }

    /// Tag name, if the current ref is a tag ref.
    pub fn tag(&self) -> Option<&str> {
        self.git_ref.strip_prefix("refs/tags/")
    }

    /// Pull request ref suffix (e.g. "42/merge"), if the current ref is a PR ref.
    pub fn pull_request(&self) -> Option<&str> {
        self.git_ref.strip_prefix("refs/pull/")
    }

    /// The commit SHA truncated to the configured length.
    /// Returns the full SHA when the configured length is not shorter.
    pub fn short_sha(&self) -> String {
        if self.short_sha_length >= self.sha.len() {
            self.sha.clone()
        } else {
            self.sha[..self.short_sha_length].to_string()
        }
    }
}

fn short_sha_length_from_env() -> Result<usize, Error> {
    match std::env::var(SHORT_SHA_LENGTH_ENV) {
        Ok(value) => value.trim().parse().map_err(|_| Error::ShortShaLength(value)),
        Err(_) => Ok(DEFAULT_SHORT_SHA_LENGTH),
    }
}

/// Annotation levels to replicate annotation entries over.
/// An unset or empty override falls back to "manifest".
pub fn annotation_levels() -> Vec<String> {
    parse_annotation_levels(std::env::var(ANNOTATIONS_LEVELS_ENV).ok())
}

fn parse_annotation_levels(value: Option<String>) -> Vec<String> {
    value
        .filter(|levels| !levels.is_empty())
        .unwrap_or_else(|| "manifest".into())
        .split(',')
        .map(str::to_string)
        .collect()
}

/// Split raw configuration entries into items: one item per line, trimmed,
/// with blank lines and `#` comments skipped. Unless `ignore_comma` is set,
/// items are further split on commas.
pub fn input_list(entries: &[String], ignore_comma: bool) -> Vec<String> {
    let mut items = Vec::new();
    for entry in entries {
        for line in entry.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if ignore_comma {
                items.push(trimmed.to_string());
            } else {
                items.extend(
                    trimmed
                        .split(',')
                        .map(str::trim)
                        .filter(|item| !item.is_empty())
                        .map(str::to_string),
                );
            }
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn test_context(git_ref: &str) -> Context {
        Context {
            sha: "5f3331d7f7044c18ca9f12c77d961c4d7cf3276a".to_string(),
            git_ref: git_ref.to_string(),
            commit_date: DateTime::parse_from_rfc3339("2024-11-13T13:42:28+01:00").unwrap(),
            event_name: "push".to_string(),
            now: Utc::now(),
            short_sha_length: DEFAULT_SHORT_SHA_LENGTH,
        }
    }

    #[test]
    fn ref_accessors() {
        assert_eq!(test_context("refs/heads/dev").branch(), Some("dev"));
        assert_eq!(test_context("refs/heads/dev").tag(), None);
        assert_eq!(test_context("refs/tags/v1.0.0").tag(), Some("v1.0.0"));
        assert_eq!(test_context("refs/pull/42/merge").pull_request(), Some("42/merge"));
        assert_eq!(test_context("HEAD").branch(), None);
    }

    #[test]
    fn short_sha_truncates_to_default_length() {
        assert_eq!(test_context("HEAD").short_sha(), "5f3331d");
    }

    #[test]
    fn short_sha_returns_full_sha_when_length_not_shorter() {
        let mut ctx = test_context("HEAD");
        ctx.short_sha_length = 40;
        assert_eq!(ctx.short_sha(), ctx.sha);
        ctx.short_sha_length = 64;
        assert_eq!(ctx.short_sha(), ctx.sha);
    }

    #[test]
    fn annotation_levels_default_when_unset_or_empty() {
        assert_eq!(parse_annotation_levels(None), vec!["manifest"]);
        assert_eq!(parse_annotation_levels(Some(String::new())), vec!["manifest"]);
        assert_eq!(
            parse_annotation_levels(Some("manifest,index".to_string())),
            vec!["manifest", "index"]
        );
    }

    #[test]
    fn input_list_skips_comments_and_blank_lines() {
        let entries = vec!["moby/buildkit\n#comment\n\nghcr.io/moby/buildkit".to_string()];
        assert_eq!(
            input_list(&entries, true),
            vec!["moby/buildkit", "ghcr.io/moby/buildkit"]
        );
    }

    #[test]
    fn input_list_splits_commas_unless_opaque() {
        let entries = vec!["a=1, b=2".to_string()];
        assert_eq!(input_list(&entries, false), vec!["a=1", "b=2"]);
        assert_eq!(input_list(&entries, true), vec!["a=1, b=2"]);
    }
}
