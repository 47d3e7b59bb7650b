use std::collections::BTreeMap;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, TimeZone};
use chrono_tz::Tz;
use thiserror::Error;

use crate::context::Context;
use crate::git::Repo;

#[derive(Error, Debug)]
pub enum Error {
    #[error("template syntax error in {pattern:?}: {reason}")]
    Syntax { pattern: String, reason: String },

    #[error("unknown {0} attribute")]
    UnknownOption(String),

    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("invalid date format: {0}")]
    InvalidDateFormat(String),
}

/// Mustache-style substitution patterns: literal text interleaved with
/// `{{name}}` or `{{name 'arg' opt=value}}` calls. This is deliberately not
/// a general template engine; single substitutions with at most one
/// positional argument cover every pattern the tag rules accept.
#[derive(Debug, PartialEq)]
enum Node {
    Text(String),
    Call(Call),
}

#[derive(Debug, PartialEq)]
struct Call {
    name: String,
    arg: Option<String>,
    opts: Vec<(String, String)>,
}

#[derive(Debug, PartialEq)]
struct Template {
    nodes: Vec<Node>,
}

/// The set of names a pattern may refer to, bound to the immutable
/// resolution snapshot.
pub enum Scope<'a> {
    /// Full function table: branch, tag, sha, base_ref, commit_date, date,
    /// is_default_branch, is_not_default_branch.
    Global { context: &'a Context, repo: &'a Repo },
    /// Only the date functions; schedule rule patterns see nothing else.
    Dates { context: &'a Context },
    /// Version fields exposed by the semver and pep440 processors.
    Vars(&'a BTreeMap<&'static str, String>),
}

/// Evaluate `pattern` against `scope`. Unknown names render as the empty
/// string; malformed syntax and unknown named options are errors.
pub fn expand(pattern: &str, scope: &Scope) -> Result<String, Error> {
    let template = parse(pattern)?;
    let mut out = String::new();
    for node in &template.nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Call(call) => out.push_str(&eval(call, scope)?),
        }
    }
    Ok(out)
}

/// A pattern is "raw" iff it consists of exactly one substitution of the
/// bare name `raw`. Unparseable patterns are not raw.
pub fn is_raw_statement(pattern: &str) -> bool {
    match parse(pattern) {
        Ok(template) => {
            template.nodes.len() == 1
                && matches!(&template.nodes[0], Node::Call(call)
                    if call.name == "raw" && call.arg.is_none() && call.opts.is_empty())
        }
        Err(_) => false,
    }
}

fn eval(call: &Call, scope: &Scope) -> Result<String, Error> {
    match scope {
        Scope::Global { context, repo } => match call.name.as_str() {
            "branch" => Ok(context.branch().unwrap_or_default().to_string()),
            "tag" => Ok(context.tag().unwrap_or_default().to_string()),
            "sha" => Ok(context.short_sha()),
            // No pull request integration is available here, so there is
            // never a base ref to expose.
            "base_ref" => Ok(String::new()),
            "commit_date" => format_date(&context.commit_date, call),
            "date" => format_date(&context.now, call),
            "is_default_branch" => Ok(bool_str(is_default_branch(context, repo))),
            "is_not_default_branch" => Ok(bool_str(!is_default_branch(context, repo))),
            _ => Ok(String::new()),
        },
        Scope::Dates { context } => match call.name.as_str() {
            "commit_date" => format_date(&context.commit_date, call),
            "date" => format_date(&context.now, call),
            _ => Ok(String::new()),
        },
        Scope::Vars(vars) => Ok(vars.get(call.name.as_str()).cloned().unwrap_or_default()),
    }
}

fn bool_str(value: bool) -> String {
    if value { "true" } else { "false" }.to_string()
}

fn is_default_branch(context: &Context, repo: &Repo) -> bool {
    match context.branch() {
        Some(branch) if !branch.is_empty() => branch == repo.default_branch,
        _ => false,
    }
}

/// Format a timestamp with a chrono strftime pattern, in the timezone given
/// by the `tz` option (UTC by default). Without a format argument the
/// timestamp renders as RFC 3339.
fn format_date<Z: TimeZone>(date: &DateTime<Z>, call: &Call) -> Result<String, Error> {
    let mut tz = chrono_tz::UTC;
    for (key, value) in &call.opts {
        match key.as_str() {
            "tz" => {
                tz = value
                    .parse::<Tz>()
                    .map_err(|_| Error::UnknownTimezone(value.clone()))?;
            }
            other => return Err(Error::UnknownOption(other.to_string())),
        }
    }
    let local = date.with_timezone(&tz);
    match &call.arg {
        Some(format) => {
            if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
                return Err(Error::InvalidDateFormat(format.clone()));
            }
            Ok(local.format(format).to_string())
        }
        None => Ok(local.to_rfc3339()),
    }
}

fn parse(pattern: &str) -> Result<Template, Error> {
    let syntax = |reason: &str| Error::Syntax {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    };

    let mut nodes = Vec::new();
    let mut rest = pattern;
    while let Some(start) = rest.find("{{") {
        if start > 0 {
            nodes.push(Node::Text(rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| syntax("unterminated substitution"))?;
        nodes.push(Node::Call(parse_call(&after[..end], &syntax)?));
        rest = &after[end + 2..];
    }
    if !rest.is_empty() {
        nodes.push(Node::Text(rest.to_string()));
    }
    Ok(Template { nodes })
}

fn parse_call(inner: &str, syntax: &dyn Fn(&str) -> Error) -> Result<Call, Error> {
    let mut cursor = Cursor::new(inner);
    cursor.skip_whitespace();
    let name = cursor
        .ident()
        .ok_or_else(|| syntax("expected function name"))?
        .to_string();

    let mut call = Call {
        name,
        arg: None,
        opts: Vec::new(),
    };
    loop {
        cursor.skip_whitespace();
        if cursor.done() {
            return Ok(call);
        }
        if let Some(text) = cursor.quoted().map_err(|reason| syntax(reason))? {
            if call.arg.is_some() || !call.opts.is_empty() {
                return Err(syntax("unexpected argument"));
            }
            call.arg = Some(text);
            continue;
        }
        let key = cursor
            .ident()
            .ok_or_else(|| syntax("expected option name"))?
            .to_string();
        if !cursor.eat('=') {
            return Err(syntax("expected option assignment"));
        }
        let value = match cursor.quoted().map_err(|reason| syntax(reason))? {
            Some(text) => text,
            None => cursor
                .bare_value()
                .ok_or_else(|| syntax("expected option value"))?
                .to_string(),
        };
        call.opts.push((key, value));
    }
}

struct Cursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn done(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn skip_whitespace(&mut self) {
        self.pos += self.rest().len() - self.rest().trim_start().len();
    }

    fn eat(&mut self, want: char) -> bool {
        if self.rest().starts_with(want) {
            self.pos += want.len_utf8();
            true
        } else {
            false
        }
    }

    fn ident(&mut self) -> Option<&'a str> {
        let rest = self.rest();
        let len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        if len == 0 {
            return None;
        }
        self.pos += len;
        Some(&rest[..len])
    }

    /// A `'...'` or `"..."` literal, or None when the cursor is not at a quote.
    fn quoted(&mut self) -> Result<Option<String>, &'static str> {
        let rest = self.rest();
        let Some(quote) = rest.chars().next().filter(|c| *c == '\'' || *c == '"') else {
            return Ok(None);
        };
        let body = &rest[quote.len_utf8()..];
        let end = body.find(quote).ok_or("unterminated string literal")?;
        self.pos += quote.len_utf8() * 2 + end;
        Ok(Some(body[..end].to_string()))
    }

    fn bare_value(&mut self) -> Option<&'a str> {
        let rest = self.rest();
        let len = rest
            .find(char::is_whitespace)
            .unwrap_or(rest.len());
        if len == 0 {
            return None;
        }
        self.pos += len;
        Some(&rest[..len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::context::DEFAULT_SHORT_SHA_LENGTH;

    fn context(git_ref: &str) -> Context {
        Context {
            sha: "5f3331d7f7044c18ca9f12c77d961c4d7cf3276a".to_string(),
            git_ref: git_ref.to_string(),
            commit_date: DateTime::parse_from_rfc3339("2024-11-13T13:42:28+00:00").unwrap(),
            event_name: "push".to_string(),
            now: Utc::now(),
            short_sha_length: DEFAULT_SHORT_SHA_LENGTH,
        }
    }

    fn repo() -> Repo {
        Repo {
            name: "repo".to_string(),
            default_branch: "main".to_string(),
            ..Default::default()
        }
    }

    fn global(pattern: &str, git_ref: &str) -> Result<String, Error> {
        expand(
            pattern,
            &Scope::Global {
                context: &context(git_ref),
                repo: &repo(),
            },
        )
    }

    #[test]
    fn expands_plain_text_unchanged() {
        assert_eq!(global("nightly", "HEAD").unwrap(), "nightly");
        assert_eq!(global("", "HEAD").unwrap(), "");
    }

    #[test]
    fn expands_ref_functions() {
        assert_eq!(global("{{branch}}", "refs/heads/dev").unwrap(), "dev");
        assert_eq!(global("{{branch}}", "refs/tags/v1.0.0").unwrap(), "");
        assert_eq!(global("{{tag}}", "refs/tags/v1.0.0").unwrap(), "v1.0.0");
        assert_eq!(global("{{base_ref}}", "refs/heads/dev").unwrap(), "");
        assert_eq!(global("pr-{{sha}}", "HEAD").unwrap(), "pr-5f3331d");
    }

    #[test]
    fn expands_default_branch_predicates() {
        assert_eq!(global("{{is_default_branch}}", "refs/heads/main").unwrap(), "true");
        assert_eq!(global("{{is_default_branch}}", "refs/heads/dev").unwrap(), "false");
        assert_eq!(global("{{is_default_branch}}", "refs/tags/v1").unwrap(), "false");
        assert_eq!(global("{{is_not_default_branch}}", "refs/heads/dev").unwrap(), "true");
    }

    #[test]
    fn expands_dates_with_format_and_timezone() {
        assert_eq!(
            global("{{commit_date '%Y%m%d'}}", "HEAD").unwrap(),
            "20241113"
        );
        // 13:42 UTC is the same calendar day in Oslo.
        assert_eq!(
            global("{{commit_date '%Y-%m-%d %H' tz='Europe/Oslo'}}", "HEAD").unwrap(),
            "2024-11-13 14"
        );
    }

    #[test]
    fn rejects_unknown_date_option() {
        assert!(matches!(
            global("{{commit_date '%Y' zone='UTC'}}", "HEAD"),
            Err(Error::UnknownOption(_))
        ));
        assert!(matches!(
            global("{{commit_date '%Y' tz='Atlantis/Lost'}}", "HEAD"),
            Err(Error::UnknownTimezone(_))
        ));
    }

    #[test]
    fn unknown_names_render_empty() {
        assert_eq!(global("x{{does_not_exist}}y", "HEAD").unwrap(), "xy");
    }

    #[test]
    fn vars_scope_looks_up_fields() {
        let mut vars = BTreeMap::new();
        vars.insert("version", "1.2.3".to_string());
        vars.insert("major", "1".to_string());
        assert_eq!(
            expand("v{{major}}: {{version}}", &Scope::Vars(&vars)).unwrap(),
            "v1: 1.2.3"
        );
        assert_eq!(expand("{{minor}}", &Scope::Vars(&vars)).unwrap(), "");
    }

    #[test]
    fn dates_scope_hides_ref_functions() {
        let ctx = context("refs/heads/main");
        assert_eq!(
            expand("{{branch}}{{commit_date '%Y'}}", &Scope::Dates { context: &ctx }).unwrap(),
            "2024"
        );
    }

    #[test]
    fn rejects_malformed_patterns() {
        assert!(matches!(global("{{branch", "HEAD"), Err(Error::Syntax { .. })));
        assert!(matches!(global("{{}}", "HEAD"), Err(Error::Syntax { .. })));
        assert!(matches!(global("{{date '%Y}}", "HEAD"), Err(Error::Syntax { .. })));
        assert!(matches!(global("{{date x}}", "HEAD"), Err(Error::Syntax { .. })));
    }

    #[test]
    fn raw_statement_detection() {
        assert!(is_raw_statement("{{raw}}"));
        assert!(is_raw_statement("{{ raw }}"));
        assert!(!is_raw_statement(" {{raw}} "));
        assert!(!is_raw_statement("{{version}}"));
        assert!(!is_raw_statement("v{{raw}}"));
        assert!(!is_raw_statement("{{raw}}{{raw}}"));
        assert!(!is_raw_statement("{{raw"));
    }
}
