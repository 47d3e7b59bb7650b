use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::SecondsFormat;
use log::warn;
use regex::{Regex, RegexBuilder};
use serde_json::{json, Value};
use thiserror::Error;

use crate::context::Context;
use crate::expr::{self, Scope};
use crate::git::Repo;
use crate::pep440;
use crate::rules::{CommonAttrs, Flavor, Image, Latest, RefEvent, ShaFormat, TagKind, TagRule};

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid value for enable attribute: {0}")]
    InvalidEnable(String),

    #[error("invalid match pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("unknown bake file type: {0}")]
    UnknownBakeKind(String),

    #[error(transparent)]
    Expr(#[from] expr::Error),
}

/// Accumulator and final resolution result. `main` is set at most once,
/// `partial` collects subsequent distinct values in order of first
/// appearance, and `latest` is decided by the first value-producing rule.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Version {
    pub main: Option<String>,
    pub partial: Vec<String>,
    pub latest: Option<bool>,
}

/// Fully parsed inputs for one resolution run.
#[derive(Debug, Clone, Default)]
pub struct Inputs {
    pub rules: Vec<TagRule>,
    pub images: Vec<Image>,
    pub flavor: Flavor,
    pub labels: Vec<String>,
    pub annotations: Vec<String>,
    pub bake_target: String,
}

/// Resolved image metadata: walks the rule list once at construction time
/// and projects the result into tags, labels, annotations and bake
/// definitions on demand.
pub struct Meta {
    pub version: Version,
    context: Context,
    repo: Repo,
    images: Vec<Image>,
    flavor: Flavor,
    labels_input: Vec<String>,
    annotations_input: Vec<String>,
    bake_target: String,
}

impl Meta {
    pub fn new(inputs: Inputs, context: Context, repo: Repo) -> Result<Self, Error> {
        let mut meta = Self {
            version: Version::default(),
            context,
            repo,
            images: inputs.images,
            flavor: inputs.flavor,
            labels_input: inputs.labels,
            annotations_input: inputs.annotations,
            bake_target: inputs.bake_target,
        };
        meta.version = meta.resolve(&inputs.rules)?;
        Ok(meta)
    }

    /// Walk the rules in declaration order, folding each active rule's
    /// proposal into the accumulator. Declaration order is the sole
    /// tie-break; no rule can observe or undo an earlier rule's effect.
    fn resolve(&self, rules: &[TagRule]) -> Result<Version, Error> {
        let mut version = Version::default();
        for rule in rules {
            let enabled = self.global_exp(&rule.attrs.enable)?;
            match enabled.as_str() {
                "true" => {}
                "false" => continue,
                other => return Err(Error::InvalidEnable(other.to_string())),
            }
            version = match &rule.kind {
                TagKind::Schedule { pattern } => self.proc_schedule(version, rule, pattern)?,
                TagKind::Semver {
                    pattern,
                    value,
                    match_expr,
                } => self.proc_semver(version, rule, pattern, value, match_expr)?,
                TagKind::Pep440 {
                    pattern,
                    value,
                    match_expr,
                } => self.proc_pep440(version, rule, pattern, value, match_expr)?,
                TagKind::Match {
                    pattern,
                    value,
                    group,
                } => self.proc_match(version, rule, pattern, value, *group)?,
                TagKind::Ref {
                    event: RefEvent::Branch,
                } => self.proc_ref_branch(version, rule)?,
                TagKind::Ref {
                    event: RefEvent::Tag,
                } => self.proc_ref_tag(version, rule)?,
                TagKind::Ref { event: RefEvent::Pr } => self.proc_ref_pr(version, rule)?,
                TagKind::Edge { branch } => self.proc_edge(version, rule, branch)?,
                TagKind::Raw { value } => self.proc_raw(version, rule, value)?,
                TagKind::Sha { format } => self.proc_sha(version, rule, *format)?,
            };
        }
        if version.latest.is_none() {
            version.latest = Some(false);
        }
        Ok(version)
    }

    fn global_scope(&self) -> Scope<'_> {
        Scope::Global {
            context: &self.context,
            repo: &self.repo,
        }
    }

    fn global_exp(&self, val: &str) -> Result<String, Error> {
        Ok(expr::expand(val, &self.global_scope())?)
    }

    fn latest_for(&self, rule_default: bool) -> bool {
        match self.flavor.latest {
            Latest::Auto => rule_default,
            Latest::True => true,
            Latest::False => false,
        }
    }

    /// Source value shared by the semver, pep440 and match kinds: an
    /// explicit `value` attribute, or the tag name when the ref is a tag.
    /// None means the rule is inactive.
    fn rule_source(&self, value: &str) -> Result<Option<String>, Error> {
        if !value.is_empty() {
            return Ok(Some(self.global_exp(value)?));
        }
        Ok(self.context.tag().map(str::to_string))
    }

    fn proc_schedule(&self, version: Version, rule: &TagRule, pattern: &str) -> Result<Version, Error> {
        if self.context.event_name != "schedule" {
            return Ok(version);
        }
        let rendered = expr::expand(
            pattern,
            &Scope::Dates {
                context: &self.context,
            },
        )?;
        let vraw = self.set_value(rendered, &rule.attrs)?;
        Ok(set_version(version, vraw, self.latest_for(false)))
    }

    fn proc_semver(
        &self,
        version: Version,
        rule: &TagRule,
        pattern: &str,
        value: &str,
        match_expr: &str,
    ) -> Result<Version, Error> {
        let Some(vraw) = self.rule_source(value)? else {
            return Ok(version);
        };
        let Some(vraw) = extract_match(vraw, match_expr)? else {
            return Ok(version);
        };
        let vraw = vraw.replace('/', "-");

        let bare = vraw.strip_prefix('v').unwrap_or(&vraw);
        let parsed = match semver::Version::parse(bare) {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("{vraw} is not a valid semver");
                return Ok(version);
            }
        };

        let vars = semver_vars(&vraw, &parsed);
        let (rendered, latest) = if parsed.pre.is_empty() {
            (expr::expand(pattern, &Scope::Vars(&vars))?, true)
        } else if expr::is_raw_statement(pattern) {
            // Pre-releases honor the raw escape but never a full pattern.
            (expr::expand(pattern, &Scope::Vars(&vars))?, false)
        } else {
            (vars["version"].clone(), false)
        };
        let vraw = self.set_value(rendered, &rule.attrs)?;
        Ok(set_version(version, vraw, self.latest_for(latest)))
    }

    fn proc_pep440(
        &self,
        version: Version,
        rule: &TagRule,
        pattern: &str,
        value: &str,
        match_expr: &str,
    ) -> Result<Version, Error> {
        let Some(vraw) = self.rule_source(value)? else {
            return Ok(version);
        };
        let Some(vraw) = extract_match(vraw, match_expr)? else {
            return Ok(version);
        };
        let vraw = vraw.replace('/', "-");

        let parsed: pep440::Version = match vraw.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("{vraw} does not conform to PEP 440");
                return Ok(version);
            }
        };

        let (rendered, latest) =
            if parsed.is_prerelease() || parsed.is_postrelease() || parsed.is_devrelease() {
                if expr::is_raw_statement(pattern) {
                    (vraw.clone(), false)
                } else {
                    (parsed.to_string(), false)
                }
            } else {
                let vars = pep440_vars(&vraw, &parsed);
                (expr::expand(pattern, &Scope::Vars(&vars))?, true)
            };
        let vraw = self.set_value(rendered, &rule.attrs)?;
        Ok(set_version(version, vraw, self.latest_for(latest)))
    }

    fn proc_match(
        &self,
        version: Version,
        rule: &TagRule,
        pattern: &str,
        value: &str,
        group: usize,
    ) -> Result<Version, Error> {
        let Some(vraw) = self.rule_source(value)? else {
            return Ok(version);
        };
        let re = compile_match_pattern(pattern)?;
        let Some(caps) = re.captures(&vraw) else {
            warn!("{pattern} does not match {vraw}");
            return Ok(version);
        };
        let Some(group_match) = caps.get(group) else {
            warn!("group {group} does not exist for {pattern} pattern");
            return Ok(version);
        };
        let vraw = self.set_value(group_match.as_str().to_string(), &rule.attrs)?;
        Ok(set_version(version, vraw, self.latest_for(true)))
    }

    fn proc_ref_branch(&self, version: Version, rule: &TagRule) -> Result<Version, Error> {
        let Some(branch) = self.context.branch() else {
            return Ok(version);
        };
        let vraw = self.set_value(branch.to_string(), &rule.attrs)?;
        Ok(set_version(version, vraw, self.latest_for(false)))
    }

    fn proc_ref_tag(&self, version: Version, rule: &TagRule) -> Result<Version, Error> {
        let Some(tag) = self.context.tag() else {
            return Ok(version);
        };
        let vraw = self.set_value(tag.to_string(), &rule.attrs)?;
        Ok(set_version(version, vraw, self.latest_for(true)))
    }

    fn proc_ref_pr(&self, version: Version, rule: &TagRule) -> Result<Version, Error> {
        let Some(pr) = self.context.pull_request() else {
            return Ok(version);
        };
        let pr = pr.strip_suffix("/merge").unwrap_or(pr);
        let vraw = self.set_value(pr.to_string(), &rule.attrs)?;
        Ok(set_version(version, vraw, self.latest_for(false)))
    }

    fn proc_edge(&self, version: Version, rule: &TagRule, branch: &str) -> Result<Version, Error> {
        let Some(current) = self.context.branch() else {
            return Ok(version);
        };
        let wanted = if branch.is_empty() {
            self.repo.default_branch.as_str()
        } else {
            branch
        };
        if wanted != current {
            return Ok(version);
        }
        let vraw = self.set_value("edge".to_string(), &rule.attrs)?;
        Ok(set_version(version, vraw, self.latest_for(false)))
    }

    fn proc_raw(&self, version: Version, rule: &TagRule, value: &str) -> Result<Version, Error> {
        let vraw = self.set_value(self.global_exp(value)?, &rule.attrs)?;
        Ok(set_version(version, vraw, self.latest_for(false)))
    }

    fn proc_sha(&self, version: Version, rule: &TagRule, format: ShaFormat) -> Result<Version, Error> {
        if self.context.sha.is_empty() {
            return Ok(version);
        }
        let val = match format {
            ShaFormat::Short => self.context.short_sha(),
            ShaFormat::Long => self.context.sha.clone(),
        };
        let vraw = self.set_value(val, &rule.attrs)?;
        Ok(set_version(version, vraw, self.latest_for(false)))
    }

    /// Apply a per-rule prefix/suffix if explicitly declared, else the
    /// flavor-level one. Both are expression-evaluated.
    fn set_value(&self, mut val: String, attrs: &CommonAttrs) -> Result<String, Error> {
        if let Some(prefix) = &attrs.prefix {
            val = format!("{}{}", self.global_exp(prefix)?, val);
        } else if !self.flavor.prefix.is_empty() {
            val = format!("{}{}", self.global_exp(&self.flavor.prefix)?, val);
        }
        if let Some(suffix) = &attrs.suffix {
            val = format!("{}{}", val, self.global_exp(suffix)?);
        } else if !self.flavor.suffix.is_empty() {
            val = format!("{}{}", val, self.global_exp(&self.flavor.suffix)?);
        }
        Ok(val)
    }

    /// Enabled image names, lower-cased. Disabled images are excluded from
    /// tag generation only; labels and annotations are image-independent.
    fn image_names(&self) -> Vec<String> {
        self.images
            .iter()
            .filter(|image| image.enable)
            .map(|image| image.name.to_lowercase())
            .collect()
    }

    pub fn tags(&self) -> Vec<String> {
        let Some(main) = &self.version.main else {
            return Vec::new();
        };

        let images = self.image_names();
        let prefixes: Vec<String> = if images.is_empty() {
            vec![String::new()]
        } else {
            images.iter().map(|name| format!("{name}:")).collect()
        };

        let mut tags = Vec::new();
        for prefix in &prefixes {
            tags.push(format!("{prefix}{main}"));
            for partial in &self.version.partial {
                tags.push(format!("{prefix}{partial}"));
            }
            if self.version.latest == Some(true) {
                let latest = format!(
                    "{}latest{}",
                    if self.flavor.prefix_latest {
                        self.flavor.prefix.as_str()
                    } else {
                        ""
                    },
                    if self.flavor.suffix_latest {
                        self.flavor.suffix.as_str()
                    } else {
                        ""
                    }
                );
                tags.push(format!("{prefix}{}", sanitize_tag(&latest)));
            }
        }
        tags
    }

    pub fn labels(&self) -> Result<Vec<String>, Error> {
        self.oci_entries(&self.labels_input)
    }

    pub fn annotations(&self) -> Result<Vec<String>, Error> {
        self.oci_entries(&self.annotations_input)
    }

    /// Annotation entries replicated once per level, `<level>:<key>=<value>`.
    pub fn leveled_annotations(&self, levels: &[String]) -> Result<Vec<String>, Error> {
        let entries = self.annotations()?;
        let mut out = Vec::new();
        for level in levels {
            out.extend(entries.iter().map(|entry| format!("{level}:{entry}")));
        }
        Ok(out)
    }

    /// The eight fixed org.opencontainers.image keys plus user entries,
    /// deduplicated by key (last wins) and key-sorted. Absent source fields
    /// render as empty values, never omitted keys.
    fn oci_entries(&self, extra: &[String]) -> Result<Vec<String>, Error> {
        let mut entries = vec![
            format!("org.opencontainers.image.title={}", self.repo.name),
            format!("org.opencontainers.image.description={}", self.repo.description),
            format!("org.opencontainers.image.url={}", self.repo.url),
            format!("org.opencontainers.image.source={}", self.repo.url),
            format!(
                "org.opencontainers.image.version={}",
                self.version.main.as_deref().unwrap_or("")
            ),
            format!(
                "org.opencontainers.image.created={}",
                self.context.now.to_rfc3339_opts(SecondsFormat::Millis, true)
            ),
            format!("org.opencontainers.image.revision={}", self.context.sha),
            format!("org.opencontainers.image.licenses={}", self.repo.license),
        ];
        for entry in extra {
            entries.push(self.global_exp(entry)?);
        }

        let mut merged: Vec<(String, String)> = Vec::new();
        for entry in entries {
            let Some((key, value)) = entry.split_once('=') else {
                continue;
            };
            match merged.iter_mut().find(|(k, _)| k == key) {
                Some(slot) => slot.1 = value.to_string(),
                None => merged.push((key.to_string(), value.to_string())),
            }
        }
        merged.sort_by(|a, b| compare_keys(&a.0, &b.0));
        Ok(merged
            .into_iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect())
    }

    fn label_map(&self) -> Result<serde_json::Map<String, Value>, Error> {
        let mut map = serde_json::Map::new();
        for label in self.labels()? {
            let Some((key, value)) = label.split_once('=') else {
                continue;
            };
            map.insert(key.to_string(), Value::String(value.to_string()));
        }
        Ok(map)
    }

    pub fn json(&self, levels: &[String]) -> Result<Value, Error> {
        Ok(json!({
            "tags": self.tags(),
            "labels": self.label_map()?,
            "annotations": self.leveled_annotations(levels)?,
        }))
    }

    fn meta_args(&self) -> Value {
        json!({
            "DOCKER_META_IMAGES": self.image_names().join(","),
            "DOCKER_META_VERSION": self.version.main.as_deref().unwrap_or(""),
        })
    }

    fn target_payload(&self, dt: Value) -> Value {
        let mut target = serde_json::Map::new();
        target.insert(self.bake_target.clone(), dt);
        json!({ "target": target })
    }

    /// Bake definition for one kind: "tags", "labels" or
    /// "annotations:<level>,<level>,...".
    pub fn bake_definition(&self, kind: &str) -> Result<Value, Error> {
        if kind == "tags" {
            Ok(self.target_payload(json!({
                "tags": self.tags(),
                "args": self.meta_args(),
            })))
        } else if kind == "labels" {
            Ok(self.target_payload(json!({ "labels": self.label_map()? })))
        } else if let Some(levels) = kind.strip_prefix("annotations:") {
            let levels: Vec<String> = levels.split(',').map(str::to_string).collect();
            Ok(self.target_payload(json!({
                "annotations": self.leveled_annotations(&levels)?,
            })))
        } else {
            Err(Error::UnknownBakeKind(kind.to_string()))
        }
    }

    /// Combined bake definition carrying tags, labels and the build args.
    pub fn bake_definition_tags_labels(&self) -> Result<Value, Error> {
        Ok(self.target_payload(json!({
            "tags": self.tags(),
            "labels": self.label_map()?,
            "args": self.meta_args(),
        })))
    }
}

/// Fold one proposed value into the accumulator. Empty values contribute
/// nothing at all; `latest` is decided by the first value-producing rule.
fn set_version(mut version: Version, val: String, latest: bool) -> Version {
    if val.is_empty() {
        return version;
    }
    let val = sanitize_tag(&val);
    match &version.main {
        None => version.main = Some(val),
        Some(main) if *main != val && !version.partial.contains(&val) => {
            version.partial.push(val);
        }
        _ => {}
    }
    if version.latest.is_none() {
        version.latest = Some(latest);
    }
    version
}

static INVALID_TAG_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9._-]+").expect("invalid regex"));

/// Collapse every run of characters outside `[A-Za-z0-9._-]` to one hyphen.
pub fn sanitize_tag(tag: &str) -> String {
    INVALID_TAG_CHARS.replace_all(tag, "-").into_owned()
}

/// Apply an optional `match` regex to the source value: capture group 1
/// replaces the value on a match, a non-match keeps the value and warns,
/// and a match without group 1 skips the rule (returns None) with a warning.
fn extract_match(vraw: String, match_expr: &str) -> Result<Option<String>, Error> {
    if match_expr.is_empty() {
        return Ok(Some(vraw));
    }
    let re = Regex::new(match_expr).map_err(|err| Error::InvalidPattern {
        pattern: match_expr.to_string(),
        reason: err.to_string(),
    })?;
    match re.captures(&vraw) {
        None => {
            warn!("{match_expr} does not match {vraw}");
            Ok(Some(vraw))
        }
        Some(caps) => match caps.get(1) {
            Some(group) => Ok(Some(group.as_str().to_string())),
            None => {
                warn!("{match_expr} has no capture group for {vraw}");
                Ok(None)
            }
        },
    }
}

static REGEX_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/(.+)/(.*)$").expect("invalid regex"));

/// A match pattern is either a plain regex or a `/pattern/flags` literal.
fn compile_match_pattern(pattern: &str) -> Result<Regex, Error> {
    let (source, flags) = match REGEX_LITERAL.captures(pattern) {
        Some(caps) => (
            caps.get(1).map_or("", |m| m.as_str()).to_string(),
            caps.get(2).map_or("", |m| m.as_str()).to_string(),
        ),
        None => (pattern.to_string(), String::new()),
    };
    let mut builder = RegexBuilder::new(&source);
    for flag in flags.chars() {
        match flag {
            'i' => {
                builder.case_insensitive(true);
            }
            'm' => {
                builder.multi_line(true);
            }
            's' => {
                builder.dot_matches_new_line(true);
            }
            // Whole-string matching only; the global flag has no effect.
            'g' => {}
            other => {
                return Err(Error::InvalidPattern {
                    pattern: pattern.to_string(),
                    reason: format!("unsupported flag {other:?}"),
                })
            }
        }
    }
    builder.build().map_err(|err| Error::InvalidPattern {
        pattern: pattern.to_string(),
        reason: err.to_string(),
    })
}

fn semver_vars(raw: &str, parsed: &semver::Version) -> BTreeMap<&'static str, String> {
    let version = if parsed.pre.is_empty() {
        format!("{}.{}.{}", parsed.major, parsed.minor, parsed.patch)
    } else {
        format!(
            "{}.{}.{}-{}",
            parsed.major, parsed.minor, parsed.patch, parsed.pre
        )
    };
    BTreeMap::from([
        ("raw", raw.to_string()),
        ("version", version),
        ("major", parsed.major.to_string()),
        ("minor", parsed.minor.to_string()),
        ("patch", parsed.patch.to_string()),
    ])
}

fn pep440_vars(raw: &str, parsed: &pep440::Version) -> BTreeMap<&'static str, String> {
    BTreeMap::from([
        ("raw", raw.to_string()),
        ("version", parsed.to_string()),
        ("major", parsed.major().to_string()),
        ("minor", parsed.minor().to_string()),
        ("patch", parsed.patch().to_string()),
    ])
}

/// Locale-aware-ish key ordering: case-insensitive first, bytewise tie-break.
fn compare_keys(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}
