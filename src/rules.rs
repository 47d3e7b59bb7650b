use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown tag rule type: {0}")]
    UnknownRuleType(String),

    #[error("unknown attribute {attr:?} for {kind} tag rule")]
    UnknownAttribute { kind: String, attr: String },

    #[error("missing {attr} attribute for {kind} tag rule")]
    MissingAttribute { kind: String, attr: &'static str },

    #[error("invalid {attr} attribute for {kind} tag rule: {value}")]
    InvalidAttribute {
        kind: String,
        attr: &'static str,
        value: String,
    },

    #[error("invalid image entry: {0}")]
    InvalidImage(String),

    #[error("invalid flavor entry: {0}")]
    InvalidFlavor(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefEvent {
    Branch,
    Tag,
    Pr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaFormat {
    Short,
    Long,
}

/// One user-declared derivation rule, dispatched exhaustively by the
/// resolver. Adding a kind is a compile-time-checked change.
#[derive(Debug, Clone, PartialEq)]
pub enum TagKind {
    Schedule {
        pattern: String,
    },
    Semver {
        pattern: String,
        value: String,
        match_expr: String,
    },
    Pep440 {
        pattern: String,
        value: String,
        match_expr: String,
    },
    Match {
        pattern: String,
        value: String,
        group: usize,
    },
    Ref {
        event: RefEvent,
    },
    Edge {
        branch: String,
    },
    Raw {
        value: String,
    },
    Sha {
        format: ShaFormat,
    },
}

/// Attributes valid on every rule kind. `prefix`/`suffix` distinguish
/// absent from explicitly empty: an empty per-rule prefix suppresses the
/// flavor prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct CommonAttrs {
    pub enable: String,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
}

impl Default for CommonAttrs {
    fn default() -> Self {
        Self {
            enable: "true".to_string(),
            prefix: None,
            suffix: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TagRule {
    pub kind: TagKind,
    pub attrs: CommonAttrs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub name: String,
    pub enable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Latest {
    Auto,
    True,
    False,
}

/// Global tag-decoration policy applied across all rules.
#[derive(Debug, Clone, PartialEq)]
pub struct Flavor {
    pub latest: Latest,
    pub prefix: String,
    pub prefix_latest: bool,
    pub suffix: String,
    pub suffix_latest: bool,
}

impl Default for Flavor {
    fn default() -> Self {
        Self {
            latest: Latest::Auto,
            prefix: String::new(),
            prefix_latest: false,
            suffix: String::new(),
            suffix_latest: false,
        }
    }
}

struct Attrs {
    kind: String,
    pairs: Vec<(String, String)>,
}

impl Attrs {
    fn take(&mut self, name: &str) -> Option<String> {
        self.pairs
            .iter()
            .position(|(key, _)| key == name)
            .map(|i| self.pairs.remove(i).1)
    }

    fn require(&mut self, name: &'static str) -> Result<String, Error> {
        self.take(name).ok_or_else(|| Error::MissingAttribute {
            kind: self.kind.clone(),
            attr: name,
        })
    }

    fn invalid(&self, attr: &'static str, value: &str) -> Error {
        Error::InvalidAttribute {
            kind: self.kind.clone(),
            attr,
            value: value.to_string(),
        }
    }

    fn finish(self) -> Result<(), Error> {
        match self.pairs.into_iter().next() {
            Some((attr, _)) => Err(Error::UnknownAttribute {
                kind: self.kind,
                attr,
            }),
            None => Ok(()),
        }
    }
}

pub fn tags(lines: &[String]) -> Result<Vec<TagRule>, Error> {
    lines.iter().map(|line| parse_rule(line)).collect()
}

/// Parse one `type=<kind>,attr=value,...` entry. A bare field is shorthand
/// for the `value` attribute, and a missing `type` means `raw`; plain
/// "v1.0" thus becomes `type=raw,value=v1.0`.
fn parse_rule(line: &str) -> Result<TagRule, Error> {
    let mut kind_name: Option<String> = None;
    let mut pairs: Vec<(String, String)> = Vec::new();
    for field in line.split(',') {
        let field = field.trim();
        if field.is_empty() {
            continue;
        }
        match field.split_once('=') {
            Some(("type", value)) => kind_name = Some(value.trim().to_string()),
            Some((key, value)) => pairs.push((key.trim().to_string(), value.to_string())),
            None => pairs.push(("value".to_string(), field.to_string())),
        }
    }

    let mut attrs = Attrs {
        kind: kind_name.unwrap_or_else(|| "raw".to_string()),
        pairs,
    };
    let common = CommonAttrs {
        enable: attrs.take("enable").unwrap_or_else(|| "true".to_string()),
        prefix: attrs.take("prefix"),
        suffix: attrs.take("suffix"),
    };

    let kind = match attrs.kind.as_str() {
        "schedule" => TagKind::Schedule {
            pattern: attrs.take("pattern").unwrap_or_else(|| "nightly".to_string()),
        },
        "semver" => TagKind::Semver {
            pattern: attrs.require("pattern")?,
            value: attrs.take("value").unwrap_or_default(),
            match_expr: attrs.take("match").unwrap_or_default(),
        },
        "pep440" => TagKind::Pep440 {
            pattern: attrs.require("pattern")?,
            value: attrs.take("value").unwrap_or_default(),
            match_expr: attrs.take("match").unwrap_or_default(),
        },
        "match" => TagKind::Match {
            pattern: attrs.require("pattern")?,
            value: attrs.take("value").unwrap_or_default(),
            group: match attrs.take("group") {
                Some(group) => group
                    .trim()
                    .parse()
                    .map_err(|_| attrs.invalid("group", &group))?,
                None => 0,
            },
        },
        "ref" => TagKind::Ref {
            event: match attrs.require("event")?.as_str() {
                "branch" => RefEvent::Branch,
                "tag" => RefEvent::Tag,
                "pr" => RefEvent::Pr,
                other => return Err(attrs.invalid("event", other)),
            },
        },
        "edge" => TagKind::Edge {
            branch: attrs.take("branch").unwrap_or_default(),
        },
        "raw" => TagKind::Raw {
            value: attrs.require("value")?,
        },
        "sha" => TagKind::Sha {
            format: match attrs.take("format").as_deref() {
                None | Some("short") => ShaFormat::Short,
                Some("long") => ShaFormat::Long,
                Some(other) => return Err(attrs.invalid("format", other)),
            },
        },
        other => return Err(Error::UnknownRuleType(other.to_string())),
    };
    attrs.finish()?;

    Ok(TagRule { kind, attrs: common })
}

pub fn images(lines: &[String]) -> Result<Vec<Image>, Error> {
    lines.iter().map(|line| parse_image(line)).collect()
}

fn parse_image(line: &str) -> Result<Image, Error> {
    if !line.contains('=') {
        return Ok(Image {
            name: line.trim().to_string(),
            enable: true,
        });
    }
    let mut name = None;
    let mut enable = true;
    for field in line.split(',') {
        let field = field.trim();
        if field.is_empty() {
            continue;
        }
        match field.split_once('=') {
            Some(("name", value)) => name = Some(value.trim().to_string()),
            Some(("enable", "true")) => enable = true,
            Some(("enable", "false")) => enable = false,
            _ => return Err(Error::InvalidImage(field.to_string())),
        }
    }
    match name {
        Some(name) => Ok(Image { name, enable }),
        None => Err(Error::InvalidImage(line.to_string())),
    }
}

enum Decorated {
    Prefix,
    Suffix,
}

pub fn flavor(lines: &[String]) -> Result<Flavor, Error> {
    let mut flavor = Flavor::default();
    for line in lines {
        // `onlatest` binds to the prefix/suffix declared earlier on the
        // same line, e.g. "prefix=v-,onlatest=true".
        let mut onlatest_for = None;
        for field in line.split(',') {
            let field = field.trim();
            if field.is_empty() {
                continue;
            }
            let Some((key, value)) = field.split_once('=') else {
                return Err(Error::InvalidFlavor(field.to_string()));
            };
            match key.trim() {
                "latest" => {
                    flavor.latest = match value {
                        "auto" => Latest::Auto,
                        "true" => Latest::True,
                        "false" => Latest::False,
                        _ => return Err(Error::InvalidFlavor(field.to_string())),
                    }
                }
                "prefix" => {
                    flavor.prefix = value.to_string();
                    onlatest_for = Some(Decorated::Prefix);
                }
                "suffix" => {
                    flavor.suffix = value.to_string();
                    onlatest_for = Some(Decorated::Suffix);
                }
                "onlatest" => {
                    let on = match value {
                        "true" => true,
                        "false" => false,
                        _ => return Err(Error::InvalidFlavor(field.to_string())),
                    };
                    match onlatest_for {
                        Some(Decorated::Prefix) => flavor.prefix_latest = on,
                        Some(Decorated::Suffix) => flavor.suffix_latest = on,
                        None => return Err(Error::InvalidFlavor(field.to_string())),
                    }
                }
                _ => return Err(Error::InvalidFlavor(field.to_string())),
            }
        }
    }
    Ok(flavor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_default_rule_set() {
        let rules = tags(&lines(&[
            "type=schedule",
            "type=ref,event=branch",
            "type=ref,event=tag",
            "type=ref,event=pr",
        ]))
        .unwrap();
        assert_eq!(rules.len(), 4);
        assert_eq!(
            rules[0].kind,
            TagKind::Schedule {
                pattern: "nightly".to_string()
            }
        );
        assert_eq!(rules[1].kind, TagKind::Ref { event: RefEvent::Branch });
        assert_eq!(rules[2].kind, TagKind::Ref { event: RefEvent::Tag });
        assert_eq!(rules[3].kind, TagKind::Ref { event: RefEvent::Pr });
        assert_eq!(rules[0].attrs.enable, "true");
    }

    #[test]
    fn parse_raw_shorthand() {
        let rules = tags(&lines(&["v1.0"])).unwrap();
        assert_eq!(
            rules[0].kind,
            TagKind::Raw {
                value: "v1.0".to_string()
            }
        );

        let rules = tags(&lines(&["v1.0,enable=false"])).unwrap();
        assert_eq!(rules[0].attrs.enable, "false");
    }

    #[test]
    fn parse_semver_rule() {
        let rules = tags(&lines(&["type=semver,pattern={{major}}.{{minor}},value=v1.2.3"])).unwrap();
        assert_eq!(
            rules[0].kind,
            TagKind::Semver {
                pattern: "{{major}}.{{minor}}".to_string(),
                value: "v1.2.3".to_string(),
                match_expr: String::new(),
            }
        );
    }

    #[test]
    fn parse_keeps_prefix_absence_distinct_from_empty() {
        let rules = tags(&lines(&["type=sha", "type=sha,prefix="])).unwrap();
        assert_eq!(rules[0].attrs.prefix, None);
        assert_eq!(rules[1].attrs.prefix, Some(String::new()));
    }

    #[test]
    fn parse_rejects_unknown_type_and_attributes() {
        assert!(matches!(
            tags(&lines(&["type=bogus"])),
            Err(Error::UnknownRuleType(_))
        ));
        assert!(matches!(
            tags(&lines(&["type=sha,pattern=x"])),
            Err(Error::UnknownAttribute { .. })
        ));
        assert!(matches!(
            tags(&lines(&["type=semver"])),
            Err(Error::MissingAttribute { .. })
        ));
        assert!(matches!(
            tags(&lines(&["type=match,pattern=v(.*),group=one"])),
            Err(Error::InvalidAttribute { .. })
        ));
    }

    #[test]
    fn parse_images() {
        let images = images(&lines(&[
            "moby/buildkit",
            "name=ghcr.io/moby/Buildkit,enable=false",
        ]))
        .unwrap();
        assert_eq!(
            images[0],
            Image {
                name: "moby/buildkit".to_string(),
                enable: true
            }
        );
        assert_eq!(
            images[1],
            Image {
                name: "ghcr.io/moby/Buildkit".to_string(),
                enable: false
            }
        );
    }

    #[test]
    fn parse_flavor() {
        let flavor = flavor(&lines(&[
            "latest=false",
            "prefix=v-,onlatest=true",
            "suffix=-alpine",
        ]))
        .unwrap();
        assert_eq!(flavor.latest, Latest::False);
        assert_eq!(flavor.prefix, "v-");
        assert!(flavor.prefix_latest);
        assert_eq!(flavor.suffix, "-alpine");
        assert!(!flavor.suffix_latest);
    }

    #[test]
    fn parse_flavor_rejects_unknown_entries() {
        assert!(flavor(&lines(&["latest=sometimes"])).is_err());
        assert!(flavor(&lines(&["onlatest=true"])).is_err());
        assert!(flavor(&lines(&["shiny=true"])).is_err());
    }
}
