use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug)]
#[error("{0} does not conform to PEP 440")]
pub struct ParseError(pub String);

// PEP 440 appendix B grammar, scoped to what the pep440 tag rule needs.
static VERSION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)^\s*v?
          (?:(?P<epoch>[0-9]+)!)?
          (?P<release>[0-9]+(?:\.[0-9]+)*)
          (?:[-_.]?(?P<pre_l>alpha|a|beta|b|preview|pre|c|rc)[-_.]?(?P<pre_n>[0-9]+)?)?
          (?:(?:-(?P<post_n1>[0-9]+))|(?:[-_.]?(?P<post_l>post|rev|r)[-_.]?(?P<post_n2>[0-9]+)?))?
          (?:[-_.]?(?P<dev_l>dev)[-_.]?(?P<dev_n>[0-9]+)?)?
          (?:\+(?P<local>[a-zA-Z0-9]+(?:[-_.][a-zA-Z0-9]+)*))?
          \s*$",
    )
    .expect("invalid regex")
});

/// A PEP 440 version, normalized on parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub epoch: u64,
    pub release: Vec<u64>,
    /// Canonical pre-release label ("a", "b" or "rc") and number.
    pub pre: Option<(String, u64)>,
    pub post: Option<u64>,
    pub dev: Option<u64>,
    pub local: Option<String>,
}

impl Version {
    pub fn major(&self) -> u64 {
        self.release.first().copied().unwrap_or(0)
    }

    pub fn minor(&self) -> u64 {
        self.release.get(1).copied().unwrap_or(0)
    }

    pub fn patch(&self) -> u64 {
        self.release.get(2).copied().unwrap_or(0)
    }

    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some() || self.dev.is_some()
    }

    pub fn is_postrelease(&self) -> bool {
        self.post.is_some()
    }

    pub fn is_devrelease(&self) -> bool {
        self.dev.is_some()
    }
}

impl FromStr for Version {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, ParseError> {
        let error = || ParseError(s.to_string());
        let caps = VERSION_PATTERN.captures(s).ok_or_else(error)?;

        let epoch = match caps.name("epoch") {
            Some(m) => m.as_str().parse().map_err(|_| error())?,
            None => 0,
        };
        let release = caps["release"]
            .split('.')
            .map(|part| part.parse().map_err(|_| error()))
            .collect::<Result<Vec<u64>, _>>()?;
        let pre = match caps.name("pre_l") {
            Some(label) => {
                let number = match caps.name("pre_n") {
                    Some(m) => m.as_str().parse().map_err(|_| error())?,
                    None => 0,
                };
                Some((canonical_pre_label(label.as_str()), number))
            }
            None => None,
        };
        let post = match (caps.name("post_n1"), caps.name("post_l")) {
            (Some(m), _) => Some(m.as_str().parse().map_err(|_| error())?),
            (None, Some(_)) => match caps.name("post_n2") {
                Some(m) => Some(m.as_str().parse().map_err(|_| error())?),
                None => Some(0),
            },
            (None, None) => None,
        };
        let dev = match caps.name("dev_l") {
            Some(_) => match caps.name("dev_n") {
                Some(m) => Some(m.as_str().parse().map_err(|_| error())?),
                None => Some(0),
            },
            None => None,
        };
        let local = caps
            .name("local")
            .map(|m| m.as_str().to_lowercase().replace(['-', '_'], "."));

        Ok(Version {
            epoch,
            release,
            pre,
            post,
            dev,
            local,
        })
    }
}

fn canonical_pre_label(label: &str) -> String {
    match label.to_lowercase().as_str() {
        "alpha" | "a" => "a",
        "beta" | "b" => "b",
        _ => "rc",
    }
    .to_string()
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.epoch > 0 {
            write!(f, "{}!", self.epoch)?;
        }
        let release: Vec<String> = self.release.iter().map(u64::to_string).collect();
        write!(f, "{}", release.join("."))?;
        if let Some((label, number)) = &self.pre {
            write!(f, "{label}{number}")?;
        }
        if let Some(number) = self.post {
            write!(f, ".post{number}")?;
        }
        if let Some(number) = self.dev {
            write!(f, ".dev{number}")?;
        }
        if let Some(local) = &self.local {
            write!(f, "+{local}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Version {
        s.parse().unwrap()
    }

    #[test]
    fn parses_release_components() {
        let version = parse("1.2.3");
        assert_eq!(version.major(), 1);
        assert_eq!(version.minor(), 2);
        assert_eq!(version.patch(), 3);
        assert!(!version.is_prerelease());

        let version = parse("2024.4");
        assert_eq!(version.major(), 2024);
        assert_eq!(version.minor(), 4);
        assert_eq!(version.patch(), 0);
    }

    #[test]
    fn normalizes_spellings() {
        assert_eq!(parse("1.0.0alpha1").to_string(), "1.0.0a1");
        assert_eq!(parse("v1.0.0-beta.2").to_string(), "1.0.0b2");
        assert_eq!(parse("1.0.0.preview-4").to_string(), "1.0.0rc4");
        assert_eq!(parse("1.0.0.post").to_string(), "1.0.0.post0");
        assert_eq!(parse("1.0.0-2").to_string(), "1.0.0.post2");
        assert_eq!(parse("1.0.0.DEV1").to_string(), "1.0.0.dev1");
        assert_eq!(parse("1!2.0+ABC_X").to_string(), "1!2.0+abc.x");
        assert_eq!(parse("1.2.3").to_string(), "1.2.3");
    }

    #[test]
    fn classifies_releases() {
        assert!(parse("1.0.0rc1").is_prerelease());
        assert!(parse("1.0.0.dev3").is_prerelease());
        assert!(parse("1.0.0.dev3").is_devrelease());
        assert!(parse("1.0.0.post1").is_postrelease());
        assert!(!parse("1.0.0.post1").is_prerelease());
        assert!(!parse("1.0.0").is_prerelease());
    }

    #[test]
    fn rejects_invalid_versions() {
        assert!("not-a-version".parse::<Version>().is_err());
        assert!("1.0.0-beta.2-rc".parse::<Version>().is_err());
        assert!("".parse::<Version>().is_err());
    }
}
