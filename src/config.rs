use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

const DEFAULT_CONFIG: &str = include_str!("../default.toml");

#[derive(Error, Debug)]
pub enum Error {
    #[error("read {path}: {err}")]
    ReadFile { err: std::io::Error, path: String },

    #[error("parse configuration: {0}")]
    Deserialize(#[from] toml::de::Error),
}

/// A meta.toml file.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct File {
    pub description: Option<String>,
    pub license: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub flavor: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub annotations: Vec<String>,
    #[serde(default = "default_bake_target")]
    pub bake_target: String,
    #[serde(default = "default_separator")]
    pub sep_tags: String,
    #[serde(default = "default_separator")]
    pub sep_labels: String,
    #[serde(default = "default_separator")]
    pub sep_annotations: String,
}

fn default_bake_target() -> String {
    "docker-metadata-action".to_string()
}

fn default_separator() -> String {
    "\n".to_string()
}

impl Default for File {
    fn default() -> Self {
        // The default config is compiled into the program, so
        // make sure to test default() to catch panics compile-time.
        toml::from_str(DEFAULT_CONFIG).unwrap()
    }
}

impl File {
    /// Load a user configuration file and merge it over the built-in
    /// defaults. Scalar options win when set; list options win when
    /// non-empty.
    pub fn default_with_user_config_file(path: &Path) -> Result<Self, Error> {
        let data = std::fs::read_to_string(path).map_err(|err| Error::ReadFile {
            err,
            path: path.display().to_string(),
        })?;
        let user: File = toml::from_str(&data)?;
        let defaults = Self::default();
        Ok(Self {
            description: user.description.or(defaults.description),
            license: user.license.or(defaults.license),
            images: non_empty_or(user.images, defaults.images),
            tags: non_empty_or(user.tags, defaults.tags),
            flavor: non_empty_or(user.flavor, defaults.flavor),
            labels: non_empty_or(user.labels, defaults.labels),
            annotations: non_empty_or(user.annotations, defaults.annotations),
            bake_target: user.bake_target,
            sep_tags: user.sep_tags,
            sep_labels: user.sep_labels,
            sep_annotations: user.sep_annotations,
        })
    }
}

fn non_empty_or(value: Vec<String>, fallback: Vec<String>) -> Vec<String> {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}

#[cfg(test)]
pub mod test {
    #[test]
    pub fn load_default_configuration() {
        let cfg = super::File::default();
        assert_eq!(cfg.bake_target, "docker-metadata-action");
        assert_eq!(cfg.tags.len(), 4);
        assert_eq!(cfg.tags[0], "type=schedule");
        assert_eq!(cfg.sep_tags, "\n");
        assert_eq!(cfg.description, None);
    }
}
