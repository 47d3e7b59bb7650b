use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("i/o error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("unable to persist bake file: {0}")]
    Persist(#[from] tempfile::PathPersistError),

    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

/// Write a bake definition to a uniquely named JSON file in the system
/// temporary directory and return its path. The file is persisted; callers
/// pass the path to `docker buildx bake --file`.
pub fn write(definition: &serde_json::Value, suffix: Option<&str>) -> Result<PathBuf, Error> {
    let prefix = match suffix {
        Some(suffix) => format!("docker-meta-bake-{suffix}-"),
        None => "docker-meta-bake-".to_string(),
    };
    let file = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".json")
        .tempfile()?;
    std::fs::write(file.path(), serde_json::to_string_pretty(definition)?)?;
    let path = file.into_temp_path().keep()?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn writes_pretty_json_and_persists() {
        let definition = json!({"target": {"docker-metadata-action": {"tags": ["app:dev"]}}});
        let path = write(&definition, Some("tags")).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(path.file_name().unwrap().to_string_lossy().starts_with("docker-meta-bake-tags-"));
        assert!(path.extension().is_some_and(|ext| ext == "json"));
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed, definition);
        // Pretty output, one key per line.
        assert!(contents.contains('\n'));
    }
}
