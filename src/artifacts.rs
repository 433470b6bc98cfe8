use std::fs;

use camino::Utf8Path;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::MigrateError;

pub const CITY_DATASETS_FILE: &str = "datasets_by_city.json";
pub const GROUP_EXPORT_FILE: &str = "group_dataset.json";
pub const DATASET_TAGS_FILE: &str = "dataset_tags.json";
pub const TAG_LIST_FILE: &str = "tags.json";

/// Writes `value` as two-space indented UTF-8 JSON. Non-ASCII text is kept
/// literally. The file is replaced atomically.
pub fn write_json<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), MigrateError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| MigrateError::Filesystem(format!("create {parent}: {err}")))?;

    let content = serde_json::to_vec_pretty(value)
        .map_err(|err| MigrateError::Filesystem(err.to_string()))?;

    let tmp_path = path.with_extension("json.tmp");
    fs::write(tmp_path.as_std_path(), &content)
        .map_err(|err| MigrateError::Filesystem(format!("write {tmp_path}: {err}")))?;
    fs::rename(tmp_path.as_std_path(), path.as_std_path())
        .map_err(|err| MigrateError::Filesystem(format!("rename {tmp_path} -> {path}: {err}")))?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<T, MigrateError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| MigrateError::Filesystem(format!("read {path}: {err}")))?;
    serde_json::from_str(&content)
        .map_err(|err| MigrateError::Filesystem(format!("parse {path}: {err}")))
}
