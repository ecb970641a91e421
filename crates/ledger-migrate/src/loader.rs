//! Loading migration units from data files.
//!
//! A migrations directory holds one `<timestamp>_<description>.json` file
//! per unit:
//!
//! ```json
//! {
//!   "forward": [
//!     {"op": "add_column", "table": "Publications",
//!      "column": {"name": "Slug", "sql_type": "Text"}}
//!   ],
//!   "reverse": [
//!     {"op": "drop_column", "table": "Publications", "column_name": "Slug"}
//!   ]
//! }
//! ```
//!
//! `reverse` may be omitted when every forward operation has a mechanical
//! inverse.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MigrateError, Result};
use crate::operations::Operation;
use crate::unit::{ordered, validate_name, MigrationUnit};

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct UnitFile {
    forward: Vec<Operation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reverse: Option<Vec<Operation>>,
}

/// Loads every unit in `dir`, sorted by name.
pub fn load_dir(dir: &Path) -> Result<Vec<MigrationUnit>> {
    if !dir.is_dir() {
        return Err(MigrateError::MigrationsDirNotFound(dir.to_path_buf()));
    }

    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let units = paths
        .iter()
        .map(|path| load_file(path))
        .collect::<Result<Vec<_>>>()?;
    ordered(&units)?;
    debug!(dir = %dir.display(), count = units.len(), "Loaded migration units");
    Ok(units)
}

/// Loads one unit; its name is the file stem.
pub fn load_file(path: &Path) -> Result<MigrationUnit> {
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| MigrateError::ParseError {
            path: path.to_path_buf(),
            message: "file name is not valid UTF-8".to_string(),
        })?;

    let content = fs::read_to_string(path)?;
    let file: UnitFile = serde_json::from_str(&content).map_err(|e| MigrateError::ParseError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    match file.reverse {
        Some(reverse) => MigrationUnit::new(name, file.forward, reverse),
        None => MigrationUnit::auto_reversed(name, file.forward),
    }
}

/// Builds `<%Y%m%d%H%M%S>_<slug>` from a free-text description.
pub fn new_unit_name(description: &str, now: DateTime<Utc>) -> Result<String> {
    let mut slug = String::new();
    for c in description.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let slug = slug.trim_end_matches('_');

    let name = format!("{}_{}", now.format("%Y%m%d%H%M%S"), slug);
    validate_name(&name)?;
    Ok(name)
}

/// Writes an empty unit file for `description` into `dir`.
pub fn write_new_unit(dir: &Path, description: &str, now: DateTime<Utc>) -> Result<PathBuf> {
    let name = new_unit_name(description, now)?;
    let path = dir.join(format!("{}.json", name));
    if path.exists() {
        return Err(MigrateError::MigrationExists(path));
    }

    fs::create_dir_all(dir)?;
    let skeleton = UnitFile {
        forward: Vec::new(),
        reverse: Some(Vec::new()),
    };
    fs::write(&path, serde_json::to_string_pretty(&skeleton)? + "\n")?;
    Ok(path)
}
