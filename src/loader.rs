//! Script and suite-config loader.
//!
//! Finds script files on disk and reads them into [`Script`]s.

use crate::error::LoadError;
use crate::schema::SuiteConfig;
use crate::script::{self, Script};
use std::path::{Path, PathBuf};

/// Suite configuration file names, in lookup order.
pub const SUITE_CONFIG_FILENAMES: [&str; 3] = ["scriptest.yaml", "scriptest.yml", "scriptest.toml"];

/// Extensions recognised as scripts.
pub const SCRIPT_EXTENSIONS: [&str; 2] = ["txt", "txtar"];

fn read(path: &Path) -> Result<String, LoadError> {
    std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Load and parse a script file.
pub fn load_script(path: &Path) -> Result<Script, LoadError> {
    let contents = read(path)?;
    script::parse(&contents).map_err(|source| LoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load suite configuration from a directory.
///
/// Looks for `scriptest.yaml`, `scriptest.yml` or `scriptest.toml`.
/// Returns `None` if none exists, `Err` if one exists but is invalid.
pub fn load_suite_config(dir: &Path) -> Result<Option<SuiteConfig>, LoadError> {
    let Some(config_path) = SUITE_CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
    else {
        return Ok(None);
    };

    let contents = read(&config_path)?;
    let config = match config_path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&contents)?,
        _ => serde_yaml::from_str(&contents)?,
    };
    Ok(Some(config))
}

/// Find all script files in a directory or return the single file.
///
/// Hidden directories (such as `.scriptest` sandboxes) are not searched.
pub fn find_scripts(path: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut scripts = Vec::new();
    collect_scripts_recursive(path, &mut scripts)?;
    scripts.sort();
    Ok(scripts)
}

fn collect_scripts_recursive(dir: &Path, scripts: &mut Vec<PathBuf>) -> Result<(), std::io::Error> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'));

        if path.is_dir() {
            if !hidden {
                collect_scripts_recursive(&path, scripts)?;
            }
        } else if let Some(ext) = path.extension().and_then(|e| e.to_str())
            && SCRIPT_EXTENSIONS.contains(&ext)
        {
            scripts.push(path);
        }
    }
    Ok(())
}

/// Script name used in reports: the path relative to `root` without its
/// extension.
pub fn script_name(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let rel = rel.with_extension("");
    let name = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    if name.is_empty() {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    } else {
        name
    }
}
