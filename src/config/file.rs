//! Configuration file management
//!
//! Handles finding configuration files and telling YAML from JSON.

use std::path::{Path, PathBuf};

/// Configuration file locations (in order of precedence)
pub const CONFIG_LOCATIONS: &[&str] = &[
    "./batchtest.yaml",
    "./batchtest.yml",
    "./.batchtest.yaml",
    "~/.config/batchtest/config.yaml",
];

/// Find configuration file in standard locations
pub fn find_config() -> Option<PathBuf> {
    find_in(CONFIG_LOCATIONS)
}

fn find_in(locations: &[&str]) -> Option<PathBuf> {
    locations
        .iter()
        .map(|location| expand_path(location))
        .find(|path| path.exists())
}

/// Expand ~ to home directory
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Check if file is YAML based on extension
pub fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .map(|e| e == "yaml" || e == "yml")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_expand_path() {
        let path = expand_path("./test.yaml");
        assert_eq!(path, PathBuf::from("./test.yaml"));

        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_path("~/x/y.yaml"), home.join("x/y.yaml"));
        }
    }

    #[test]
    fn test_is_yaml_file() {
        assert!(is_yaml_file(Path::new("suite.yaml")));
        assert!(is_yaml_file(Path::new("dir/suite.yml")));
        assert!(!is_yaml_file(Path::new("suite.json")));
        assert!(!is_yaml_file(Path::new("yaml")));
    }

    #[test]
    fn test_find_in_order() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("a.yaml");
        let second = dir.path().join("b.yaml");
        std::fs::write(&second, "workers: 2\n").unwrap();

        let locations = [
            first.to_str().unwrap(),
            second.to_str().unwrap(),
        ];
        assert_eq!(find_in(&locations), Some(second.clone()));

        std::fs::write(&first, "workers: 1\n").unwrap();
        assert_eq!(find_in(&locations), Some(first));
    }
}
