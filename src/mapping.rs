//! Tunnel mapping file: a JSON array of rules, with whole-line `#` comments
//! allowed. Loaded once at startup and replaced wholesale on reload.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Forwarding {
    pub local_port: u16,
    pub device_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelRule {
    pub udid: String,
    #[serde(default)]
    pub name: Option<String>,
    pub forwarding: Vec<Forwarding>,
}

/// Immutable index from UDID to its tunnel rule. Duplicate UDIDs are not an
/// error; a later entry overwrites an earlier one.
#[derive(Debug, Clone)]
pub struct MappingIndex {
    path: PathBuf,
    rules: HashMap<String, TunnelRule>,
}

impl MappingIndex {
    /// Read and parse a mapping file.
    pub fn load(path: &Path) -> Result<Self> {
        let fail = |reason: String| AppError::MappingFile {
            path: path.to_path_buf(),
            reason,
        };

        let text = std::fs::read_to_string(path)
            .map_err(|e| fail(format!("cannot read file: {}", e)))?;

        let stripped: String = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.starts_with('#'))
            .collect::<Vec<_>>()
            .join("\n");

        // A file of nothing but comments and blank lines is an empty mapping.
        if stripped.trim().is_empty() {
            debug!(path = ?path.display().to_string(), "mapping file is empty");
            return Ok(Self {
                path: path.to_path_buf(),
                rules: HashMap::new(),
            });
        }

        let parsed: serde_json::Value = serde_json::from_str(&stripped)
            .map_err(|e| fail(format!("invalid JSON: {}", e)))?;

        let entries = parsed
            .as_array()
            .ok_or_else(|| fail("top-level JSON value must be an array".to_string()))?;

        let mut rules = HashMap::new();
        for entry in entries {
            let rule: TunnelRule = serde_json::from_value(entry.clone()).map_err(|e| {
                fail(format!(
                    "{} in entry {}",
                    e,
                    serde_json::to_string_pretty(entry).unwrap_or_default()
                ))
            })?;
            validate_rule(&rule).map_err(|reason| {
                fail(format!(
                    "{} in entry {}",
                    reason,
                    serde_json::to_string_pretty(entry).unwrap_or_default()
                ))
            })?;
            rules.insert(rule.udid.clone(), rule);
        }

        debug!(
            path = ?path.display().to_string(),
            devices = ?rules.len(),
            "mapping loaded"
        );
        Ok(Self {
            path: path.to_path_buf(),
            rules,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn get(&self, udid: &str) -> Option<&TunnelRule> {
        self.rules.get(udid)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> impl Iterator<Item = &TunnelRule> {
        self.rules.values()
    }
}

fn validate_rule(rule: &TunnelRule) -> std::result::Result<(), String> {
    if rule.udid.is_empty() {
        return Err("field `udid` must not be empty".into());
    }
    if rule.forwarding.is_empty() {
        return Err("field `forwarding` must not be empty".into());
    }
    for forwarding in &rule.forwarding {
        if forwarding.local_port == 0 {
            return Err("field `local_port` must be in 1..=65535".into());
        }
        if forwarding.device_port == 0 {
            return Err("field `device_port` must be in 1..=65535".into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_mapping(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_with_comments_and_nickname() {
        let file = write_mapping(concat!(
            "# tunnels for the CI rack\n",
            "[{\"udid\":\"9cdfaceca\", \"name\":\"i11\",\n",
            "  # trailing rack notes\n",
            "  \"forwarding\":[{\"local_port\":2000,\"device_port\":22},\n",
            "                {\"local_port\":3000,\"device_port\":1122}]}]\n",
        ));

        let index = MappingIndex::load(file.path()).unwrap();
        assert_eq!(index.len(), 1);
        let rule = index.get("9cdfaceca").unwrap();
        assert_eq!(rule.name.as_deref(), Some("i11"));
        assert_eq!(rule.forwarding.len(), 2);
        assert_eq!(rule.forwarding[0].local_port, 2000);
        assert_eq!(rule.forwarding[1].device_port, 1122);
    }

    #[test]
    fn test_comment_only_file_is_empty_index() {
        let file = write_mapping("# nothing here\n\n   # still nothing\n");
        let index = MappingIndex::load(file.path()).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn test_missing_forwarding_names_the_field() {
        let file = write_mapping("[{\"udid\":\"AAA\"}]");
        match MappingIndex::load(file.path()) {
            Err(AppError::MappingFile { reason, .. }) => {
                assert!(reason.contains("forwarding"), "reason: {}", reason);
                assert!(reason.contains("AAA"), "reason should quote the entry");
            }
            other => panic!("expected MappingFileError, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_empty_forwarding_list_is_rejected() {
        let file = write_mapping("[{\"udid\":\"AAA\",\"forwarding\":[]}]");
        match MappingIndex::load(file.path()) {
            Err(AppError::MappingFile { reason, .. }) => {
                assert!(reason.contains("forwarding"), "reason: {}", reason);
            }
            other => panic!("expected MappingFileError, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_zero_port_is_rejected() {
        let file = write_mapping(
            "[{\"udid\":\"AAA\",\"forwarding\":[{\"local_port\":0,\"device_port\":22}]}]",
        );
        match MappingIndex::load(file.path()) {
            Err(AppError::MappingFile { reason, .. }) => {
                assert!(reason.contains("local_port"), "reason: {}", reason);
            }
            other => panic!("expected MappingFileError, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_top_level_object_is_rejected() {
        let file = write_mapping("{\"udid\":\"AAA\"}");
        match MappingIndex::load(file.path()) {
            Err(AppError::MappingFile { reason, .. }) => {
                assert!(reason.contains("array"), "reason: {}", reason);
            }
            other => panic!("expected MappingFileError, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_invalid_json_reports_parser_message() {
        let file = write_mapping("[{\"udid\":\"AAA\",]");
        match MappingIndex::load(file.path()) {
            Err(AppError::MappingFile { reason, .. }) => {
                assert!(reason.contains("invalid JSON"), "reason: {}", reason);
            }
            other => panic!("expected MappingFileError, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_duplicate_udid_last_entry_wins() {
        let file = write_mapping(concat!(
            "[{\"udid\":\"AAA\",\"forwarding\":[{\"local_port\":2000,\"device_port\":22}]},\n",
            " {\"udid\":\"AAA\",\"forwarding\":[{\"local_port\":3000,\"device_port\":23}]}]",
        ));
        let index = MappingIndex::load(file.path()).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("AAA").unwrap().forwarding[0].local_port, 3000);
    }

    #[test]
    fn test_unreadable_file_is_mapping_error() {
        match MappingIndex::load(Path::new("/nonexistent/mapping.json")) {
            Err(AppError::MappingFile { reason, .. }) => {
                assert!(reason.contains("cannot read"), "reason: {}", reason);
            }
            other => panic!("expected MappingFileError, got {:?}", other.err()),
        }
    }
}
