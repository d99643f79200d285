//! Content configuration: which media plays in which phase
//!
//! ```json
//! {"sponsorLoop": ["a.mp4"], "timeCategories": {"before": [], "during": [], "after": []}}
//! ```

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{error::PlaylistError, phase::Phase};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentConfig {
    #[serde(default)]
    pub sponsor_loop: Vec<String>,

    #[serde(default)]
    pub time_categories: TimeCategories,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeCategories {
    #[serde(default)]
    pub before: Vec<String>,
    #[serde(default)]
    pub during: Vec<String>,
    #[serde(default)]
    pub after: Vec<String>,
}

impl ContentConfig {
    /// The list a phase plays by default; `neutral` plays the sponsor loop.
    pub fn list_for(&self, phase: Phase) -> &[String] {
        match phase {
            Phase::Neutral => &self.sponsor_loop,
            Phase::Before => &self.time_categories.before,
            Phase::During => &self.time_categories.during,
            Phase::After => &self.time_categories.after,
        }
    }

    /// Every category list concatenated in timeline order
    pub fn all_categories(&self) -> Vec<String> {
        let categories = &self.time_categories;
        categories
            .before
            .iter()
            .chain(&categories.during)
            .chain(&categories.after)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
}

/// The content file plus change detection by modification time and length
#[derive(Debug)]
pub struct ContentSource {
    path: PathBuf,
    seen: Option<Fingerprint>,
}

impl ContentSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            seen: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fingerprint(&self) -> Option<Fingerprint> {
        let metadata = std::fs::metadata(&self.path).ok()?;
        Some(Fingerprint {
            modified: metadata.modified().ok(),
            len: metadata.len(),
        })
    }

    /// Read the current configuration. A missing file is an empty configuration.
    pub fn load(&mut self) -> Result<ContentConfig, PlaylistError> {
        self.seen = self.fingerprint();

        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("content file {} does not exist", self.path.display());
                return Ok(ContentConfig::default());
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&content)
            .map_err(|e| PlaylistError::Content(format!("{}: {e}", self.path.display())))
    }

    /// Whether the file changed since the last [`load`](Self::load).
    pub fn changed(&self) -> bool {
        let current = self.fingerprint();
        if current != self.seen {
            debug!("content file {} changed", self.path.display());
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_missing_keys_default_to_empty() {
        let config: ContentConfig =
            serde_json::from_str(r#"{"timeCategories": {"during": ["goal.mp4"]}}"#).unwrap();

        assert!(config.sponsor_loop.is_empty());
        assert_eq!(config.list_for(Phase::During), ["goal.mp4".to_string()]);
        assert!(config.list_for(Phase::Before).is_empty());
    }

    #[test]
    fn test_all_categories_in_timeline_order() {
        let config: ContentConfig = serde_json::from_str(
            r#"{"timeCategories": {"after": ["c"], "before": ["a"], "during": ["b"]}}"#,
        )
        .unwrap();

        assert_eq!(config.all_categories(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_missing_file_is_empty_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = ContentSource::new(dir.path().join("content.json"));

        assert_eq!(source.load().unwrap(), ContentConfig::default());
        assert!(!source.changed());
    }

    #[test]
    fn test_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content.json");
        std::fs::write(&path, "{ nope").unwrap();

        let result = ContentSource::new(&path).load();
        assert!(matches!(result, Err(PlaylistError::Content(_))));
    }

    #[test]
    fn test_change_detection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content.json");
        std::fs::write(&path, r#"{"sponsorLoop": ["a.mp4"]}"#).unwrap();
        let mut source = ContentSource::new(&path);

        source.load().unwrap();
        assert!(!source.changed());

        std::fs::write(&path, r#"{"sponsorLoop": ["a.mp4", "b.mp4"]}"#).unwrap();
        assert!(source.changed());

        source.load().unwrap();
        assert!(!source.changed());
    }
}
