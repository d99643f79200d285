//! Site credentials known to the registry
//!
//! Stored as `{"sites": {"<siteId>": "<apiKey>"}}`. Issuing a key for a site replaces the
//! previous one; the old key stops validating as soon as the new file is in place.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::info;

use crate::{identity::DeviceIdentity, util::write_atomic_private};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CredentialFile {
    #[serde(default)]
    sites: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    file: CredentialFile,
}

impl CredentialStore {
    /// Load the credential file; a missing file means no site is provisioned yet.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("malformed credentials file: {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CredentialFile::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        Ok(Self { path, file })
    }

    pub fn sites(&self) -> impl Iterator<Item = &str> {
        self.file.sites.keys().map(String::as_str)
    }

    pub fn contains(&self, site_id: &str) -> bool {
        self.file.sites.contains_key(site_id)
    }

    pub fn validate(&self, site_id: &str, api_key: &str) -> bool {
        match self.file.sites.get(site_id) {
            Some(expected) => bool::from(expected.as_bytes().ct_eq(api_key.as_bytes())),
            None => false,
        }
    }

    /// Generate a fresh key for `site_id`, replacing any previous one.
    ///
    /// The in-memory copy only changes once the file write succeeded.
    pub fn issue(&mut self, site_id: &str) -> anyhow::Result<DeviceIdentity> {
        anyhow::ensure!(!site_id.trim().is_empty(), "site id must not be empty");

        let api_key = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        let mut next = self.file.clone();
        let rotated = next
            .sites
            .insert(site_id.to_string(), api_key.clone())
            .is_some();

        let content = serde_json::to_vec_pretty(&next)?;
        write_atomic_private(&self.path, &content)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        self.file = next;

        if rotated {
            info!("rotated api key for {site_id}");
        } else {
            info!("issued api key for {site_id}");
        }
        Ok(DeviceIdentity::new(site_id, api_key))
    }
}
