//! Device credentials as provisioned by the registry

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{error::IdentityError, util::write_atomic_private};

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub site_id: String,
    pub api_key: String,
}

impl DeviceIdentity {
    pub fn new(site_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            api_key: api_key.into(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, IdentityError> {
        let content = std::fs::read_to_string(path).map_err(|source| IdentityError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let identity: DeviceIdentity =
            serde_json::from_str(&content).map_err(|source| IdentityError::Malformed {
                path: path.to_path_buf(),
                source,
            })?;

        if identity.site_id.trim().is_empty() {
            return Err(IdentityError::Incomplete("siteId"));
        }
        if identity.api_key.is_empty() {
            return Err(IdentityError::Incomplete("apiKey"));
        }
        Ok(identity)
    }

    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        let content = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        write_atomic_private(path, &content)?;
        Ok(())
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("site_id", &self.site_id)
            .field("api_key", &"<redacted>")
            .finish()
    }
}
