//! Confirmation-policy store.
//!
//! Persists per-capability confirmation requirements across restarts:
//! `.tether/policy.json` maps capability names to whether user approval must
//! precede invocation. The file is read at startup and written when a
//! confirmation decision carries "don't ask again". The store only relaxes
//! the registry's own flag — it never adds a confirmation requirement a
//! capability did not declare.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tether_core::runtime_dir;

const POLICY_FILE: &str = "policy.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    confirmations: BTreeMap<String, bool>,
}

#[derive(Debug)]
pub struct PolicyStore {
    path: PathBuf,
    confirmations: BTreeMap<String, bool>,
}

impl PolicyStore {
    /// Load the store from the workspace runtime dir. A missing or unreadable
    /// file yields an empty store rather than an error.
    pub fn load(workspace: &Path) -> Self {
        let path = runtime_dir(workspace).join(POLICY_FILE);
        let confirmations = fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<PolicyFile>(&raw).ok())
            .map(|file| file.confirmations)
            .unwrap_or_default();
        Self {
            path,
            confirmations,
        }
    }

    /// Whether `capability` still requires confirmation, given the registry's
    /// own flag. A persisted grant clears the requirement; nothing in the
    /// store can impose one.
    #[must_use]
    pub fn requires_confirmation(&self, capability: &str, registry_default: bool) -> bool {
        registry_default
            && self
                .confirmations
                .get(capability)
                .copied()
                .unwrap_or(true)
    }

    /// Record a "don't ask again" grant for `capability` and persist it.
    pub fn remember_approval(&mut self, capability: &str) -> Result<()> {
        self.confirmations.insert(capability.to_string(), false);
        self.save()
    }

    /// Drop any persisted grant for `capability`.
    pub fn forget(&mut self, capability: &str) -> Result<()> {
        self.confirmations.remove(capability);
        self.save()
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = PolicyFile {
            confirmations: self.confirmations.clone(),
        };
        fs::write(&self.path, serde_json::to_vec_pretty(&file)?)?;
        Ok(())
    }
}
