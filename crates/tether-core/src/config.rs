//! Engine configuration.
//!
//! Settings are layered JSON, deep-merged object-by-object: built-in defaults,
//! then user settings (`~/.tether/settings.json`), then project settings
//! (`.tether/settings.json`), then project-local overrides
//! (`.tether/settings.local.json`). A legacy `config.toml` in the runtime dir
//! is folded in below all JSON layers.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Workspace-local runtime directory (settings, policy store, observe log).
pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".tether")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub timeout_seconds: u64,
    pub max_retries: u8,
    pub retry_base_ms: u64,
    pub max_output_tokens: u32,
    pub temperature: Option<f32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            api_key_env: "TETHER_API_KEY".to_string(),
            timeout_seconds: 60,
            max_retries: 3,
            retry_base_ms: 400,
            max_output_tokens: 8_192,
            temperature: Some(0.2),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Total model context window capacity.
    pub context_window_tokens: u64,
    /// Tokens held back for tool definitions and response headroom.
    pub reserved_for_tools: u64,
    /// Fraction of remaining capacity allotted to history.
    pub target_fraction: f64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            context_window_tokens: 128_000,
            reserved_for_tools: 2_048,
            target_fraction: 0.80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Maximum model exchanges per turn before the loop stops.
    pub max_iterations: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self { max_iterations: 50 }
    }
}

/// Display preferences handed to the render-sink owner. Explicit fields, not
/// process-wide toggles; the engine itself never reads them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiPreferences {
    pub show_tool_output: bool,
    pub show_reasoning: bool,
}

impl Default for UiPreferences {
    fn default() -> Self {
        Self {
            show_tool_output: true,
            show_reasoning: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub llm: LlmConfig,
    pub context: ContextConfig,
    #[serde(rename = "loop")]
    pub turn_loop: LoopConfig,
    pub ui: UiPreferences,
}

impl EngineConfig {
    pub fn user_settings_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".tether/settings.json"))
    }

    pub fn project_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    pub fn project_local_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.local.json")
    }

    pub fn legacy_toml_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("config.toml")
    }

    pub fn load(workspace: &Path) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        let legacy = Self::legacy_toml_path(workspace);
        if legacy.exists() {
            let raw = fs::read_to_string(legacy)?;
            let legacy_cfg: EngineConfig = toml::from_str(&raw)?;
            merge_value(&mut merged, &serde_json::to_value(legacy_cfg)?);
        }

        let mut paths = Vec::new();
        if let Some(user) = Self::user_settings_path() {
            paths.push(user);
        }
        paths.push(Self::project_settings_path(workspace));
        paths.push(Self::project_local_settings_path(workspace));

        for path in paths {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(path)?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            merge_value(&mut merged, &value);
        }

        Ok(serde_json::from_value(merged)?)
    }

    pub fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::project_settings_path(workspace);
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid settings path"))?,
        )?;
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

fn merge_value(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_obj), serde_json::Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_from_empty_workspace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = EngineConfig::load(dir.path()).expect("load");
        assert_eq!(cfg.context.context_window_tokens, 128_000);
        assert_eq!(cfg.turn_loop.max_iterations, 50);
    }

    #[test]
    fn project_settings_override_defaults_field_by_field() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings_dir = runtime_dir(dir.path());
        fs::create_dir_all(&settings_dir).expect("mkdir");
        fs::write(
            settings_dir.join("settings.json"),
            r#"{"context": {"target_fraction": 0.5}, "llm": {"model": "test-model"}}"#,
        )
        .expect("write settings");

        let cfg = EngineConfig::load(dir.path()).expect("load");
        assert_eq!(cfg.context.target_fraction, 0.5);
        assert_eq!(cfg.llm.model, "test-model");
        // Untouched sibling fields keep their defaults.
        assert_eq!(cfg.context.context_window_tokens, 128_000);
        assert_eq!(cfg.llm.max_retries, 3);
    }

    #[test]
    fn local_settings_win_over_project_settings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings_dir = runtime_dir(dir.path());
        fs::create_dir_all(&settings_dir).expect("mkdir");
        fs::write(
            settings_dir.join("settings.json"),
            r#"{"loop": {"max_iterations": 10}}"#,
        )
        .expect("write project");
        fs::write(
            settings_dir.join("settings.local.json"),
            r#"{"loop": {"max_iterations": 7}}"#,
        )
        .expect("write local");

        let cfg = EngineConfig::load(dir.path()).expect("load");
        assert_eq!(cfg.turn_loop.max_iterations, 7);
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = EngineConfig::default();
        cfg.llm.model = "saved-model".to_string();
        cfg.save(dir.path()).expect("save");

        let loaded = EngineConfig::load(dir.path()).expect("load");
        assert_eq!(loaded.llm.model, "saved-model");
    }
}
