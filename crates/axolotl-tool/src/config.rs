use std::path::PathBuf;

use axolotl_crypto::SessionConfig;
use serde::Deserialize;

/// Tool configuration, loaded from a TOML file.
#[derive(Debug, Deserialize)]
pub struct ToolConfig {
    /// Sealed store file.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Tracing filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Device id published in bundles.
    #[serde(default = "default_device_id")]
    pub device_id: u32,

    /// Session engine bounds.
    #[serde(default)]
    pub session: SessionConfig,
}

fn default_store_path() -> PathBuf {
    "axolotl-store.bin".into()
}

fn default_log_filter() -> String {
    "axolotl_tool=info,axolotl_crypto=info".into()
}

fn default_device_id() -> u32 {
    1
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            log_filter: default_log_filter(),
            device_id: default_device_id(),
            session: SessionConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = ToolConfig::default();
        assert_eq!(config.store_path, PathBuf::from("axolotl-store.bin"));
        assert_eq!(config.device_id, 1);
        assert_eq!(config.session.max_skipped_keys, 2000);
    }

    #[test]
    fn config_toml_deserialization() {
        let toml = r#"
            store_path = "/var/lib/axolotl/store.bin"
            log_filter = "axolotl_crypto=debug"

            [session]
            max_skipped_keys = 500
            max_forward_jump = 400
            skipped_key_max_age_secs = 86400
        "#;
        let config: ToolConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.store_path, PathBuf::from("/var/lib/axolotl/store.bin"));
        assert_eq!(config.log_filter, "axolotl_crypto=debug");
        assert_eq!(config.device_id, 1);
        assert_eq!(config.session.max_skipped_keys, 500);
        assert_eq!(config.session.max_forward_jump, 400);
        assert_eq!(config.session.max_receiver_chains, 5);
        assert_eq!(config.session.skipped_key_max_age_secs, Some(86400));
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: ToolConfig = toml::from_str("").unwrap();
        assert_eq!(config.log_filter, "axolotl_tool=info,axolotl_crypto=info");
        assert_eq!(config.session, SessionConfig::default());
    }
}
