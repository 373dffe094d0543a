use serde::{Deserialize, Serialize};

use crate::error::SessionFault;

/// Tunable bounds of the session engine.
///
/// None of these are negotiated with the peer; two parties may run with
/// different values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Upper bound on cached out-of-order message keys per session state.
    #[serde(default = "default_max_skipped_keys")]
    pub max_skipped_keys: usize,

    /// How far ahead of its chain a message counter may be before the
    /// message is rejected instead of deriving the gap.
    #[serde(default = "default_max_forward_jump")]
    pub max_forward_jump: u32,

    /// Receiver chains kept per session state.
    #[serde(default = "default_max_receiver_chains")]
    pub max_receiver_chains: usize,

    /// Previous session states kept per record.
    #[serde(default = "default_max_archived_states")]
    pub max_archived_states: usize,

    /// Cached message keys older than this are dropped. Disabled when unset.
    #[serde(default)]
    pub skipped_key_max_age_secs: Option<u64>,
}

fn default_max_skipped_keys() -> usize {
    2000
}

fn default_max_forward_jump() -> u32 {
    2000
}

fn default_max_receiver_chains() -> usize {
    5
}

fn default_max_archived_states() -> usize {
    40
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_skipped_keys: default_max_skipped_keys(),
            max_forward_jump: default_max_forward_jump(),
            max_receiver_chains: default_max_receiver_chains(),
            max_archived_states: default_max_archived_states(),
            skipped_key_max_age_secs: None,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), SessionFault> {
        if self.max_receiver_chains == 0 {
            return Err(SessionFault::InvalidState(
                "max_receiver_chains must be at least 1",
            ));
        }
        if self.max_skipped_keys < self.max_forward_jump as usize {
            return Err(SessionFault::InvalidState(
                "max_skipped_keys must cover max_forward_jump",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = SessionConfig::default();
        assert_eq!(config.max_skipped_keys, 2000);
        assert_eq!(config.max_forward_jump, 2000);
        assert_eq!(config.max_receiver_chains, 5);
        assert_eq!(config.max_archived_states, 40);
        assert_eq!(config.skipped_key_max_age_secs, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_receiver_chains() {
        let config = SessionConfig {
            max_receiver_chains: 0,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_cache_smaller_than_jump() {
        let config = SessionConfig {
            max_skipped_keys: 10,
            max_forward_jump: 100,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
