// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Context configuration

use std::path::Path;
use std::time::Duration;

use fs_err as fs;
use serde::{Deserialize, Deserializer};

use crate::constants::TpmAlgId;
use crate::error::{Error, Result};

/// Settings passed to [`crate::TpmContext::open`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// `/dev/...` path, `host:port` of a swtpm command port, or `simulator`.
    /// Unset auto-detects `/dev/tpmrm0` then `/dev/tpm0`.
    pub device: Option<String>,
    /// Bound on every device round trip
    pub timeout_ms: u64,
    /// Persistent session pool size; one device slot stays free for inline sessions
    pub max_persistent_sessions: usize,
    /// Largest sensitive parameter accepted for encryption
    pub max_parameter_size: usize,
    /// Session hashes the device supports
    #[serde(deserialize_with = "hash_algorithms")]
    pub hash_algorithms: Vec<TpmAlgId>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device: None,
            timeout_ms: 30_000,
            max_persistent_sessions: 3,
            max_parameter_size: 1024,
            hash_algorithms: vec![TpmAlgId::Sha256, TpmAlgId::Sha384, TpmAlgId::Sha512],
        }
    }
}

fn hash_algorithms<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<TpmAlgId>, D::Error> {
    let names = Vec::<String>::deserialize(deserializer)?;
    names
        .iter()
        .map(|name| {
            TpmAlgId::from_name(name)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown hash algorithm {name:?}")))
        })
        .collect()
}

impl SessionConfig {
    /// In-process simulator with default limits
    pub fn simulator() -> Self {
        Self {
            device: Some("simulator".into()),
            ..Self::default()
        }
    }

    /// Read a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref()).map_err(|e| Error::config(e.to_string()))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::config(format!("{}: {e}", path.as_ref().display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(Error::config("timeout_ms must be positive"));
        }
        if self.max_persistent_sessions == 0 {
            return Err(Error::config("max_persistent_sessions must be positive"));
        }
        if self.max_parameter_size == 0 || self.max_parameter_size > usize::from(u16::MAX) {
            return Err(Error::config("max_parameter_size must be in 1..=65535"));
        }
        if self.hash_algorithms.is_empty() {
            return Err(Error::config("at least one session hash is required"));
        }
        Ok(())
    }

    /// Whether sessions may use `alg`
    pub fn supports_hash(&self, alg: TpmAlgId) -> bool {
        self.hash_algorithms.contains(&alg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.max_persistent_sessions, 3);
        assert_eq!(config.max_parameter_size, 1024);
        assert!(config.supports_hash(TpmAlgId::Sha384));
        assert!(!config.supports_hash(TpmAlgId::Sha1));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"device": "127.0.0.1:2321", "hash_algorithms": ["sha256"]}"#)
                .unwrap();
        assert_eq!(config.device.as_deref(), Some("127.0.0.1:2321"));
        assert_eq!(config.hash_algorithms, vec![TpmAlgId::Sha256]);
        assert_eq!(config.max_persistent_sessions, 3);
    }

    #[test]
    fn test_unknown_hash_name_is_rejected() {
        let err = serde_json::from_str::<SessionConfig>(r#"{"hash_algorithms": ["md5"]}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_pool() {
        let config = SessionConfig {
            max_persistent_sessions: 0,
            ..SessionConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("tpm2-session-{}.json", std::process::id()));
        fs::write(&path, r#"{"device": "simulator", "max_persistent_sessions": 2}"#).unwrap();
        let config = SessionConfig::load(&path).unwrap();
        assert_eq!(config.max_persistent_sessions, 2);
        assert_eq!(config.max_parameter_size, 1024);

        fs::write(&path, r#"{"timeout_ms": 0}"#).unwrap();
        assert!(matches!(SessionConfig::load(&path), Err(Error::Configuration(_))));
        fs::remove_file(&path).unwrap();

        assert!(matches!(
            SessionConfig::load(&path),
            Err(Error::Configuration(_))
        ));
    }
}
