//! Engine configuration.

use std::path::Path;
use std::time::Duration;

use sealfs_crypto::{DEFAULT_BLOCK_SIZE, KdfParams, MAX_BLOCK_SIZE};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// What happens to a file's keys when a recipient loses access.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevokePolicy {
    /// New file key version, content re-encrypted, old version deleted.
    #[default]
    Hard,
    /// Only the revoked principal's share key is deleted.
    Lazy,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Plaintext bytes per content block.
    pub block_size: usize,

    /// Argon2id parameters for new private key wrappings.
    pub kdf: KdfParams,

    pub revoke_policy: RevokePolicy,

    /// Unlocked sessions lock themselves after this many idle seconds.
    pub session_idle_timeout_secs: Option<u64>,

    /// Retries for transient host storage errors.
    pub io_retries: u32,

    /// Minimum login secret length.
    pub min_secret_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            kdf: KdfParams::default(),
            revoke_policy: RevokePolicy::Hard,
            session_idle_timeout_secs: Some(30 * 60),
            io_retries: 3,
            min_secret_len: 8,
        }
    }
}

impl EngineConfig {
    /// Cheap KDF and small blocks for tests.
    pub fn testing() -> Self {
        Self {
            block_size: 64,
            kdf: KdfParams::testing(),
            session_idle_timeout_secs: None,
            min_secret_len: 3,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(EngineError::Config(format!(
                "block_size must be within 1..={MAX_BLOCK_SIZE}, got {}",
                self.block_size
            )));
        }
        if self.kdf.iterations == 0 || self.kdf.parallelism == 0 {
            return Err(EngineError::Config(
                "kdf iterations and parallelism must be non-zero".to_string(),
            ));
        }
        if self.session_idle_timeout_secs == Some(0) {
            return Err(EngineError::Config(
                "session_idle_timeout_secs must be non-zero when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn session_idle_timeout(&self) -> Option<Duration> {
        self.session_idle_timeout_secs.map(Duration::from_secs)
    }
}
