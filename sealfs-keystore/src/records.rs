//! Persisted record model.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use sealfs_crypto::{PassphraseProtectedKey, SealedEnvelope};
use serde::{Deserialize, Serialize};

const RECOVERY_PRINCIPAL: &str = "__recovery__";
const MASTER_PRINCIPAL: &str = "__master__";

/// Identifier of anything that can hold a keypair: a user, the recovery
/// administrator or the system master key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(String);

impl PrincipalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The recovery key's principal.
    pub fn recovery() -> Self {
        Self(RECOVERY_PRINCIPAL.to_string())
    }

    /// The master key's principal.
    pub fn master() -> Self {
        Self(MASTER_PRINCIPAL.to_string())
    }

    /// Whether this is one of the reserved system principals.
    pub fn is_system(&self) -> bool {
        self.0.starts_with("__")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PrincipalId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier of a file as seen by the host storage.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FileId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A principal's keypair: public key in the clear, private key wrapped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredKeypair {
    pub public_key: [u8; 32],
    /// Private key with its algorithm id, KDF parameters and salt.
    pub protected: PassphraseProtectedKey,
    pub created_at: DateTime<Utc>,
}

/// A file key wrapped for one principal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareKeyRecord {
    pub file_id: FileId,
    pub version: u32,
    pub principal: PrincipalId,
    pub envelope: SealedEnvelope,
}

/// System-wide key management mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyMode {
    /// File keys are wrapped for every authorized principal.
    #[default]
    PerUser,
    /// File keys are wrapped for the system master key only.
    MasterKey,
}

impl fmt::Display for KeyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PerUser => f.write_str("per_user"),
            Self::MasterKey => f.write_str("master_key"),
        }
    }
}

/// The per-file version pointer.
///
/// Share key records exist only for `current_version`; moving the pointer
/// and replacing the record set happen in one store call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileKeyMarker {
    pub file_id: FileId,
    pub current_version: u32,
    /// Principal that first wrote the file. Used for recovery opt-out.
    pub owner: PrincipalId,
    /// Mode the current record set was written in.
    pub mode: KeyMode,
    pub updated_at: DateTime<Utc>,
}

/// Progress of one file inside a mode migration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum FileMigrationStatus {
    Pending,
    Done,
    Failed(String),
}

/// A mode migration in progress.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationState {
    pub from: KeyMode,
    pub to: KeyMode,
    pub started_at: DateTime<Utc>,
    pub files: BTreeMap<FileId, FileMigrationStatus>,
}

impl MigrationState {
    pub fn pending(&self) -> impl Iterator<Item = &FileId> {
        self.files
            .iter()
            .filter(|(_, s)| !matches!(s, FileMigrationStatus::Done))
            .map(|(f, _)| f)
    }

    pub fn failed(&self) -> impl Iterator<Item = (&FileId, &str)> {
        self.files.iter().filter_map(|(f, s)| match s {
            FileMigrationStatus::Failed(reason) => Some((f, reason.as_str())),
            _ => None,
        })
    }
}

/// System-wide singleton record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemState {
    pub mode: KeyMode,
    pub migration: Option<MigrationState>,
    pub recovery_enabled: bool,
    /// Owners whose files are not wrapped for the recovery key.
    #[serde(default)]
    pub recovery_opt_out: BTreeSet<PrincipalId>,
}

impl SystemState {
    /// Whether files owned by `owner` get a recovery share key.
    pub fn recovery_applies_to(&self, owner: &PrincipalId) -> bool {
        self.recovery_enabled && !self.recovery_opt_out.contains(owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_principals_are_reserved() {
        assert!(PrincipalId::recovery().is_system());
        assert!(PrincipalId::master().is_system());
        assert!(!PrincipalId::from("alice").is_system());
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let json = serde_json::to_string(&FileId::from("docs/a.txt")).unwrap();
        assert_eq!(json, "\"docs/a.txt\"");
    }

    #[test]
    fn migration_status_roundtrips() {
        let status = FileMigrationStatus::Failed("no session".into());
        let json = serde_json::to_string(&status).unwrap();
        let back: FileMigrationStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
    }

    #[test]
    fn recovery_respects_opt_out() {
        let mut state = SystemState {
            recovery_enabled: true,
            ..Default::default()
        };
        let alice = PrincipalId::from("alice");
        assert!(state.recovery_applies_to(&alice));
        state.recovery_opt_out.insert(alice.clone());
        assert!(!state.recovery_applies_to(&alice));
    }
}
