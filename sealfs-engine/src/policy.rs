//! Authorization source: which principals may access a file.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use sealfs_keystore::{FileId, PrincipalId};

/// View of the sharing subsystem. The engine reads it to decide recipient
/// sets; it never writes to it.
pub trait AccessPolicy: Send + Sync {
    fn authorized_principals(&self, file: &FileId) -> BTreeSet<PrincipalId>;

    fn is_authorized(&self, file: &FileId, principal: &PrincipalId) -> bool {
        self.authorized_principals(file).contains(principal)
    }
}

/// In-process sharing table.
#[derive(Default)]
pub struct MemoryAccessPolicy {
    grants: RwLock<HashMap<FileId, BTreeSet<PrincipalId>>>,
}

impl MemoryAccessPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, file: &FileId, principal: &PrincipalId) {
        let mut grants = self.grants.write().unwrap_or_else(|p| p.into_inner());
        grants.entry(file.clone()).or_default().insert(principal.clone());
    }

    pub fn revoke(&self, file: &FileId, principal: &PrincipalId) {
        let mut grants = self.grants.write().unwrap_or_else(|p| p.into_inner());
        if let Some(set) = grants.get_mut(file) {
            set.remove(principal);
        }
    }

    pub fn remove_file(&self, file: &FileId) {
        let mut grants = self.grants.write().unwrap_or_else(|p| p.into_inner());
        grants.remove(file);
    }
}

impl AccessPolicy for MemoryAccessPolicy {
    fn authorized_principals(&self, file: &FileId) -> BTreeSet<PrincipalId> {
        let grants = self.grants.read().unwrap_or_else(|p| p.into_inner());
        grants.get(file).cloned().unwrap_or_default()
    }
}
