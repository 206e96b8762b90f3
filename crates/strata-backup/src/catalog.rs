//! Persistent catalog of backup and restore records.
//!
//! Records are stored as JSON in a sled tree, keyed by `backup:<id>` and
//! `restore:<id>`.

use std::path::Path;

use strata_core::model::{BackupInfo, RestoreInfo};

use crate::error::CatalogError;

const BACKUP_PREFIX: &[u8] = b"backup:";
const RESTORE_PREFIX: &[u8] = b"restore:";

/// Catalog of [`BackupInfo`] and [`RestoreInfo`] records.
#[derive(Clone)]
pub struct BackupCatalog {
    tree: sled::Tree,
}

impl BackupCatalog {
    /// Tree name for catalog records.
    pub const TREE_NAME: &'static str = "strata:catalog";

    /// Open or create the catalog in an existing sled database.
    pub fn open(db: &sled::Db) -> Result<Self, CatalogError> {
        let tree = db.open_tree(Self::TREE_NAME)?;
        Ok(Self { tree })
    }

    /// Open a sled database at `path` and the catalog inside it.
    pub fn open_path(path: &Path) -> Result<Self, CatalogError> {
        let db = sled::open(path)?;
        Self::open(&db)
    }

    /// A catalog in a temporary database, removed on drop.
    pub fn temporary() -> Result<Self, CatalogError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::open(&db)
    }

    fn key(prefix: &[u8], id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(prefix.len() + id.len());
        key.extend_from_slice(prefix);
        key.extend_from_slice(id.as_bytes());
        key
    }

    /// Insert or replace a backup record.
    pub fn save_backup(&self, info: &BackupInfo) -> Result<(), CatalogError> {
        let value = serde_json::to_vec(info)?;
        self.tree.insert(Self::key(BACKUP_PREFIX, &info.backup_id), value)?;
        self.tree.flush()?;
        Ok(())
    }

    /// Load a backup record.
    pub fn get_backup(&self, backup_id: &str) -> Result<Option<BackupInfo>, CatalogError> {
        match self.tree.get(Self::key(BACKUP_PREFIX, backup_id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove a backup record. Returns whether it existed.
    pub fn remove_backup(&self, backup_id: &str) -> Result<bool, CatalogError> {
        let removed = self.tree.remove(Self::key(BACKUP_PREFIX, backup_id))?;
        self.tree.flush()?;
        Ok(removed.is_some())
    }

    /// All backup records, in key order.
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>, CatalogError> {
        let mut backups = Vec::new();
        for result in self.tree.scan_prefix(BACKUP_PREFIX) {
            let (_, value) = result?;
            backups.push(serde_json::from_slice(&value)?);
        }
        Ok(backups)
    }

    /// Insert or replace a restore record.
    pub fn save_restore(&self, info: &RestoreInfo) -> Result<(), CatalogError> {
        let value = serde_json::to_vec(info)?;
        self.tree.insert(Self::key(RESTORE_PREFIX, &info.restore_id), value)?;
        self.tree.flush()?;
        Ok(())
    }

    /// All restore records, oldest first.
    pub fn list_restores(&self) -> Result<Vec<RestoreInfo>, CatalogError> {
        let mut restores: Vec<RestoreInfo> = Vec::new();
        for result in self.tree.scan_prefix(RESTORE_PREFIX) {
            let (_, value) = result?;
            restores.push(serde_json::from_slice(&value)?);
        }
        restores.sort_by_key(|r| r.started_at);
        Ok(restores)
    }
}

impl std::fmt::Debug for BackupCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupCatalog")
            .field("tree", &Self::TREE_NAME)
            .field("len", &self.tree.len())
            .finish()
    }
}
