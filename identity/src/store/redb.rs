//! Redb-backed section store.

use std::path::Path;

use redb::{Database, TableDefinition};

use super::{Section, SectionStore, StoreError};

const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("sections");

fn storage(e: impl std::fmt::Display) -> StoreError {
    StoreError::Io(e.to_string())
}

/// Sections stored as rows of a single redb table, keyed by section name.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create a redb database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = Database::create(path).map_err(storage)?;

        // Create the table so reads on a fresh database succeed.
        let tx = db.begin_write().map_err(storage)?;
        {
            let _ = tx.open_table(TABLE).map_err(storage)?;
        }
        tx.commit().map_err(storage)?;

        Ok(Self { db })
    }
}

impl SectionStore for RedbStore {
    fn load(&self, section: Section) -> Result<Option<Vec<u8>>, StoreError> {
        let tx = self.db.begin_read().map_err(storage)?;
        let table = tx.open_table(TABLE).map_err(storage)?;
        let value = table.get(section.name()).map_err(storage)?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    fn save(&self, section: Section, data: &[u8]) -> Result<(), StoreError> {
        let tx = self.db.begin_write().map_err(storage)?;
        {
            let mut table = tx.open_table(TABLE).map_err(storage)?;
            table.insert(section.name(), data).map_err(storage)?;
        }
        tx.commit().map_err(storage)
    }

    fn remove(&self, section: Section) -> Result<(), StoreError> {
        let tx = self.db.begin_write().map_err(storage)?;
        {
            let mut table = tx.open_table(TABLE).map_err(storage)?;
            table.remove(section.name()).map_err(storage)?;
        }
        tx.commit().map_err(storage)
    }
}
