use std::collections::HashMap;

use parking_lot::Mutex;

use super::{Section, SectionStore, StoreError};

/// In-memory [`SectionStore`] implementation.
/// Data is lost on restart. Suitable for testing or ephemeral use.
#[derive(Default)]
pub struct MemoryStore {
    sections: Mutex<HashMap<Section, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sections currently stored.
    pub fn len(&self) -> usize {
        self.sections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SectionStore for MemoryStore {
    fn load(&self, section: Section) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.sections.lock().get(&section).cloned())
    }

    fn save(&self, section: Section, data: &[u8]) -> Result<(), StoreError> {
        self.sections.lock().insert(section, data.to_vec());
        Ok(())
    }

    fn remove(&self, section: Section) -> Result<(), StoreError> {
        self.sections.lock().remove(&section);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_remove() {
        let store = MemoryStore::new();
        assert!(store.load(Section::Names).unwrap().is_none());

        store.save(Section::Names, b"{}").unwrap();
        assert_eq!(store.load(Section::Names).unwrap(), Some(b"{}".to_vec()));
        assert_eq!(store.len(), 1);

        store.remove(Section::Names).unwrap();
        store.remove(Section::Names).unwrap();
        assert!(store.is_empty());
    }
}
