use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use super::{Section, SectionStore, StoreError};

/// One file per section inside a data directory.
///
/// Writes go to a temporary file that is renamed over the target, so a
/// crash mid-write leaves the previous version in place.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    /// Opens a store rooted at `root`, creating the directory if needed.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| io_error(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, section: Section) -> PathBuf {
        self.root.join(section.file_name())
    }
}

fn io_error(path: &Path, e: io::Error) -> StoreError {
    StoreError::Io(format!("{}: {e}", path.display()))
}

impl SectionStore for DirStore {
    fn load(&self, section: Section) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path(section);
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    fn save(&self, section: Section, data: &[u8]) -> Result<(), StoreError> {
        let path = self.path(section);
        let tmp = path.with_extension("tmp");
        let write = || -> io::Result<()> {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(data)?;
            f.sync_all()?;
            fs::rename(&tmp, &path)
        };
        write().map_err(|e| io_error(&path, e))
    }

    fn remove(&self, section: Section) -> Result<(), StoreError> {
        let path = self.path(section);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_section_is_none() {
        let dir = tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();
        assert!(store.load(Section::Entities).unwrap().is_none());
        store.remove(Section::Entities).unwrap();
    }

    #[test]
    fn save_overwrites_and_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let store = DirStore::open(dir.path().join("data")).unwrap();

        store.save(Section::Names, b"one").unwrap();
        store.save(Section::Names, b"two").unwrap();
        assert_eq!(store.load(Section::Names).unwrap(), Some(b"two".to_vec()));

        let files: Vec<String> = fs::read_dir(store.root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(files, vec!["cluster_names.json".to_string()]);
    }

    #[test]
    fn sections_are_independent() {
        let dir = tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();
        store.save(Section::Orphans, b"o").unwrap();
        store.save(Section::Constraints, b"c").unwrap();
        store.remove(Section::Orphans).unwrap();
        assert!(store.load(Section::Orphans).unwrap().is_none());
        assert_eq!(store.load(Section::Constraints).unwrap(), Some(b"c".to_vec()));
    }
}
