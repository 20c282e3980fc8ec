use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;

enum Inner {
    Bytes(Vec<u8>),
    Mapped { map: Mmap, path: PathBuf },
}

/// An ELF image held either as an owned buffer (uploaded or downloaded
/// programs) or as a read-only file mapping (programs loaded from disk).
/// Immutable once constructed; clones share the underlying storage.
#[derive(Clone)]
pub struct BinaryStorage(Arc<Inner>);

impl BinaryStorage {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        BinaryStorage(Arc::new(Inner::Bytes(bytes)))
    }

    pub fn map<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        // Safety: the mapping is private and read-only; a concurrent writer
        // to the backing file is outside the engine's contract.
        let map = unsafe { Mmap::map(&file)? };
        Ok(BinaryStorage(Arc::new(Inner::Mapped { map, path: path.as_ref().to_path_buf() })))
    }

    pub fn empty() -> Self {
        BinaryStorage::from_bytes(Vec::new())
    }

    pub fn data(&self) -> &[u8] {
        match &*self.0 {
            Inner::Bytes(b) => b,
            Inner::Mapped { map, .. } => map,
        }
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data().to_vec()
    }

    pub fn path(&self) -> Option<&Path> {
        match &*self.0 {
            Inner::Bytes(_) => None,
            Inner::Mapped { path, .. } => Some(path),
        }
    }

    /// Advise the OS that the mapped pages are not needed soon. No-op for
    /// owned buffers.
    pub fn dontneed(&self) {
        if let Inner::Mapped { map, path } = &*self.0 {
            if let Err(e) = map.advise(memmap2::Advice::DontNeed) {
                log::warn!("madvise(DONTNEED) failed for {:?}: {}", path, e);
            }
        }
    }
}

impl Default for BinaryStorage {
    fn default() -> Self {
        BinaryStorage::empty()
    }
}

impl std::fmt::Debug for BinaryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.0 {
            Inner::Bytes(b) => write!(f, "BinaryStorage::Bytes({} bytes)", b.len()),
            Inner::Mapped { map, path } => {
                write!(f, "BinaryStorage::Mapped({:?}, {} bytes)", path, map.len())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn owned_and_mapped_agree() {
        let bytes = b"\x7fELF-not-really".to_vec();
        let owned = BinaryStorage::from_bytes(bytes.clone());
        assert_eq!(owned.data(), &bytes[..]);
        assert_eq!(owned.len(), bytes.len());

        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&bytes).unwrap();
        let mapped = BinaryStorage::map(f.path()).unwrap();
        assert_eq!(mapped.data(), &bytes[..]);
        assert_eq!(mapped.len(), owned.len());
        mapped.dontneed(); // must not invalidate the mapping for future reads
        assert_eq!(mapped.data(), &bytes[..]);
    }

    #[test]
    fn empty_is_empty() {
        assert!(BinaryStorage::empty().is_empty());
        assert!(BinaryStorage::default().is_empty());
    }
}
