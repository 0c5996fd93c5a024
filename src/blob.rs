use anyhow::Context;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Where uploaded roster files wait until an ingestion run consumes them.
pub trait BlobStore {
    fn exists(&self, path: &Path) -> bool;
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read>>;
    fn delete(&self, path: &Path) -> io::Result<()>;
}

impl<B: BlobStore + ?Sized> BlobStore for &B {
    fn exists(&self, path: &Path) -> bool {
        (**self).exists(path)
    }
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read>> {
        (**self).open(path)
    }
    fn delete(&self, path: &Path) -> io::Result<()> {
        (**self).delete(path)
    }
}

/// Blob store backed by a directory on disk. Relative paths resolve against
/// the root; absolute paths are used as-is.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }

    /// Copies `src` into the store under `name` and returns the stored path.
    pub fn put_file(&self, src: &Path, name: &str) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.root).with_context(|| {
            format!("failed to create upload directory {}", self.root.to_string_lossy())
        })?;
        let dst = self.root.join(name);
        std::fs::copy(src, &dst).with_context(|| {
            format!(
                "failed to copy {} to {}",
                src.to_string_lossy(),
                dst.to_string_lossy()
            )
        })?;
        Ok(dst)
    }
}

impl BlobStore for LocalBlobStore {
    fn exists(&self, path: &Path) -> bool {
        self.resolve(path).is_file()
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn Read>> {
        let f = File::open(self.resolve(path))?;
        Ok(Box::new(f))
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(self.resolve(path))
    }
}
