//! Filesystem capability used by the metadata store.
//!
//! Generalizes the teacher's `FileSystemProvider` (read-only directory
//! listing for the agent's file tools) into a small read/write/rename
//! surface sufficient for atomic metadata persistence, so the store can be
//! exercised in tests without touching the real disk.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

/// A minimal stand-in for the bits of `std::fs::Metadata` callers actually
/// need: whether the path is a directory, and its size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub is_dir: bool,
    pub len: u64,
}

#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    async fn write(&self, path: &Path, data: &[u8]) -> io::Result<()>;
    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    async fn exists(&self, path: &Path) -> bool;
    async fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    async fn remove_file(&self, path: &Path) -> io::Result<()>;
    async fn stat(&self, path: &Path) -> io::Result<Stat>;

    fn home_dir(&self) -> Option<PathBuf>;
    fn getwd(&self) -> io::Result<PathBuf>;
    fn getenv(&self, key: &str) -> Option<String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsFileSystem;

#[async_trait]
impl FileSystem for OsFileSystem {
    async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }

    async fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        tokio::fs::write(path, data).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        tokio::fs::rename(from, to).await
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    async fn stat(&self, path: &Path) -> io::Result<Stat> {
        let meta = tokio::fs::metadata(path).await?;
        Ok(Stat {
            is_dir: meta.is_dir(),
            len: meta.len(),
        })
    }

    fn home_dir(&self) -> Option<PathBuf> {
        dirs::home_dir()
    }

    fn getwd(&self) -> io::Result<PathBuf> {
        std::env::current_dir()
    }

    fn getenv(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeFileSystem {
        files: Mutex<HashMap<PathBuf, Vec<u8>>>,
        env: Mutex<HashMap<String, String>>,
        cwd: Mutex<PathBuf>,
    }

    impl FakeFileSystem {
        pub fn new() -> Self {
            Self {
                files: Mutex::new(HashMap::new()),
                env: Mutex::new(HashMap::new()),
                cwd: Mutex::new(PathBuf::from("/fake/cwd")),
            }
        }

        pub fn set_env(&self, key: &str, value: &str) {
            #[allow(clippy::unwrap_used)]
            self.env.lock().unwrap().insert(key.to_string(), value.to_string());
        }

        pub fn set_cwd(&self, path: PathBuf) {
            #[allow(clippy::unwrap_used)]
            *self.cwd.lock().unwrap() = path;
        }
    }

    #[async_trait]
    impl FileSystem for FakeFileSystem {
        async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
            #[allow(clippy::unwrap_used)]
            let files = self.files.lock().unwrap();
            files
                .get(path)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
        }

        async fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
            #[allow(clippy::unwrap_used)]
            let mut files = self.files.lock().unwrap();
            files.insert(path.to_path_buf(), data.to_vec());
            Ok(())
        }

        async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
            #[allow(clippy::unwrap_used)]
            let mut files = self.files.lock().unwrap();
            let data = files
                .remove(from)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, from.display().to_string()))?;
            files.insert(to.to_path_buf(), data);
            Ok(())
        }

        async fn exists(&self, path: &Path) -> bool {
            #[allow(clippy::unwrap_used)]
            let files = self.files.lock().unwrap();
            files.contains_key(path)
        }

        async fn create_dir_all(&self, _path: &Path) -> io::Result<()> {
            Ok(())
        }

        async fn remove_file(&self, path: &Path) -> io::Result<()> {
            #[allow(clippy::unwrap_used)]
            let mut files = self.files.lock().unwrap();
            files.remove(path);
            Ok(())
        }

        async fn stat(&self, path: &Path) -> io::Result<Stat> {
            #[allow(clippy::unwrap_used)]
            let files = self.files.lock().unwrap();
            files
                .get(path)
                .map(|data| Stat { is_dir: false, len: data.len() as u64 })
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
        }

        fn home_dir(&self) -> Option<PathBuf> {
            Some(PathBuf::from("/fake/home"))
        }

        fn getwd(&self) -> io::Result<PathBuf> {
            #[allow(clippy::unwrap_used)]
            Ok(self.cwd.lock().unwrap().clone())
        }

        fn getenv(&self, key: &str) -> Option<String> {
            #[allow(clippy::unwrap_used)]
            self.env.lock().unwrap().get(key).cloned()
        }
    }
}
