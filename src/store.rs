use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::{Builder, TempDir};

use crate::domain::{EntityId, FileTag, Identity};
use crate::error::MirrorError;

#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

impl Store {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn soft_dir(&self) -> Utf8PathBuf {
        self.root.join("gse_soft")
    }

    pub fn member_dir(&self) -> Utf8PathBuf {
        self.root.join("idats")
    }

    pub fn durable_dir_for(&self, identity: &Identity) -> Utf8PathBuf {
        if identity.tag == FileTag::Soft {
            self.soft_dir()
        } else {
            self.member_dir()
        }
    }

    pub fn temp_root(&self) -> Utf8PathBuf {
        self.root.join("temp")
    }

    pub fn ledger_dir(&self) -> Utf8PathBuf {
        self.root.join("ledger")
    }

    pub fn equery_dir(&self) -> Utf8PathBuf {
        self.root.join("equery")
    }

    pub fn converted_dir(&self) -> Utf8PathBuf {
        self.root.join("gse_converted")
    }

    pub fn refs_path(&self) -> Utf8PathBuf {
        self.root.join("refs.json")
    }

    pub fn ensure_layout(&self) -> Result<(), MirrorError> {
        for dir in [
            self.soft_dir(),
            self.member_dir(),
            self.temp_root(),
            self.ledger_dir(),
            self.equery_dir(),
        ] {
            fs::create_dir_all(dir.as_std_path())
                .map_err(|err| MirrorError::Filesystem(format!("create {dir}: {err}")))?;
        }
        Ok(())
    }

    pub fn scratch(&self) -> Result<RunScratch, MirrorError> {
        let temp_root = self.temp_root();
        fs::create_dir_all(temp_root.as_std_path())
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        let dir = Builder::new()
            .prefix("geo-mirror-run")
            .tempdir_in(temp_root.as_std_path())
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .map_err(|_| MirrorError::Filesystem("invalid temp dir".to_string()))?;
        Ok(RunScratch { dir, path })
    }

    pub fn promote(
        source: &Utf8Path,
        dir: &Utf8Path,
        file_name: &str,
    ) -> Result<Utf8PathBuf, MirrorError> {
        fs::create_dir_all(dir.as_std_path())
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        let dest = dir.join(file_name);
        if dest.as_std_path().exists() {
            return Err(MirrorError::Filesystem(format!(
                "refusing to overwrite durable file {dest}"
            )));
        }
        if fs::rename(source.as_std_path(), dest.as_std_path()).is_err() {
            // Scratch on another filesystem.
            Self::copy_file_atomic(source, &dest)?;
            fs::remove_file(source.as_std_path())
                .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        }
        Ok(dest)
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), MirrorError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        }
        let tmp_path = path.with_extension("tmp");
        fs::write(tmp_path.as_std_path(), content)
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn copy_file_atomic(source: &Utf8Path, dest: &Utf8Path) -> Result<(), MirrorError> {
        let parent = dest
            .parent()
            .ok_or_else(|| MirrorError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        let temp = Builder::new()
            .prefix("geo-mirror-file")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        fs::copy(source.as_std_path(), temp.path())
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        temp.persist_noclobber(dest.as_std_path())
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct RunScratch {
    dir: TempDir,
    path: Utf8PathBuf,
}

impl RunScratch {
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn task_dir(&self, entity: &EntityId) -> Result<TempDir, MirrorError> {
        Builder::new()
            .prefix(&format!("{}-", entity.as_str()))
            .tempdir_in(self.dir.path())
            .map_err(|err| MirrorError::Filesystem(err.to_string()))
    }
}

#[derive(Debug, Default)]
pub struct IdentityLocks {
    locks: Mutex<HashMap<Identity, Arc<Mutex<()>>>>,
}

impl IdentityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self, identity: &Identity) -> Result<Arc<Mutex<()>>, MirrorError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| MirrorError::Filesystem("identity lock table poisoned".to_string()))?;
        Ok(Arc::clone(locks.entry(identity.clone()).or_default()))
    }
}
