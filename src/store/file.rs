//! Filesystem-backed store: one `<key>.msg` file per record

use super::{Store, StoreError};
use crate::packet::Packet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

const MSG_EXT: &str = "msg";
const BKP_EXT: &str = "bkp";

/// Durable store keeping each record in its own file
///
/// Overwriting a record first copies the current file to `<key>.bkp`, writes
/// the new `<key>.msg`, then removes the backup. [`FileStore::open`] promotes
/// any leftover backup over its `.msg` file, so a crash in the middle of an
/// overwrite always leaves a complete record behind.
///
/// The store owns every `.msg` and `.bkp` file in its directory:
/// [`Store::reset`] deletes all of them, so give each client a directory of
/// its own.
#[derive(Debug)]
pub struct FileStore {
    directory: PathBuf,
    opened: RwLock<bool>,
}

impl FileStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            opened: RwLock::new(false),
        }
    }

    /// Store rooted at the current working directory
    ///
    /// A clean-session connect resets the store, which deletes every `*.msg`
    /// file in the working directory, including ones this client did not
    /// write. Prefer [`FileStore::new`] with a dedicated directory.
    pub fn in_current_dir() -> Self {
        Self::new(".")
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, key: &str, ext: &str) -> PathBuf {
        self.directory.join(format!("{key}.{ext}"))
    }

    fn read_guard(&self) -> Result<RwLockReadGuard<'_, bool>, StoreError> {
        let guard = self.opened.read().unwrap_or_else(|e| e.into_inner());
        if *guard {
            Ok(guard)
        } else {
            Err(StoreError::NotOpen)
        }
    }

    fn write_guard(&self) -> Result<RwLockWriteGuard<'_, bool>, StoreError> {
        let guard = self.opened.write().unwrap_or_else(|e| e.into_inner());
        if *guard {
            Ok(guard)
        } else {
            Err(StoreError::NotOpen)
        }
    }

    /// Promote every leftover `.bkp` file back to `.msg`
    fn recover_backups(&self) -> Result<(), StoreError> {
        for path in self.files_with_ext(BKP_EXT)? {
            let restored = path.with_extension(MSG_EXT);
            warn!(
                backup = %path.display(),
                "Restoring record from backup left by an interrupted write"
            );
            fs::rename(&path, &restored).map_err(|e| io_error(&restored, e))?;
        }
        Ok(())
    }

    fn files_with_ext(&self, ext: &str) -> Result<Vec<PathBuf>, StoreError> {
        let entries = fs::read_dir(&self.directory).map_err(|e| io_error(&self.directory, e))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| io_error(&self.directory, e))?.path();
            if path.is_file() && path.extension().is_some_and(|e| e == ext) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

impl Default for FileStore {
    fn default() -> Self {
        Self::in_current_dir()
    }
}

impl Store for FileStore {
    fn open(&self) -> Result<(), StoreError> {
        let mut opened = self.opened.write().unwrap_or_else(|e| e.into_inner());
        if *opened {
            return Ok(());
        }
        fs::create_dir_all(&self.directory).map_err(|e| io_error(&self.directory, e))?;
        self.recover_backups()?;
        *opened = true;
        debug!(directory = %self.directory.display(), "File store opened");
        Ok(())
    }

    fn close(&self) {
        let mut opened = self.opened.write().unwrap_or_else(|e| e.into_inner());
        *opened = false;
        debug!(directory = %self.directory.display(), "File store closed");
    }

    fn put(&self, key: &str, packet: &Packet) -> Result<(), StoreError> {
        let _guard = self.write_guard()?;
        let bytes = packet.to_bytes().map_err(|source| StoreError::Encode {
            key: key.to_string(),
            source,
        })?;

        let msg = self.path_for(key, MSG_EXT);
        let bkp = self.path_for(key, BKP_EXT);
        let overwrite = msg.exists();
        if overwrite {
            fs::copy(&msg, &bkp).map_err(|e| io_error(&bkp, e))?;
        }
        fs::write(&msg, &bytes).map_err(|e| io_error(&msg, e))?;
        if overwrite {
            fs::remove_file(&bkp).map_err(|e| io_error(&bkp, e))?;
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Packet>, StoreError> {
        let _guard = self.read_guard()?;
        let path = self.path_for(key, MSG_EXT);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path, e)),
        };
        Packet::from_bytes(&raw)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                key: key.to_string(),
                source,
            })
    }

    fn all(&self) -> Result<Vec<String>, StoreError> {
        let _guard = self.read_guard()?;
        Ok(self
            .files_with_ext(MSG_EXT)?
            .iter()
            .filter_map(|path| path.file_stem())
            .map(|stem| stem.to_string_lossy().into_owned())
            .collect())
    }

    fn del(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.write_guard()?;
        let path = self.path_for(key, MSG_EXT);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(key, "Delete of absent record ignored");
                Ok(())
            }
            Err(e) => Err(io_error(&path, e)),
        }
    }

    fn reset(&self) -> Result<(), StoreError> {
        let _guard = self.write_guard()?;
        for path in self.files_with_ext(MSG_EXT)? {
            fs::remove_file(&path).map_err(|e| io_error(&path, e))?;
        }
        Ok(())
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}
