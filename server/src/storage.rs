use anyhow::Result;
use base64::{prelude::BASE64_URL_SAFE_NO_PAD, Engine};
use fs_err::{create_dir_all, remove_file, rename, File};
use rand::RngCore;
use std::{
    io,
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;

const LOCATOR_LENGTH: usize = 16;

/// Owns the two artifact directories: `staging` for transient plaintext and
/// `encrypted` for durable ciphertext.
///
/// Transient plaintext always lives in a [`NamedTempFile`], so it is removed
/// when the handle is dropped, on every exit path. Ciphertext enters the
/// `encrypted` directory only through [`Storage::commit_encrypted`].
#[derive(Debug)]
pub struct Storage {
    staging: PathBuf,
    encrypted: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Result<Self> {
        let staging = root.join("staging");
        let encrypted = root.join("encrypted");
        create_dir_all(&staging)?;
        create_dir_all(&encrypted)?;
        Ok(Self { staging, encrypted })
    }

    /// Creates a collision-free transient file. Concurrent requests each get
    /// their own path, so one request's cleanup never touches another's.
    pub fn create_staging_file(&self) -> Result<NamedTempFile> {
        Ok(NamedTempFile::new_in(&self.staging)?)
    }

    /// Moves a worker-written ciphertext file into the encrypted directory
    /// under a fresh opaque locator and returns that locator.
    pub fn commit_encrypted(&self, written: &Path) -> Result<String> {
        let mut token = [0u8; LOCATOR_LENGTH];
        rand::rng().fill_bytes(&mut token);
        let name = BASE64_URL_SAFE_NO_PAD.encode(token);
        if let Err(err) = rename(written, self.encrypted.join(&name)) {
            let _ = remove_file(written);
            return Err(err.into());
        }
        Ok(name)
    }

    pub fn encrypted_path(&self, name: &str) -> PathBuf {
        self.encrypted.join(name)
    }

    pub fn open_encrypted(&self, name: &str) -> Result<File> {
        Ok(File::open(self.encrypted.join(name))?)
    }

    /// Removes a ciphertext artifact. Absence is not an error.
    pub fn remove_encrypted(&self, name: &str) -> Result<()> {
        match remove_file(self.encrypted.join(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use tempfile::TempDir;

    #[test]
    fn commit_and_open() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path().into()).unwrap();

        let mut file = storage.create_staging_file().unwrap();
        writeln!(file, "ok").unwrap();
        file.flush().unwrap();
        let (_, path) = file.keep().unwrap();
        let name = storage.commit_encrypted(&path).unwrap();
        assert!(!path.exists());

        let mut buf = String::new();
        storage
            .open_encrypted(&name)
            .unwrap()
            .read_to_string(&mut buf)
            .unwrap();
        assert_eq!(buf, "ok\n");
    }

    #[test]
    fn remove_tolerates_absence() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path().into()).unwrap();

        let mut file = storage.create_staging_file().unwrap();
        file.write_all(b"data").unwrap();
        file.flush().unwrap();
        let (_, path) = file.keep().unwrap();
        let name = storage.commit_encrypted(&path).unwrap();

        storage.remove_encrypted(&name).unwrap();
        assert!(!storage.encrypted_path(&name).exists());
        storage.remove_encrypted(&name).unwrap();
    }

    #[test]
    fn staging_file_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path().into()).unwrap();
        let file = storage.create_staging_file().unwrap();
        let path = file.path().to_path_buf();
        assert!(path.exists());
        drop(file);
        assert!(!path.exists());
    }
}
