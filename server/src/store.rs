use anyhow::Result;
use chrono::Utc;
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::{path::Path, str::FromStr};

pub type DateTimeUtc = chrono::DateTime<Utc>;

pub const ANONYMOUS_OWNER: &str = "anonymous";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into,
    Display,
)]
pub struct ImageId(pub u64);

impl FromStr for ImageId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Persisted description of one encrypted artifact.
///
/// The encryption key is deliberately absent: it exists only for the duration
/// of a single orchestration call and never reaches any persisted medium.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub original_name: String,
    /// Opaque locator of the ciphertext artifact inside the encrypted
    /// directory. Valid only while the artifact exists.
    pub encrypted_name: String,
    /// Original plaintext size in bytes.
    pub size: u64,
    pub mime_type: String,
    /// Base64 initialization vector reported by the cipher worker. Fresh per
    /// encryption, never derived from the key.
    pub iv: String,
    pub uploaded_at: DateTimeUtc,
    pub owner_id: String,
}

pub struct Store {
    db: sled::Db,
    images: sled::Tree,
}

impl Store {
    pub fn open(path: &Path) -> Result<Store> {
        let db = sled::open(path)?;
        Ok(Self {
            images: db.open_tree("images")?,
            db,
        })
    }

    pub fn create(&self, record: &ImageRecord) -> Result<ImageId> {
        let id = self.db.generate_id()?;
        self.images
            .insert(id.to_be_bytes(), bincode::serialize(record)?)?;
        Ok(ImageId(id))
    }

    pub fn get(&self, id: ImageId) -> Result<Option<ImageRecord>> {
        if let Some(value) = self.images.get(id.0.to_be_bytes())? {
            Ok(Some(bincode::deserialize::<ImageRecord>(&value)?))
        } else {
            Ok(None)
        }
    }

    /// All records, newest upload first.
    pub fn list(&self) -> Result<Vec<(ImageId, ImageRecord)>> {
        let mut records = Vec::new();
        for pair in self.images.iter() {
            let (key, value) = pair?;
            let id = ImageId(u64::from_be_bytes(key.as_ref().try_into()?));
            records.push((id, bincode::deserialize::<ImageRecord>(&value)?));
        }
        records.sort_by(|(_, a), (_, b)| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(records)
    }

    /// Returns whether a record existed.
    pub fn remove(&self, id: ImageId) -> Result<bool> {
        Ok(self.images.remove(id.0.to_be_bytes())?.is_some())
    }
}
