use chrono::Utc;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::{
    cipher::CipherError,
    error::ApiError,
    store::{DateTimeUtc, ImageId, ImageRecord},
    Context,
};

pub const MIN_KEY_LENGTH: usize = 8;

/// A materialized upload, ready for encryption orchestration.
///
/// `file` owns the plaintext artifact; because it is a tempfile handle, the
/// plaintext is removed whenever this struct is dropped, which is what makes
/// the no-plaintext-leak guarantee hold on every exit path below.
pub struct UploadRequest {
    pub file: NamedTempFile,
    pub declared_size: u64,
    pub mime_type: String,
    pub original_name: String,
    pub key: String,
    pub owner_id: String,
}

/// A decrypted artifact plus the record it came from. The plaintext handle
/// must outlive the response stream and nothing else; dropping it removes
/// the transient plaintext.
#[derive(Debug)]
pub struct DecryptedImage {
    pub record: ImageRecord,
    pub plaintext: NamedTempFile,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageEntry {
    pub id: ImageId,
    pub original_name: String,
    pub size: u64,
    pub mime_type: String,
    pub iv: String,
    pub uploaded_at: DateTimeUtc,
    pub owner_id: String,
}

/// Encryption orchestration: key policy, worker invocation, metadata
/// persistence. The plaintext at `upload.file` no longer exists when this
/// returns, success or failure.
pub async fn encrypt_upload(
    ctx: &Context,
    upload: UploadRequest,
) -> Result<(ImageId, ImageRecord), ApiError> {
    let UploadRequest {
        file,
        declared_size,
        mime_type,
        original_name,
        key,
        owner_id,
    } = upload;

    if key.chars().count() < MIN_KEY_LENGTH {
        // `file` is dropped here, so the rejected plaintext is removed.
        return Err(ApiError::InvalidKey);
    }

    let report = ctx
        .worker
        .encrypt(file.path(), &key)
        .await
        .map_err(|err| cipher_failure(err, "encrypt"))?;
    // The original is retired unconditionally; from here on the ciphertext
    // is the only durable form.
    drop(file);

    let encrypted_name = ctx
        .storage
        .commit_encrypted(&report.encrypted_path)
        .map_err(ApiError::Internal)?;
    let record = ImageRecord {
        original_name,
        encrypted_name: encrypted_name.clone(),
        size: declared_size,
        mime_type,
        iv: report.iv,
        uploaded_at: Utc::now(),
        owner_id,
    };
    let id = match ctx.store.create(&record) {
        Ok(id) => id,
        Err(err) => {
            // Don't leave an unreferenced ciphertext artifact behind.
            let _ = ctx.storage.remove_encrypted(&encrypted_name);
            return Err(ApiError::Internal(err));
        }
    };
    info!(%id, size = record.size, "image encrypted");
    Ok((id, record))
}

/// Decryption orchestration. On success the caller receives the transient
/// plaintext handle and is responsible for keeping it alive exactly as long
/// as the response stream; on failure no plaintext artifact remains.
pub async fn decrypt_image(
    ctx: &Context,
    id: ImageId,
    key: &str,
) -> Result<DecryptedImage, ApiError> {
    let record = ctx
        .store
        .get(id)
        .map_err(ApiError::Internal)?
        .ok_or(ApiError::NotFound)?;
    let plaintext = ctx
        .storage
        .create_staging_file()
        .map_err(ApiError::Internal)?;
    let encrypted_path = ctx.storage.encrypted_path(&record.encrypted_name);
    ctx.worker
        .decrypt(&encrypted_path, key, plaintext.path())
        .await
        .map_err(|err| {
            // `plaintext` is dropped on this path; the adapter has already
            // removed anything the worker wrote at that location.
            match err {
                CipherError::Timeout(_) => {
                    warn!(%id, %err, "decrypt worker timed out");
                    ApiError::CipherTimeout
                }
                err => {
                    warn!(%id, %err, "decrypt worker failure");
                    ApiError::DecryptionFailed
                }
            }
        })?;
    Ok(DecryptedImage { record, plaintext })
}

/// Removes the ciphertext artifact first, then the record, so a crash in
/// between never leaves a record whose artifact was not at least attempted.
pub fn delete_image(ctx: &Context, id: ImageId) -> Result<(), ApiError> {
    let record = ctx
        .store
        .get(id)
        .map_err(ApiError::Internal)?
        .ok_or(ApiError::NotFound)?;
    ctx.storage
        .remove_encrypted(&record.encrypted_name)
        .map_err(ApiError::Internal)?;
    ctx.store.remove(id).map_err(ApiError::Internal)?;
    info!(%id, "image deleted");
    Ok(())
}

pub fn list_images(ctx: &Context) -> Result<Vec<ImageEntry>, ApiError> {
    let records = ctx.store.list().map_err(ApiError::Internal)?;
    Ok(records
        .into_iter()
        .map(|(id, record)| ImageEntry {
            id,
            original_name: record.original_name,
            size: record.size,
            mime_type: record.mime_type,
            iv: record.iv,
            uploaded_at: record.uploaded_at,
            owner_id: record.owner_id,
        })
        .collect())
}

fn cipher_failure(err: CipherError, operation: &str) -> ApiError {
    match err {
        CipherError::Timeout(_) => {
            warn!(operation, %err, "cipher worker timed out");
            ApiError::CipherTimeout
        }
        err => {
            warn!(operation, %err, "cipher worker failure");
            ApiError::CipherFailure
        }
    }
}
