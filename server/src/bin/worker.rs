//! Cipher worker executable.
//!
//! Invoked by the server as `bildlager-worker encrypt <input> <key>` or
//! `bildlager-worker decrypt <input> <key> <output>`. Prints exactly one JSON
//! result object to stdout and exits 0 whenever a result was produced; the
//! key is never written to stdout or stderr.
//!
//! Format: XChaCha20-Poly1305 over the whole file, key = SHA-256 of the
//! passphrase, fresh random 24-byte nonce prepended to the ciphertext.
//! The AEAD tag makes a wrong key a detectable failure instead of garbage
//! output.

use anyhow::{anyhow, bail, Result};
use base64::{prelude::BASE64_STANDARD, Engine};
use bildlager_server::cipher::{expected_encrypted_path, WorkerReport};
use chacha20poly1305::{aead::Aead, KeyInit, XChaCha20Poly1305, XNonce};
use clap::{Parser, Subcommand};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

const NONCE_LENGTH: usize = 24;
const TAG_LENGTH: usize = 16;

#[derive(Parser)]
#[command(name = "bildlager-worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Encrypt `input` in place, writing `<input>.enc`.
    Encrypt { input: PathBuf, key: String },
    /// Decrypt `input` to `output`.
    Decrypt {
        input: PathBuf,
        key: String,
        output: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    let report = match run(cli.command) {
        Ok(report) => report,
        Err(err) => WorkerReport::failure(err),
    };
    println!(
        "{}",
        serde_json::to_string(&report).expect("worker report serialization failed")
    );
}

fn run(command: Command) -> Result<WorkerReport> {
    match command {
        Command::Encrypt { input, key } => encrypt(&input, &key),
        Command::Decrypt { input, key, output } => decrypt(&input, &key, &output),
    }
}

fn cipher_for(key: &str) -> Result<XChaCha20Poly1305> {
    let digest = Sha256::digest(key.as_bytes());
    XChaCha20Poly1305::new_from_slice(&digest).map_err(|_| anyhow!("key derivation failed"))
}

fn encrypt(input: &Path, key: &str) -> Result<WorkerReport> {
    let cipher = cipher_for(key)?;
    let mut nonce_bytes = [0u8; NONCE_LENGTH];
    rand::rng().fill_bytes(&mut nonce_bytes);

    let plaintext = fs_err::read(input)?;
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce_bytes), plaintext.as_slice())
        .map_err(|_| anyhow!("encryption failed"))?;

    let encrypted_path = expected_encrypted_path(input);
    let mut data = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
    data.extend_from_slice(&nonce_bytes);
    data.extend_from_slice(&ciphertext);
    fs_err::write(&encrypted_path, &data)?;

    Ok(WorkerReport::encrypted(
        encrypted_path,
        BASE64_STANDARD.encode(nonce_bytes),
    ))
}

fn decrypt(input: &Path, key: &str, output: &Path) -> Result<WorkerReport> {
    let cipher = cipher_for(key)?;
    let data = fs_err::read(input)?;
    if data.len() < NONCE_LENGTH + TAG_LENGTH {
        bail!("encrypted file is truncated");
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LENGTH);
    let plaintext = cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| anyhow!("invalid key or corrupted data"))?;
    fs_err::write(output, &plaintext)?;
    Ok(WorkerReport::succeeded())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn roundtrip() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("photo.png");
        fs_err::write(&input, b"not really a png").unwrap();

        let report = encrypt(&input, "password123").unwrap();
        assert!(report.success);
        let encrypted_path = report.encrypted_path.unwrap();
        assert!(encrypted_path.exists());
        let iv = BASE64_STANDARD.decode(report.iv.unwrap()).unwrap();
        assert_eq!(iv.len(), NONCE_LENGTH);
        assert_ne!(fs_err::read(&encrypted_path).unwrap(), b"not really a png");

        let output = dir.path().join("photo.dec");
        decrypt(&encrypted_path, "password123", &output).unwrap();
        assert_eq!(fs_err::read(&output).unwrap(), b"not really a png");
    }

    #[test]
    fn wrong_key_is_detected() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("photo.png");
        fs_err::write(&input, b"payload").unwrap();

        let report = encrypt(&input, "password123").unwrap();
        let encrypted_path = report.encrypted_path.unwrap();

        let output = dir.path().join("photo.dec");
        let err = decrypt(&encrypted_path, "wrongpass", &output).unwrap_err();
        assert!(err.to_string().contains("invalid key"));
        assert!(!output.exists());
    }

    #[test]
    fn fresh_iv_per_encryption() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.png");
        let b = dir.path().join("b.png");
        fs_err::write(&a, b"same bytes").unwrap();
        fs_err::write(&b, b"same bytes").unwrap();

        let iv_a = encrypt(&a, "password123").unwrap().iv.unwrap();
        let iv_b = encrypt(&b, "password123").unwrap().iv.unwrap();
        assert_ne!(iv_a, iv_b);
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("short.enc");
        fs_err::write(&input, b"tiny").unwrap();
        let output = dir.path().join("short.dec");
        let err = decrypt(&input, "password123", &output).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }
}
