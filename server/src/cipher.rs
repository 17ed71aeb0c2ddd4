use async_trait::async_trait;
use fs_err::remove_file;
use serde::{Deserialize, Serialize};
use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    time,
};
use tracing::warn;

#[derive(Debug, Error)]
pub enum CipherError {
    /// Worker exited non-zero, produced unparsable output, or reported
    /// `success: false`. The detail string is for logs only.
    #[error("cipher worker failed: {0}")]
    Failed(String),
    #[error("cipher worker timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to run cipher worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// What a successful `encrypt` invocation produced.
#[derive(Debug)]
pub struct EncryptReport {
    /// Where the worker wrote the ciphertext. Not yet committed to the
    /// encrypted directory.
    pub encrypted_path: PathBuf,
    /// Base64 initialization vector, fresh for this encryption.
    pub iv: String,
}

/// The single structured result a worker prints to stdout.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerReport {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerReport {
    pub fn encrypted(encrypted_path: PathBuf, iv: String) -> Self {
        Self {
            success: true,
            encrypted_path: Some(encrypted_path),
            iv: Some(iv),
            error: None,
        }
    }

    pub fn succeeded() -> Self {
        Self {
            success: true,
            encrypted_path: None,
            iv: None,
            error: None,
        }
    }

    pub fn failure(error: impl ToString) -> Self {
        Self {
            success: false,
            encrypted_path: None,
            iv: None,
            error: Some(error.to_string()),
        }
    }
}

/// Out-of-process encrypt/decrypt capability.
///
/// Implementations must guarantee that on `encrypt` success a ciphertext
/// artifact exists at the reported path, and that on `decrypt` success the
/// plaintext was written to `output`. The key is never logged and never part
/// of any success payload.
#[async_trait]
pub trait CipherWorker: Send + Sync {
    async fn encrypt(&self, input: &Path, key: &str) -> Result<EncryptReport, CipherError>;
    async fn decrypt(&self, input: &Path, key: &str, output: &Path)
        -> Result<(), CipherError>;
}

/// Ciphertext path the worker is expected to write for a given input.
pub fn expected_encrypted_path(input: &Path) -> PathBuf {
    let mut path = OsString::from(input.as_os_str());
    path.push(".enc");
    PathBuf::from(path)
}

/// Adapter that shells out to a worker executable and parses its single
/// buffered JSON result.
#[derive(Debug)]
pub struct ExecCipherWorker {
    program: PathBuf,
    timeout: Duration,
}

impl ExecCipherWorker {
    pub fn new(program: PathBuf, timeout: Duration) -> Self {
        Self { program, timeout }
    }

    /// Runs one worker invocation. `expected_output` is removed on every
    /// failure so no partial artifact survives.
    async fn invoke(
        &self,
        args: Vec<OsString>,
        expected_output: &Path,
    ) -> Result<WorkerReport, CipherError> {
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Backstop in case the invocation future itself is dropped.
            .kill_on_drop(true)
            .spawn()?;

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let finished = async {
            let (stdout, stderr) =
                tokio::try_join!(drain_pipe(stdout_pipe), drain_pipe(stderr_pipe))?;
            let status = child.wait().await?;
            std::io::Result::Ok((status, stdout, stderr))
        };

        let (status, stdout, stderr) = match time::timeout(self.timeout, finished).await {
            Ok(finished) => finished?,
            Err(_elapsed) => {
                // kill() reaps the worker, so removal of the partial artifact
                // happens strictly after the process is gone and cannot be
                // undone by a late write.
                if let Err(err) = child.kill().await {
                    warn!(%err, "failed to kill timed-out cipher worker");
                }
                discard_partial_output(expected_output);
                return Err(CipherError::Timeout(self.timeout));
            }
        };

        if !status.success() {
            discard_partial_output(expected_output);
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(CipherError::Failed(format!(
                "worker exited with {status}: {}",
                stderr.trim()
            )));
        }

        let report: WorkerReport = match serde_json::from_slice(&stdout) {
            Ok(report) => report,
            Err(err) => {
                discard_partial_output(expected_output);
                return Err(CipherError::Failed(format!(
                    "unparsable worker output: {err}"
                )));
            }
        };
        if !report.success {
            discard_partial_output(expected_output);
            return Err(CipherError::Failed(
                report
                    .error
                    .unwrap_or_else(|| "worker reported failure without detail".into()),
            ));
        }
        Ok(report)
    }
}

async fn drain_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

fn discard_partial_output(path: &Path) {
    match remove_file(path) {
        Ok(()) => warn!(path = %path.display(), "removed partial worker output"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(%err, "failed to remove partial worker output"),
    }
}

#[async_trait]
impl CipherWorker for ExecCipherWorker {
    async fn encrypt(&self, input: &Path, key: &str) -> Result<EncryptReport, CipherError> {
        let expected = expected_encrypted_path(input);
        let args = vec![
            OsString::from("encrypt"),
            input.as_os_str().to_owned(),
            OsString::from(key),
        ];
        let report = self.invoke(args, &expected).await?;
        let encrypted_path = report.encrypted_path.ok_or_else(|| {
            CipherError::Failed("worker success without encrypted path".into())
        })?;
        let iv = report
            .iv
            .ok_or_else(|| CipherError::Failed("worker success without iv".into()))?;
        Ok(EncryptReport { encrypted_path, iv })
    }

    async fn decrypt(
        &self,
        input: &Path,
        key: &str,
        output: &Path,
    ) -> Result<(), CipherError> {
        let args = vec![
            OsString::from("decrypt"),
            input.as_os_str().to_owned(),
            OsString::from(key),
            output.as_os_str().to_owned(),
        ];
        self.invoke(args, output).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_parsing() {
        let report: WorkerReport = serde_json::from_str(
            r#"{"success":true,"encrypted_path":"/tmp/a.enc","iv":"bm9uY2U="}"#,
        )
        .unwrap();
        assert!(report.success);
        assert_eq!(report.encrypted_path.unwrap(), PathBuf::from("/tmp/a.enc"));
        assert_eq!(report.iv.unwrap(), "bm9uY2U=");

        let report: WorkerReport =
            serde_json::from_str(r#"{"success":false,"error":"invalid key"}"#).unwrap();
        assert!(!report.success);
        assert_eq!(report.error.unwrap(), "invalid key");

        assert!(serde_json::from_str::<WorkerReport>("not json").is_err());
    }

    #[test]
    fn expected_path_appends_suffix() {
        assert_eq!(
            expected_encrypted_path(Path::new("/tmp/upload.png")),
            PathBuf::from("/tmp/upload.png.enc")
        );
    }

    #[tokio::test]
    async fn missing_program_is_reported() {
        let worker = ExecCipherWorker::new(
            PathBuf::from("/nonexistent/bildlager-worker"),
            Duration::from_secs(1),
        );
        let err = worker
            .encrypt(Path::new("/tmp/nothing"), "password123")
            .await
            .unwrap_err();
        assert!(matches!(err, CipherError::Spawn(_)));
    }
}
