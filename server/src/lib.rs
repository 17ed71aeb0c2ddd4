use std::{
    convert::Infallible, io::Read, io::Write, net::SocketAddr, path::PathBuf, str::FromStr,
    sync::Arc, time::Duration,
};

use anyhow::Result;
use byte_unit::Byte;
use http_body_util::{combinators::BoxBody, BodyExt, Full, StreamBody};
use hyper::{
    body::{self, Bytes, Frame},
    header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    server::conn::http1,
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::mpsc, task::block_in_place};
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tracing::{info, warn};

pub mod cipher;
pub mod error;
pub mod handler;
pub mod storage;
pub mod store;

use cipher::{CipherWorker, ExecCipherWorker};
use error::ApiError;
use handler::{DecryptedImage, UploadRequest};
use storage::Storage;
use store::{ImageId, Store, ANONYMOUS_OWNER};

const CONTENT_CHUNK_LEN: usize = 1024;

const ALLOWED_MIME_TYPES: &[&str] = &[
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/gif",
    "image/bmp",
];

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub storage_path: PathBuf,
    pub db_path: PathBuf,
    #[serde(default = "default_worker_path")]
    pub worker_path: PathBuf,
    #[serde(with = "humantime_serde", default = "default_worker_timeout")]
    pub worker_timeout: Duration,
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: Byte,
}

fn default_worker_path() -> PathBuf {
    "bildlager-worker".into()
}

fn default_worker_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_upload_size() -> Byte {
    Byte::from_u64(10 * 1024 * 1024)
}

/// Explicit service context passed into every handler call; there is no
/// ambient global state.
#[derive(Clone)]
pub struct Context {
    pub store: Arc<Store>,
    pub storage: Arc<Storage>,
    pub worker: Arc<dyn CipherWorker>,
    pub max_upload_size: u64,
}

pub async fn run(config: Config) -> Result<()> {
    let ctx = Context {
        store: Arc::new(Store::open(&config.db_path)?),
        storage: Arc::new(Storage::new(config.storage_path)?),
        worker: Arc::new(ExecCipherWorker::new(
            config.worker_path,
            config.worker_timeout,
        )),
        max_upload_size: config.max_upload_size.as_u64(),
    };

    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on: {}", config.bind_addr);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(err) = http1::Builder::new()
                        .keep_alive(true)
                        .serve_connection(
                            TokioIo::new(stream),
                            service_fn(move |req| handle_request(ctx.clone(), req)),
                        )
                        .await
                    {
                        warn!(%err, "error while serving HTTP connection");
                    }
                });
            }
            Err(err) => warn!(%err, "failed to accept"),
        }
    }
}

async fn handle_request(
    ctx: Context,
    request: Request<body::Incoming>,
) -> Result<Response<BoxBody<Bytes, Infallible>>, Infallible> {
    Ok(try_handle_request(ctx, request)
        .await
        .unwrap_or_else(error_response))
}

async fn try_handle_request(
    ctx: Context,
    request: Request<body::Incoming>,
) -> Result<Response<BoxBody<Bytes, Infallible>>, ApiError> {
    let path = request.uri().path().to_owned();
    let method = request.method().clone();

    if let Some(id) = path.strip_prefix("/decrypt/") {
        let id = parse_id(id)?;
        if method == Method::POST {
            decrypt(ctx, request, id).await
        } else {
            Err(ApiError::UnknownRoute)
        }
    } else if let Some(id) = path.strip_prefix("/images/") {
        let id = parse_id(id)?;
        if method == Method::DELETE {
            handler::delete_image(&ctx, id)?;
            json_response(StatusCode::OK, &serde_json::json!({ "deleted": true }))
        } else {
            Err(ApiError::UnknownRoute)
        }
    } else if method == Method::POST && path == "/upload" {
        upload(ctx, request).await
    } else if method == Method::GET && path == "/images" {
        let images = handler::list_images(&ctx)?;
        json_response(StatusCode::OK, &serde_json::json!({ "images": images }))
    } else if method == Method::GET && (path == "/" || path == "/health") {
        json_response(StatusCode::OK, &serde_json::json!({ "status": "ok" }))
    } else {
        Err(ApiError::UnknownRoute)
    }
}

fn parse_id(s: &str) -> Result<ImageId, ApiError> {
    ImageId::from_str(s).map_err(|_| ApiError::NotFound)
}

/// Buffers the request body into a staging tempfile (the upload collaborator
/// role) and hands the materialized file to the encryption orchestrator.
async fn upload(
    ctx: Context,
    mut request: Request<body::Incoming>,
) -> Result<Response<BoxBody<Bytes, Infallible>>, ApiError> {
    let key = header_str(&request, "x-encryption-key")?
        .ok_or(ApiError::MissingHeader("x-encryption-key"))?;
    let original_name =
        header_str(&request, "x-file-name")?.ok_or(ApiError::MissingHeader("x-file-name"))?;
    let owner_id =
        header_str(&request, "x-owner-id")?.unwrap_or_else(|| ANONYMOUS_OWNER.to_owned());
    let mime_type =
        header_str(&request, "content-type")?.ok_or(ApiError::MissingHeader("content-type"))?;
    if !ALLOWED_MIME_TYPES.contains(&mime_type.as_str()) {
        return Err(ApiError::UnsupportedMediaType);
    }

    let content_length: u64 = header_str(&request, "content-length")?
        .ok_or(ApiError::MissingHeader("content-length"))?
        .parse()
        .map_err(|_| ApiError::InvalidRequest("invalid content length"))?;
    if content_length > ctx.max_upload_size {
        return Err(ApiError::PayloadTooLarge);
    }

    let mut file = ctx
        .storage
        .create_staging_file()
        .map_err(ApiError::Internal)?;
    let mut received_length: u64 = 0;
    while let Some(frame) = request.body_mut().frame().await {
        let frame = frame.map_err(|err| {
            warn!(%err, "failed to read request frame");
            ApiError::InvalidRequest("failed to read request body")
        })?;
        let Some(data) = frame.data_ref() else {
            continue;
        };
        received_length += data.len() as u64;
        if received_length > ctx.max_upload_size {
            return Err(ApiError::PayloadTooLarge);
        }
        block_in_place(|| file.write_all(data)).map_err(|err| ApiError::Internal(err.into()))?;
    }
    if received_length != content_length {
        warn!(content_length, received_length, "content length mismatch");
        return Err(ApiError::InvalidRequest("content length mismatch"));
    }
    block_in_place(|| file.flush()).map_err(|err| ApiError::Internal(err.into()))?;

    let upload = UploadRequest {
        file,
        declared_size: received_length,
        mime_type,
        original_name,
        key,
        owner_id,
    };
    let (id, record) = handler::encrypt_upload(&ctx, upload).await?;
    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "imageId": id,
            "originalName": record.original_name,
        }),
    )
}

// No Debug impl: the decryption key must never end up in logs.
#[derive(Deserialize)]
struct DecryptRequest {
    key: String,
}

async fn decrypt(
    ctx: Context,
    request: Request<body::Incoming>,
    id: ImageId,
) -> Result<Response<BoxBody<Bytes, Infallible>>, ApiError> {
    let bytes = request
        .into_body()
        .collect()
        .await
        .map_err(|err| {
            warn!(%err, "failed to read request body");
            ApiError::InvalidRequest("failed to read request body")
        })?
        .to_bytes();
    let decrypt_request: DecryptRequest = serde_json::from_slice(&bytes)
        .map_err(|_| ApiError::InvalidRequest("expected a JSON body with a `key` field"))?;

    let image = handler::decrypt_image(&ctx, id, &decrypt_request.key).await?;
    stream_plaintext(image)
}

/// Streams the transient plaintext to the caller. The tempfile handle moves
/// into the reader task, so the plaintext is removed when the stream ends,
/// whether it completed or the client went away.
fn stream_plaintext(
    image: DecryptedImage,
) -> Result<Response<BoxBody<Bytes, Infallible>>, ApiError> {
    let DecryptedImage { record, plaintext } = image;
    let mut file = fs_err::File::open(plaintext.path()).map_err(|err| {
        warn!(%err, "couldn't open decrypted file");
        ApiError::Internal(err.into())
    })?;
    let len = file
        .metadata()
        .map_err(|err| ApiError::Internal(err.into()))?
        .len();

    let (tx, rx) = mpsc::channel(5);
    tokio::spawn(async move {
        // Keeps the transient plaintext alive exactly as long as the stream.
        let _transient = plaintext;
        let mut buf = vec![0u8; CONTENT_CHUNK_LEN];
        loop {
            match block_in_place(|| file.read(&mut buf)) {
                Ok(0) => break, // end of file
                Ok(len) => {
                    if tx.send(Bytes::copy_from_slice(&buf[0..len])).await.is_err() {
                        break; // receiver closed
                    }
                }
                Err(err) => {
                    warn!(%err, "failed to read decrypted file");
                    break;
                }
            }
        }
    });

    Response::builder()
        .header(CONTENT_LENGTH, len)
        .header(CONTENT_TYPE, record.mime_type)
        .header(
            CONTENT_DISPOSITION,
            format!(
                "attachment; filename=\"{}\"",
                record.original_name.replace(['"', '\r', '\n'], "_")
            ),
        )
        .body(BodyExt::boxed(StreamBody::new(
            ReceiverStream::new(rx).map(|bytes| Ok(Frame::data(bytes))),
        )))
        .map_err(|err| ApiError::Internal(err.into()))
}

fn header_str(
    request: &Request<body::Incoming>,
    name: &'static str,
) -> Result<Option<String>, ApiError> {
    match request.headers().get(name) {
        Some(value) => value
            .to_str()
            .map(|s| Some(s.to_owned()))
            .map_err(|_| ApiError::InvalidRequest("malformed header value")),
        None => Ok(None),
    }
}

fn json_response(
    status: StatusCode,
    body: &serde_json::Value,
) -> Result<Response<BoxBody<Bytes, Infallible>>, ApiError> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body.to_string())).boxed())
        .map_err(|err| ApiError::Internal(err.into()))
}

fn error_response(err: ApiError) -> Response<BoxBody<Bytes, Infallible>> {
    let status = err.status();
    if status.is_server_error() {
        warn!(error = ?err, "request failed");
    }
    let body = serde_json::json!({ "error": err.to_string() }).to_string();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).boxed())
        .expect("response builder failed")
}
