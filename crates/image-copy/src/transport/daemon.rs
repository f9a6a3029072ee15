//! Images held by the local Docker daemon, addressed as
//! `docker-daemon:name:tag` or `docker-daemon:sha256:<id>`.
//!
//! The daemon speaks HTTP over a unix socket. Reading saves the image into a
//! temporary `docker save` tarball; writing builds one and loads it on commit.
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use hyper::client::conn;
use hyper::{Body, Method, Request, Response, StatusCode};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument};

use super::archive::{ArchiveDestination, ArchiveSource};
use super::{BlobStream, ImageDestination, ImageSource};
use crate::compression::LayerCompression;
use crate::digest::Digest;
use crate::error::TransportError;
use crate::manifest::{Descriptor, RawManifest};
use crate::policy::Signature;
use crate::reference::{DaemonReference, ImageReference};

fn api_name(name: &DaemonReference) -> String {
    match name {
        DaemonReference::Named(r) => r.whole(),
        DaemonReference::ImageId(d) => d.to_string(),
    }
}

async fn send(socket: &Path, request: Request<Body>) -> Result<Response<Body>, TransportError> {
    let connect_error = |reason: String| TransportError::Connect {
        target: socket.display().to_string(),
        reason,
    };
    let stream = UnixStream::connect(socket)
        .await
        .map_err(|e| connect_error(e.to_string()))?;
    let (mut sender, connection) = conn::handshake(stream)
        .await
        .map_err(|e| connect_error(e.to_string()))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "daemon connection closed");
        }
    });
    sender
        .send_request(request)
        .await
        .map_err(|e| connect_error(e.to_string()))
}

async fn error_body(response: Response<Body>) -> String {
    match hyper::body::to_bytes(response.into_body()).await {
        Ok(body) => String::from_utf8_lossy(&body).trim().to_owned(),
        Err(e) => e.to_string(),
    }
}

/// Reads an image from the daemon.
pub struct DaemonSource {
    inner: ArchiveSource,
    _staged: tempfile::NamedTempFile,
}

impl DaemonSource {
    /// Saves `name` from the daemon on `socket` into a temporary archive.
    #[instrument(level = "info")]
    pub async fn open(socket: &Path, name: &DaemonReference) -> Result<Self, TransportError> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(format!("/images/{}/get", api_name(name)))
            .header(hyper::header::HOST, "docker")
            .body(Body::empty())
            .map_err(|e| TransportError::Invalid(e.to_string()))?;
        let response = send(socket, request).await?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(TransportError::NotFound(api_name(name))),
            status => {
                return Err(TransportError::Invalid(format!(
                    "daemon answered {}: {}",
                    status,
                    error_body(response).await
                )))
            }
        }

        let staged = tempfile::NamedTempFile::new()?;
        let mut file = tokio::fs::File::from_std(staged.reopen()?);
        let mut body = response.into_body();
        let mut saved = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| TransportError::Connect {
                target: socket.display().to_string(),
                reason: e.to_string(),
            })?;
            saved += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        debug!(bytes = saved, "image saved from daemon");

        let tag = match name {
            DaemonReference::Named(r) => Some(r.clone()),
            DaemonReference::ImageId(_) => None,
        };
        let inner =
            ArchiveSource::open_as(staged.path(), tag, ImageReference::Daemon(name.clone()))
                .await?;
        Ok(DaemonSource {
            inner,
            _staged: staged,
        })
    }
}

#[async_trait]
impl ImageSource for DaemonSource {
    fn reference(&self) -> &ImageReference {
        self.inner.reference()
    }

    async fn get_manifest(&self, instance: Option<&Digest>) -> Result<RawManifest, TransportError> {
        self.inner.get_manifest(instance).await
    }

    async fn get_blob(&self, descriptor: &Descriptor) -> Result<BlobStream, TransportError> {
        self.inner.get_blob(descriptor).await
    }

    async fn get_signatures(&self, manifest: &Digest) -> Result<Vec<Signature>, TransportError> {
        self.inner.get_signatures(manifest).await
    }
}

/// Loads an image into the daemon.
pub struct DaemonDestination {
    socket: PathBuf,
    inner: ArchiveDestination,
    staged: tempfile::NamedTempFile,
}

impl DaemonDestination {
    /// Prepares to load an image tagged `name` into the daemon on `socket`.
    pub fn create(socket: &Path, name: &DaemonReference) -> Result<Self, TransportError> {
        let tag = match name {
            DaemonReference::Named(r) => r.clone(),
            DaemonReference::ImageId(_) => {
                return Err(TransportError::Invalid(
                    "an image id can not be a copy destination".to_owned(),
                ))
            }
        };
        let staged = tempfile::NamedTempFile::new()?;
        let inner = ArchiveDestination::create_as(
            staged.path(),
            Some(tag),
            ImageReference::Daemon(name.clone()),
        )?;
        Ok(DaemonDestination {
            socket: socket.to_owned(),
            inner,
            staged,
        })
    }
}

#[async_trait]
impl ImageDestination for DaemonDestination {
    fn reference(&self) -> &ImageReference {
        self.inner.reference()
    }

    fn desired_layer_compression(&self) -> LayerCompression {
        self.inner.desired_layer_compression()
    }

    fn supports_manifest_lists(&self) -> bool {
        false
    }

    fn supports_signatures(&self) -> bool {
        false
    }

    async fn blob_exists(&self, descriptor: &Descriptor) -> Result<bool, TransportError> {
        self.inner.blob_exists(descriptor).await
    }

    async fn put_blob(&self, descriptor: &Descriptor, data: Bytes) -> Result<(), TransportError> {
        self.inner.put_blob(descriptor, data).await
    }

    async fn put_manifest(
        &self,
        manifest: &RawManifest,
        instance: Option<&Digest>,
    ) -> Result<Digest, TransportError> {
        self.inner.put_manifest(manifest, instance).await
    }

    async fn put_signatures(
        &self,
        manifest: &Digest,
        signatures: &[Signature],
    ) -> Result<(), TransportError> {
        self.inner.put_signatures(manifest, signatures).await
    }

    #[instrument(level = "info", skip(self), fields(socket = %self.socket.display()))]
    async fn commit(&self) -> Result<(), TransportError> {
        self.inner.commit().await?;
        let file = tokio::fs::File::open(self.staged.path()).await?;
        let request = Request::builder()
            .method(Method::POST)
            .uri("/images/load?quiet=1")
            .header(hyper::header::HOST, "docker")
            .header(hyper::header::CONTENT_TYPE, "application/x-tar")
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .map_err(|e| TransportError::Invalid(e.to_string()))?;
        let response = send(&self.socket, request).await?;
        if response.status() != StatusCode::OK {
            let status = response.status();
            return Err(TransportError::Invalid(format!(
                "daemon refused the image ({}): {}",
                status,
                error_body(response).await
            )));
        }
        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| TransportError::Connect {
                target: self.socket.display().to_string(),
                reason: e.to_string(),
            })?;
        load_result(&body)
    }
}

/// The load endpoint answers 200 and reports failures inside its JSON
/// message stream.
fn load_result(body: &[u8]) -> Result<(), TransportError> {
    for line in body.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
        let message: serde_json::Value = serde_json::from_slice(line)?;
        if let Some(error) = message.get("error").and_then(|e| e.as_str()) {
            return Err(TransportError::Invalid(format!("daemon load failed: {}", error)));
        }
        if let Some(stream) = message.get("stream").and_then(|s| s.as_str()) {
            debug!(message = stream.trim(), "daemon");
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::reference::resolve;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;

    fn named(locator: &str) -> DaemonReference {
        match resolve(locator).expect("valid") {
            ImageReference::Daemon(name) => name,
            other => panic!("not a daemon reference: {}", other),
        }
    }

    #[tokio::test]
    async fn missing_socket_is_a_connect_error() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let result =
            DaemonSource::open(&tmp.path().join("docker.sock"), &named("docker-daemon:app:v1"))
                .await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_image_is_not_found() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let socket = tmp.path().join("docker.sock");
        let listener = UnixListener::bind(&socket)?;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await?;
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            stream
                .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n")
                .await?;
            Ok::<_, std::io::Error>(String::from_utf8_lossy(&request).into_owned())
        });

        let result = DaemonSource::open(&socket, &named("docker-daemon:app:v1")).await;
        assert!(matches!(result, Err(TransportError::NotFound(_))));
        let request = server.await??;
        assert!(request.starts_with("GET /images/docker.io/library/app:v1/get "));
        Ok(())
    }

    #[test]
    fn image_ids_are_not_destinations() {
        let id = named(&format!("docker-daemon:{}", Digest::sha256(b"image")));
        assert!(matches!(
            DaemonDestination::create(Path::new("/var/run/docker.sock"), &id),
            Err(TransportError::Invalid(_))
        ));
    }

    #[test]
    fn load_errors_are_reported() {
        assert!(load_result(b"{\"stream\":\"Loaded image: app:v1\\n\"}\n").is_ok());
        assert!(matches!(
            load_result(b"{\"errorDetail\":{\"message\":\"bad\"},\"error\":\"bad\"}\n"),
            Err(TransportError::Invalid(ref m)) if m.contains("bad")
        ));
    }
}
