//! Local-disk object store.
//!
//! Objects live under `root/objects/{shard}/{shard}/{key}` with two MD5-derived
//! shard levels, in-flight multipart uploads under `root/uploads/{upload_id}/`.
//! Part uploads arrive through HMAC-signed URLs pointing at this service's
//! `/store/uploads/...` route, so clients never hold store credentials.

use super::{
    CompletedPart, GatewayError, GatewayResult, ObjectMetadata, ObjectStoreGateway, UploadedPart,
    normalize_etag,
};
use crate::services::part_plan::MAX_PARTS;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, pin_mut};
use hmac::{Hmac, Mac};
use md5::Context;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, info};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const MANIFEST_FILE: &str = "manifest.json";

/// Why a part upload through a presigned URL was refused.
#[derive(Debug, Error)]
pub enum PartWriteError {
    #[error("presigned URL signature is invalid")]
    BadSignature,
    #[error("presigned URL has expired")]
    Expired,
    #[error("part number {0} is out of range")]
    InvalidPart(u32),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

#[derive(Serialize, Deserialize, Debug)]
struct UploadManifest {
    key: String,
    content_type: String,
    initiated_at: DateTime<Utc>,
}

pub struct LocalObjectStore {
    root: PathBuf,
    public_base_url: String,
    signing_key: Vec<u8>,
}

impl LocalObjectStore {
    /// Create the store rooted at `root`, creating its directories if needed.
    pub async fn new(
        root: impl Into<PathBuf>,
        public_base_url: &str,
        signing_key: &[u8],
    ) -> GatewayResult<Self> {
        let store = Self {
            root: root.into(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            signing_key: signing_key.to_vec(),
        };
        fs::create_dir_all(store.objects_root())
            .await
            .map_err(|e| io_error("creating objects directory", e))?;
        fs::create_dir_all(store.uploads_root())
            .await
            .map_err(|e| io_error("creating uploads directory", e))?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn objects_root(&self) -> PathBuf {
        self.root.join("objects")
    }

    fn uploads_root(&self) -> PathBuf {
        self.root.join("uploads")
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    fn ensure_key_safe(key: &str) -> GatewayResult<()> {
        let unsafe_key = key.is_empty()
            || key.len() > MAX_OBJECT_KEY_LEN
            || key.starts_with('/')
            || key.contains("..")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
        if unsafe_key {
            return Err(GatewayError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    /// First two bytes of MD5(key) as lowercase hex, one directory level each.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> GatewayResult<PathBuf> {
        Self::ensure_key_safe(key)?;
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.objects_root();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        Ok(path)
    }

    fn upload_dir(&self, upload_id: &str) -> GatewayResult<PathBuf> {
        if upload_id.len() != 32 || !upload_id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(GatewayError::InvalidUploadId(upload_id.to_string()));
        }
        Ok(self.uploads_root().join(upload_id))
    }

    fn part_path(dir: &Path, part_number: u32) -> PathBuf {
        dir.join(format!("{:05}.part", part_number))
    }

    fn etag_path(dir: &Path, part_number: u32) -> PathBuf {
        dir.join(format!("{:05}.etag", part_number))
    }

    fn signature(&self, upload_id: &str, part_number: u32, expires: i64) -> HmacSha256 {
        // new_from_slice accepts keys of any length for HMAC.
        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
        mac.update(format!("{}:{}:{}", upload_id, part_number, expires).as_bytes());
        mac
    }

    /// Check a presigned part URL's `expires` and `signature` query values.
    pub fn verify_part_url(
        &self,
        upload_id: &str,
        part_number: u32,
        expires: i64,
        signature: &str,
    ) -> Result<(), PartWriteError> {
        let provided = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| PartWriteError::BadSignature)?;
        self.signature(upload_id, part_number, expires)
            .verify_slice(&provided)
            .map_err(|_| PartWriteError::BadSignature)?;
        if expires < Utc::now().timestamp() {
            return Err(PartWriteError::Expired);
        }
        Ok(())
    }

    async fn read_manifest(&self, upload_id: &str) -> GatewayResult<(PathBuf, UploadManifest)> {
        let dir = self.upload_dir(upload_id)?;
        let raw = match fs::read(dir.join(MANIFEST_FILE)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(GatewayError::InvalidUploadId(upload_id.to_string()));
            }
            Err(err) => return Err(io_error("reading upload manifest", err)),
        };
        let manifest = serde_json::from_slice(&raw).map_err(|e| {
            GatewayError::Unavailable(format!("corrupt manifest for upload {}: {}", upload_id, e))
        })?;
        Ok((dir, manifest))
    }

    /// Stream one part to disk after verifying its presigned URL.
    ///
    /// - Writes to a temporary file while computing the MD5 ETag.
    /// - Renames into place, then records the ETag next to the part.
    ///
    /// Re-uploading a part replaces it, as with S3.
    pub async fn write_part<S>(
        &self,
        upload_id: &str,
        part_number: u32,
        expires: i64,
        signature: &str,
        stream: S,
    ) -> Result<String, PartWriteError>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.verify_part_url(upload_id, part_number, expires, signature)?;
        if part_number == 0 || part_number > MAX_PARTS {
            return Err(PartWriteError::InvalidPart(part_number));
        }
        let (dir, _) = self.read_manifest(upload_id).await?;

        let tmp = TempFile::in_dir(&dir);
        let mut file = File::create(tmp.path())
            .await
            .map_err(|e| io_error("creating part file", e))?;

        let mut size_bytes: u64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| io_error("reading part body", e))?;
            size_bytes += chunk.len() as u64;
            digest.consume(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| io_error("writing part", e))?;
        }
        file.sync_all()
            .await
            .map_err(|e| io_error("syncing part", e))?;

        let etag = format!("{:x}", digest.compute());
        tmp.persist(&Self::part_path(&dir, part_number))
            .await
            .map_err(|e| io_error("storing part", e))?;
        write_atomically(&Self::etag_path(&dir, part_number), etag.as_bytes())
            .await
            .map_err(|e| io_error("recording part etag", e))?;

        debug!(upload_id, part_number, size_bytes, %etag, "stored part");
        Ok(etag)
    }

    /// Open an object for streaming out.
    pub async fn open_object(&self, key: &str) -> GatewayResult<(ObjectMetadata, File)> {
        let path = self.object_path(key)?;
        let file = File::open(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                GatewayError::NotFound(key.to_string())
            } else {
                io_error("opening object", err)
            }
        })?;
        let meta = file
            .metadata()
            .await
            .map_err(|e| io_error("reading object metadata", e))?;
        Ok((
            ObjectMetadata {
                key: key.to_string(),
                size: Some(meta.len()),
                etag: None,
            },
            file,
        ))
    }

    /// Recursively remove empty directories up to `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStoreGateway for LocalObjectStore {
    async fn initiate_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
    ) -> GatewayResult<String> {
        Self::ensure_key_safe(key)?;
        let upload_id = Uuid::new_v4().simple().to_string();
        let dir = self.upload_dir(&upload_id)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("creating upload directory", e))?;

        let manifest = UploadManifest {
            key: key.to_string(),
            content_type: content_type.to_string(),
            initiated_at: Utc::now(),
        };
        let raw = serde_json::to_vec(&manifest)
            .map_err(|e| GatewayError::Unavailable(format!("encoding manifest: {}", e)))?;
        write_atomically(&dir.join(MANIFEST_FILE), &raw)
            .await
            .map_err(|e| io_error("writing upload manifest", e))?;

        info!(key, upload_id = %upload_id, "initiated multipart upload");
        Ok(upload_id)
    }

    async fn presign_part_upload(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        ttl: Duration,
    ) -> GatewayResult<String> {
        self.read_manifest(upload_id).await?;
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX / 2);
        let expires = Utc::now().timestamp() + ttl_secs;
        let signature = URL_SAFE_NO_PAD.encode(
            self.signature(upload_id, part_number, expires)
                .finalize()
                .into_bytes(),
        );
        Ok(format!(
            "{}/store/uploads/{}/parts/{}?expires={}&signature={}",
            self.public_base_url, upload_id, part_number, expires, signature
        ))
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> GatewayResult<ObjectMetadata> {
        let (dir, manifest) = self.read_manifest(upload_id).await?;
        if manifest.key != key {
            return Err(GatewayError::InvalidUploadId(upload_id.to_string()));
        }
        if parts.is_empty() {
            return Err(GatewayError::PartMismatch("no parts given".into()));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(GatewayError::PartMismatch(
                "parts must be in strictly ascending order".into(),
            ));
        }

        let mut combined = Context::new();
        for part in parts {
            let recorded = match fs::read_to_string(Self::etag_path(&dir, part.part_number)).await
            {
                Ok(etag) => etag,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    return Err(GatewayError::PartMismatch(format!(
                        "part {} was never uploaded",
                        part.part_number
                    )));
                }
                Err(err) => return Err(io_error("reading part etag", err)),
            };
            if recorded != normalize_etag(&part.etag) {
                return Err(GatewayError::PartMismatch(format!(
                    "etag mismatch for part {}",
                    part.part_number
                )));
            }
            combined.consume(recorded.as_bytes());
        }

        let dest = self.object_path(key)?;
        let parent = dest.parent().map(Path::to_path_buf).ok_or_else(|| {
            GatewayError::Unavailable("object path missing parent directory".into())
        })?;
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| io_error("creating object directory", e))?;

        let tmp = TempFile::in_dir(&parent);
        let size = async {
            let mut out = File::create(tmp.path()).await?;
            let mut size: u64 = 0;
            for part in parts {
                let mut input = File::open(Self::part_path(&dir, part.part_number)).await?;
                size += tokio::io::copy(&mut input, &mut out).await?;
            }
            out.sync_all().await?;
            Ok::<u64, io::Error>(size)
        }
        .await
        .map_err(|e| io_error("assembling object", e))?;
        tmp.persist(&dest)
            .await
            .map_err(|e| io_error("storing object", e))?;

        if let Err(err) = fs::remove_dir_all(&dir).await {
            debug!("failed to remove upload directory {}: {}", dir.display(), err);
        }

        let etag = format!("{:x}-{}", combined.compute(), parts.len());
        info!(key, upload_id, size, "completed multipart upload");
        Ok(ObjectMetadata {
            key: key.to_string(),
            size: Some(size),
            etag: Some(etag),
        })
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> GatewayResult<()> {
        let dir = self.upload_dir(upload_id)?;
        match fs::remove_dir_all(&dir).await {
            Ok(_) => {
                info!(upload_id, "aborted multipart upload");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error("removing upload directory", err)),
        }
    }

    async fn list_upload_parts(
        &self,
        _key: &str,
        upload_id: &str,
    ) -> GatewayResult<Vec<UploadedPart>> {
        let (dir, _) = self.read_manifest(upload_id).await?;
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| io_error("listing upload directory", e))?;

        let mut parts = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("listing upload directory", e))?
        {
            let name = entry.file_name();
            let Some(number) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".part"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            // A part without its etag file is still being written.
            let etag = match fs::read_to_string(Self::etag_path(&dir, number)).await {
                Ok(etag) => etag,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(io_error("reading part etag", err)),
            };
            let size = entry
                .metadata()
                .await
                .map_err(|e| io_error("reading part metadata", e))?
                .len();
            parts.push(UploadedPart {
                part_number: number,
                etag,
                size,
            });
        }
        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    async fn head_object(&self, key: &str) -> GatewayResult<Option<ObjectMetadata>> {
        let path = self.object_path(key)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(ObjectMetadata {
                key: key.to_string(),
                size: Some(meta.len()),
                etag: None,
            })),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error("reading object metadata", err)),
        }
    }

    async fn copy_object(&self, source_key: &str, dest_key: &str) -> GatewayResult<()> {
        let source = self.object_path(source_key)?;
        let dest = self.object_path(dest_key)?;
        if !fs::try_exists(&source)
            .await
            .map_err(|e| io_error("checking source object", e))?
        {
            return Err(GatewayError::NotFound(source_key.to_string()));
        }

        let parent = dest.parent().map(Path::to_path_buf).ok_or_else(|| {
            GatewayError::Unavailable("object path missing parent directory".into())
        })?;
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| io_error("creating object directory", e))?;
        let tmp = TempFile::in_dir(&parent);
        async {
            fs::copy(&source, tmp.path()).await?;
            File::open(tmp.path()).await?.sync_all().await
        }
        .await
        .map_err(|e| io_error("copying object", e))?;
        tmp.persist(&dest)
            .await
            .map_err(|e| io_error("storing copied object", e))?;

        info!(source_key, dest_key, "copied object");
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> GatewayResult<()> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed object file {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("object file {} already missing", path.display());
                return Ok(());
            }
            Err(err) => return Err(io_error("deleting object", err)),
        }
        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent, &self.objects_root()).await;
        }
        Ok(())
    }
}

/// A temporary file that becomes a real one only through [`TempFile::persist`].
/// Dropping it first removes the path, so an errored or cancelled write leaves
/// nothing on disk.
struct TempFile {
    path: PathBuf,
    persisted: bool,
}

impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            persisted: false,
        }
    }

    fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(format!(".tmp-{}", Uuid::new_v4())))
    }

    fn path(&self) -> &Path {
        &self.path
    }

    /// Rename into `dest`.
    async fn persist(mut self, dest: &Path) -> io::Result<()> {
        fs::rename(&self.path, dest).await?;
        self.persisted = true;
        Ok(())
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.persisted {
            // Drop cannot await.
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!("removed temporary file {}", self.path.display()),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => debug!("failed to remove {}: {}", self.path.display(), err),
            }
        }
    }
}

/// Write `data` to `path` through a temporary sibling and rename.
async fn write_atomically(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp = TempFile::new(path.with_extension(format!("tmp-{}", Uuid::new_v4().simple())));
    let mut file = File::create(tmp.path()).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    tmp.persist(path).await
}

fn io_error(context: &str, err: io::Error) -> GatewayError {
    GatewayError::Unavailable(format!("{}: {}", context, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tokio::io::AsyncReadExt;

    async fn store() -> (tempfile::TempDir, LocalObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), "http://localhost:3000/", b"test-secret")
            .await
            .unwrap();
        (dir, store)
    }

    /// (expires, signature) from a presigned part URL.
    fn url_params(url: &str) -> (i64, String) {
        let query = url.split_once('?').unwrap().1;
        let mut expires = 0;
        let mut signature = String::new();
        for pair in query.split('&') {
            match pair.split_once('=').unwrap() {
                ("expires", v) => expires = v.parse().unwrap(),
                ("signature", v) => signature = v.to_string(),
                _ => {}
            }
        }
        (expires, signature)
    }

    fn body(data: &'static [u8]) -> impl Stream<Item = io::Result<Bytes>> + Send {
        stream::iter(vec![Ok(Bytes::from_static(data))])
    }

    async fn upload_part(
        store: &LocalObjectStore,
        key: &str,
        upload_id: &str,
        n: u32,
        data: &'static [u8],
    ) -> String {
        let url = store
            .presign_part_upload(key, upload_id, n, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(url.starts_with(&format!(
            "http://localhost:3000/store/uploads/{}/parts/{}?",
            upload_id, n
        )));
        let (expires, signature) = url_params(&url);
        store
            .write_part(upload_id, n, expires, &signature, body(data))
            .await
            .unwrap()
    }

    fn completed(part_number: u32, etag: impl Into<String>) -> CompletedPart {
        CompletedPart {
            part_number,
            etag: etag.into(),
        }
    }

    /// Every `.tmp-` file left anywhere under `dir`.
    fn leftover_temp_files(dir: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            for entry in std::fs::read_dir(&current).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    pending.push(path);
                } else if path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.contains("tmp-"))
                {
                    found.push(path);
                }
            }
        }
        found
    }

    #[tokio::test]
    async fn multipart_upload_copy_and_delete() {
        let (_dir, store) = store().await;
        let staging = "staging/abc/clip.mp4";
        let upload_id = store
            .initiate_multipart_upload(staging, "video/mp4")
            .await
            .unwrap();

        let etag2 = upload_part(&store, staging, &upload_id, 2, b"world").await;
        let etag1 = upload_part(&store, staging, &upload_id, 1, b"hello ").await;
        assert_eq!(etag1, format!("{:x}", md5::compute(b"hello ")));

        let listed = store.list_upload_parts(staging, &upload_id).await.unwrap();
        assert_eq!(
            listed,
            vec![
                UploadedPart {
                    part_number: 1,
                    etag: etag1.clone(),
                    size: 6,
                },
                UploadedPart {
                    part_number: 2,
                    etag: etag2.clone(),
                    size: 5,
                },
            ]
        );

        let parts = [completed(1, format!("\"{}\"", etag1)), completed(2, etag2)];
        let meta = store
            .complete_multipart_upload(staging, &upload_id, &parts)
            .await
            .unwrap();
        assert_eq!(meta.size, Some(11));
        assert!(meta.etag.unwrap().ends_with("-2"));

        // The upload is gone once completed.
        assert_eq!(
            store.list_upload_parts(staging, &upload_id).await,
            Err(GatewayError::InvalidUploadId(upload_id.clone()))
        );

        let library = "library/standalone/2026/10/abc/clip.mp4";
        store.copy_object(staging, library).await.unwrap();
        store.delete_object(staging).await.unwrap();
        assert_eq!(store.head_object(staging).await, Ok(None));
        assert_eq!(
            store.head_object(library).await.unwrap().unwrap().size,
            Some(11)
        );

        let (_, mut file) = store.open_object(library).await.unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).await.unwrap();
        assert_eq!(contents, "hello world");

        // Deleting twice is fine.
        store.delete_object(staging).await.unwrap();
    }

    #[tokio::test]
    async fn abort_is_idempotent_and_invalidates_the_upload() {
        let (_dir, store) = store().await;
        let key = "staging/x/a.mp4";
        let upload_id = store
            .initiate_multipart_upload(key, "video/mp4")
            .await
            .unwrap();
        upload_part(&store, key, &upload_id, 1, b"data").await;

        store.abort_multipart_upload(key, &upload_id).await.unwrap();
        store.abort_multipart_upload(key, &upload_id).await.unwrap();

        assert_eq!(
            store
                .presign_part_upload(key, &upload_id, 1, Duration::from_secs(60))
                .await,
            Err(GatewayError::InvalidUploadId(upload_id.clone()))
        );
        assert!(matches!(
            store
                .complete_multipart_upload(key, &upload_id, &[completed(1, "x")])
                .await,
            Err(GatewayError::InvalidUploadId(_))
        ));
    }

    #[tokio::test]
    async fn rejects_bad_part_lists() {
        let (_dir, store) = store().await;
        let key = "staging/y/b.mp4";
        let upload_id = store
            .initiate_multipart_upload(key, "video/mp4")
            .await
            .unwrap();
        let e1 = upload_part(&store, key, &upload_id, 1, b"one").await;
        let e2 = upload_part(&store, key, &upload_id, 2, b"two").await;

        let out_of_order = [completed(2, e2.clone()), completed(1, e1.clone())];
        let wrong_etag = [completed(1, e1.clone()), completed(2, e1.clone())];
        let missing = [completed(1, e1), completed(3, e2)];
        for parts in [&out_of_order, &wrong_etag, &missing] {
            assert!(matches!(
                store
                    .complete_multipart_upload(key, &upload_id, parts)
                    .await,
                Err(GatewayError::PartMismatch(_))
            ));
        }
        assert!(leftover_temp_files(store.root()).is_empty());
    }

    #[tokio::test]
    async fn cancelled_completion_leaves_no_temp_files() {
        let (dir, store) = store().await;
        let key = "staging/slow/big.mp4";
        let upload_id = store
            .initiate_multipart_upload(key, "video/mp4")
            .await
            .unwrap();
        static CHUNK: [u8; 256 * 1024] = [7; 256 * 1024];
        let mut parts = Vec::new();
        for n in 1..=4 {
            let etag = upload_part(&store, key, &upload_id, n, &CHUNK).await;
            parts.push(completed(n, etag));
        }

        // Poll the completion one step at a time and drop it as soon as the
        // assembly file exists, the way a timeout would.
        {
            let fut = store.complete_multipart_upload(key, &upload_id, &parts);
            pin_mut!(fut);
            loop {
                assert!(
                    futures::poll!(fut.as_mut()).is_pending(),
                    "completion finished before it could be cancelled"
                );
                tokio::time::sleep(Duration::from_millis(20)).await;
                if !leftover_temp_files(dir.path()).is_empty() {
                    break;
                }
            }
        }

        assert_eq!(leftover_temp_files(dir.path()), Vec::<PathBuf>::new());
        assert_eq!(store.head_object(key).await, Ok(None));

        // The upload is untouched, so a retry still assembles the object.
        let meta = store
            .complete_multipart_upload(key, &upload_id, &parts)
            .await
            .unwrap();
        assert_eq!(meta.size, Some(4 * CHUNK.len() as u64));
        assert!(leftover_temp_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn temp_files_vanish_unless_persisted() {
        let dir = tempfile::tempdir().unwrap();

        let dropped = TempFile::in_dir(dir.path());
        std::fs::write(dropped.path(), b"partial").unwrap();
        let dropped_path = dropped.path().to_path_buf();
        drop(dropped);
        assert!(!dropped_path.exists());

        let kept = TempFile::in_dir(dir.path());
        std::fs::write(kept.path(), b"whole").unwrap();
        let dest = dir.path().join("object");
        kept.persist(&dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"whole");
        assert!(leftover_temp_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn refuses_tampered_or_expired_urls() {
        let (_dir, store) = store().await;
        let key = "staging/z/c.mp4";
        let upload_id = store
            .initiate_multipart_upload(key, "video/mp4")
            .await
            .unwrap();
        let url = store
            .presign_part_upload(key, &upload_id, 1, Duration::from_secs(60))
            .await
            .unwrap();
        let (expires, signature) = url_params(&url);

        // Signature is bound to the part number.
        assert!(matches!(
            store
                .write_part(&upload_id, 2, expires, &signature, body(b"x"))
                .await,
            Err(PartWriteError::BadSignature)
        ));
        // ...and to the expiry.
        assert!(matches!(
            store
                .write_part(&upload_id, 1, expires + 10, &signature, body(b"x"))
                .await,
            Err(PartWriteError::BadSignature)
        ));

        let stale = Utc::now().timestamp() - 5;
        let stale_sig = URL_SAFE_NO_PAD.encode(
            store
                .signature(&upload_id, 1, stale)
                .finalize()
                .into_bytes(),
        );
        assert!(matches!(
            store
                .write_part(&upload_id, 1, stale, &stale_sig, body(b"x"))
                .await,
            Err(PartWriteError::Expired)
        ));
    }

    #[tokio::test]
    async fn rejects_unsafe_keys() {
        let (_dir, store) = store().await;
        assert!(matches!(
            store
                .initiate_multipart_upload("../escape", "video/mp4")
                .await,
            Err(GatewayError::InvalidKey(_))
        ));
        assert!(matches!(
            store.copy_object("/abs", "ok").await,
            Err(GatewayError::InvalidKey(_))
        ));
        assert_eq!(
            store.copy_object("staging/missing", "library/x").await,
            Err(GatewayError::NotFound("staging/missing".into()))
        );
    }
}
