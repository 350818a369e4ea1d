#![allow(dead_code)]

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::sync::broadcast;
use uuid::Uuid;
use video_upload_sessions::{
    config::UploadPolicy,
    db,
    services::{
        gateway::{
            BoundedGateway, CompletedPart, GatewayError, GatewayResult, ObjectMetadata,
            ObjectStoreGateway, UploadedPart,
        },
        notifier::{BroadcastNotifier, ProgressEvent},
        part_plan::PartPlan,
        registrar::VideoRegistrar,
        session_manager::{CreateSession, CreatedSession, SessionManager},
        session_store::SessionStore,
    },
};

pub const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
struct MockUpload {
    key: String,
    /// part number -> (etag, size)
    parts: BTreeMap<u32, (String, u64)>,
}

#[derive(Default)]
struct MockState {
    next_upload: u32,
    uploads: HashMap<String, MockUpload>,
    objects: HashMap<String, u64>,
    calls: Vec<(&'static str, String)>,
    completions: Vec<Vec<CompletedPart>>,
    faults: HashMap<&'static str, VecDeque<GatewayError>>,
    hang: HashSet<&'static str>,
}

impl MockState {
    fn record(&mut self, op: &'static str, subject: &str) -> GatewayResult<()> {
        self.calls.push((op, subject.to_string()));
        match self.faults.get_mut(op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// In-memory object store that records every call except presigning.
#[derive(Default)]
pub struct MockGateway {
    state: Mutex<MockState>,
}

impl MockGateway {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Fail the next call of `op` with `err`.
    pub fn fail_next(&self, op: &'static str, err: GatewayError) {
        self.lock().faults.entry(op).or_default().push_back(err);
    }

    /// Perform `op` but never answer.
    pub fn hang_on(&self, op: &'static str) {
        self.lock().hang.insert(op);
    }

    pub fn stop_hanging(&self) {
        self.lock().hang.clear();
    }

    /// What a client PUT to a presigned URL would do. Returns the ETag.
    pub fn put_part(&self, upload_id: &str, part_number: u32, size: u64) -> String {
        let etag = format!("etag-{}-{}", upload_id, part_number);
        let mut state = self.lock();
        let upload = state.uploads.get_mut(upload_id).unwrap();
        upload.parts.insert(part_number, (etag.clone(), size));
        etag
    }

    pub fn calls(&self) -> Vec<(&'static str, String)> {
        self.lock().calls.clone()
    }

    pub fn ops(&self) -> Vec<&'static str> {
        self.lock().calls.iter().map(|(op, _)| *op).collect()
    }

    pub fn count(&self, op: &str) -> usize {
        self.lock().calls.iter().filter(|(o, _)| *o == op).count()
    }

    pub fn completions(&self) -> Vec<Vec<CompletedPart>> {
        self.lock().completions.clone()
    }

    pub fn has_object(&self, key: &str) -> bool {
        self.lock().objects.contains_key(key)
    }

    pub fn has_upload(&self, upload_id: &str) -> bool {
        self.lock().uploads.contains_key(upload_id)
    }

    fn hangs(&self, op: &'static str) -> bool {
        self.lock().hang.contains(op)
    }
}

#[async_trait]
impl ObjectStoreGateway for MockGateway {
    async fn initiate_multipart_upload(&self, key: &str, _: &str) -> GatewayResult<String> {
        let mut state = self.lock();
        state.record("initiate_multipart_upload", key)?;
        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            MockUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn presign_part_upload(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        _: Duration,
    ) -> GatewayResult<String> {
        Ok(format!(
            "mock://{}?uploadId={}&partNumber={}",
            key, upload_id, part_number
        ))
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> GatewayResult<ObjectMetadata> {
        let size = {
            let mut state = self.lock();
            state.completions.push(parts.to_vec());
            state.record("complete_multipart_upload", key)?;
            let upload = state
                .uploads
                .get(upload_id)
                .filter(|u| u.key == key)
                .cloned()
                .ok_or_else(|| GatewayError::InvalidUploadId(upload_id.to_string()))?;
            if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
                return Err(GatewayError::PartMismatch("parts out of order".into()));
            }
            let mut size = 0;
            for part in parts {
                match upload.parts.get(&part.part_number) {
                    Some((etag, len)) if *etag == part.etag => size += len,
                    _ => {
                        return Err(GatewayError::PartMismatch(format!(
                            "part {} does not match",
                            part.part_number
                        )));
                    }
                }
            }
            state.uploads.remove(upload_id);
            state.objects.insert(key.to_string(), size);
            size
        };
        if self.hangs("complete_multipart_upload") {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        Ok(ObjectMetadata {
            key: key.to_string(),
            size: Some(size),
            etag: Some(format!("assembled-{}", parts.len())),
        })
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> GatewayResult<()> {
        let mut state = self.lock();
        state.record("abort_multipart_upload", key)?;
        state.uploads.remove(upload_id);
        Ok(())
    }

    async fn list_upload_parts(
        &self,
        key: &str,
        upload_id: &str,
    ) -> GatewayResult<Vec<UploadedPart>> {
        let mut state = self.lock();
        state.record("list_upload_parts", key)?;
        let upload = state
            .uploads
            .get(upload_id)
            .ok_or_else(|| GatewayError::InvalidUploadId(upload_id.to_string()))?;
        Ok(upload
            .parts
            .iter()
            .map(|(n, (etag, size))| UploadedPart {
                part_number: *n,
                etag: etag.clone(),
                size: *size,
            })
            .collect())
    }

    async fn head_object(&self, key: &str) -> GatewayResult<Option<ObjectMetadata>> {
        let mut state = self.lock();
        state.record("head_object", key)?;
        Ok(state.objects.get(key).map(|size| ObjectMetadata {
            key: key.to_string(),
            size: Some(*size),
            etag: None,
        }))
    }

    async fn copy_object(&self, source_key: &str, dest_key: &str) -> GatewayResult<()> {
        let mut state = self.lock();
        state.record("copy_object", dest_key)?;
        let size = *state
            .objects
            .get(source_key)
            .ok_or_else(|| GatewayError::NotFound(source_key.to_string()))?;
        state.objects.insert(dest_key.to_string(), size);
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> GatewayResult<()> {
        let mut state = self.lock();
        state.record("delete_object", key)?;
        state.objects.remove(key);
        Ok(())
    }
}

/// Session manager over a fresh in-memory database and a [`MockGateway`].
pub struct Harness {
    pub manager: SessionManager,
    pub gateway: Arc<MockGateway>,
    pub db: Arc<SqlitePool>,
    pub notifier: Arc<BroadcastNotifier>,
}

pub fn policy() -> UploadPolicy {
    UploadPolicy {
        part_size: 8 * MIB,
        storage_timeout: Duration::from_millis(250),
        transfer_timeout: Duration::from_millis(250),
        read_attempts: 2,
        ..UploadPolicy::default()
    }
}

pub async fn harness() -> Harness {
    harness_with(policy()).await
}

pub async fn harness_with(policy: UploadPolicy) -> Harness {
    let db = db::connect_in_memory().await.unwrap();
    harness_on(db, policy)
}

/// Harness over a SQLite file opened with the server's pool settings, so
/// concurrent calls run on separate connections. Keep the directory alive
/// for the duration of the test.
pub async fn file_harness() -> (tempfile::TempDir, Harness) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("sessions.db").display());
    let db = db::connect(&url).await.unwrap();
    db::run_migrations(&db).await.unwrap();
    (dir, harness_on(db, policy()))
}

fn harness_on(db: SqlitePool, policy: UploadPolicy) -> Harness {
    let db = Arc::new(db);
    let gateway = Arc::new(MockGateway::default());
    let bounded = BoundedGateway::from_policy(gateway.clone(), &policy);
    let notifier = Arc::new(BroadcastNotifier::new(64));
    let manager = SessionManager::new(
        SessionStore::new(db.clone()),
        Arc::new(bounded),
        VideoRegistrar::new(db.clone()),
        notifier.clone(),
        policy,
    );
    Harness {
        manager,
        gateway,
        db,
        notifier,
    }
}

pub fn video_request(file_size: u64) -> CreateSession {
    CreateSession {
        file_size,
        content_type: "video/mp4".into(),
        filename: "Intro Lesson.mp4".into(),
        course_id: Some(Uuid::new_v4()),
        module_id: None,
        lesson_id: None,
        title: None,
    }
}

impl Harness {
    pub async fn create(&self, file_size: u64) -> CreatedSession {
        self.manager.create(video_request(file_size)).await.unwrap()
    }

    /// Upload one part's bytes to the mock store and return its ETag,
    /// without reporting it.
    pub async fn upload(&self, session_id: Uuid, part_number: u32) -> String {
        let session = self.manager.get_session(session_id).await.unwrap();
        let plan = PartPlan {
            file_size: session.file_size,
            part_size: session.part_size,
            part_count: session.part_count,
        };
        self.gateway
            .put_part(&session.upload_id, part_number, plan.part_len(part_number))
    }

    /// Upload and report `parts`, in the given order.
    pub async fn upload_and_report(&self, session_id: Uuid, parts: &[u32]) {
        for &n in parts {
            let etag = self.upload(session_id, n).await;
            self.manager
                .report_part_complete(session_id, n, &etag)
                .await
                .unwrap();
        }
    }

    pub fn events(&self) -> broadcast::Receiver<ProgressEvent> {
        self.notifier.subscribe()
    }
}
