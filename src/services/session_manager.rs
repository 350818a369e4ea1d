//! Upload Session State Machine.
//!
//! `SessionManager` owns the lifecycle of one upload:
//!
//! ```text
//! initiated → uploading → completing → completed
//!      \          |            |
//!       +---------+------------+--→ aborted | expired
//! ```
//!
//! It keeps no state between calls. Every transition is a conditional update
//! in [`SessionStore`], so any instance can serve any session and concurrent
//! requests on one session resolve to exactly one winner. Completion runs as
//! a sequence of recorded stages (finalize, promote, register, clean up)
//! under a time-bounded lease; a failed or interrupted completion resumes at
//! the first unrecorded stage without touching the uploaded parts.

use crate::{
    config::UploadPolicy,
    errors::UploadError,
    models::{
        session::{CompletionStage, SessionPart, SessionStatus, UploadSession},
        video::VideoLibraryEntry,
    },
    services::{
        gateway::{CompletedPart, GatewayError, ObjectStoreGateway, normalize_etag},
        keys,
        notifier::{ProgressEvent, ProgressNotifier, percentage},
        part_plan::PartPlan,
        registrar::{NewVideo, VideoRegistrar},
        session_store::{PartRecord, SessionStore},
    },
};
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt, stream};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Presign calls in flight at once while issuing part URLs.
const PRESIGN_CONCURRENCY: usize = 16;
/// Sessions handled per sweep pass.
const SWEEP_BATCH: i64 = 500;
const DEFAULT_PAGE: i64 = 20;
const MAX_PAGE: i64 = 100;

/// Input to [`SessionManager::create`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSession {
    pub file_size: u64,
    pub content_type: String,
    pub filename: String,
    pub course_id: Option<Uuid>,
    pub module_id: Option<Uuid>,
    pub lesson_id: Option<Uuid>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartUrl {
    pub part_number: u32,
    pub upload_url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSession {
    pub session_id: Uuid,
    pub video_id: Uuid,
    pub part_size: u64,
    pub part_count: u32,
    pub expires_at: DateTime<Utc>,
    pub parts: Vec<PartUrl>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartReport {
    pub part_number: u32,
    /// False when the same ETag had already been recorded.
    pub recorded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub parts_reported: u32,
    pub part_count: u32,
    pub percentage: f64,
    pub bytes_reported: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedUpload {
    pub video_id: Uuid,
    pub library_key: String,
    pub video: VideoLibraryEntry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortOutcome {
    pub session_id: Uuid,
    pub status: SessionStatus,
}

/// What [`SessionManager::reconcile`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Parts the store has that were never reported.
    pub added: Vec<u32>,
    /// Parts whose recorded ETag differed from the store's.
    pub corrected: Vec<u32>,
    /// Parts recorded locally that the store does not have.
    pub cleared: Vec<u32>,
    /// Parts still missing after reconciliation.
    pub missing: Vec<u32>,
    /// The multipart upload had already been finalized upstream.
    pub finalized_upstream: bool,
    pub status: Option<SessionStatus>,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        !(self.added.is_empty() && self.corrected.is_empty() && self.cleared.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: usize,
    pub resumed: usize,
    pub failures: usize,
}

#[derive(Clone)]
pub struct SessionManager {
    store: SessionStore,
    gateway: Arc<dyn ObjectStoreGateway>,
    registrar: VideoRegistrar,
    notifier: Arc<dyn ProgressNotifier>,
    policy: Arc<UploadPolicy>,
}

impl SessionManager {
    pub fn new(
        store: SessionStore,
        gateway: Arc<dyn ObjectStoreGateway>,
        registrar: VideoRegistrar,
        notifier: Arc<dyn ProgressNotifier>,
        policy: UploadPolicy,
    ) -> Self {
        Self {
            store,
            gateway,
            registrar,
            notifier,
            policy: Arc::new(policy),
        }
    }

    pub fn registrar(&self) -> &VideoRegistrar {
        &self.registrar
    }

    /// Validate the file, open a multipart upload and issue one presigned URL
    /// per part.
    pub async fn create(&self, req: CreateSession) -> Result<CreatedSession, UploadError> {
        validate_file(&self.policy, &req)?;
        let plan = PartPlan::new(req.file_size, self.policy.part_size)
            .map_err(|e| UploadError::InvalidFile(e.to_string()))?;

        let now = Utc::now();
        let id = Uuid::new_v4();
        let staging_key = keys::staging_key(id, &req.filename);
        let library_key = keys::library_key(req.course_id, id, &req.filename, now);

        let upload_id = self
            .gateway
            .initiate_multipart_upload(&staging_key, &req.content_type)
            .await?;

        let urls = match self.presign_parts(&staging_key, &upload_id, plan.part_count).await {
            Ok(urls) => urls,
            Err(err) => {
                self.abandon_upload(&staging_key, &upload_id).await;
                return Err(err.into());
            }
        };

        let title = req
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| default_title(&req.filename));
        let session = UploadSession {
            id,
            upload_id: upload_id.clone(),
            staging_key: staging_key.clone(),
            library_key,
            filename: req.filename,
            content_type: req.content_type,
            file_size: plan.file_size,
            part_size: plan.part_size,
            part_count: plan.part_count,
            course_id: req.course_id,
            module_id: req.module_id,
            lesson_id: req.lesson_id,
            title: Some(title),
            status: SessionStatus::Initiated,
            completion_stage: CompletionStage::Pending,
            lease_expires_at: None,
            video_id: None,
            last_error: None,
            retry_count: 0,
            parts: urls
                .iter()
                .map(|(n, url)| SessionPart {
                    part_number: *n,
                    upload_url: url.clone(),
                    etag: None,
                })
                .collect(),
            created_at: now,
            updated_at: now,
            expires_at: add_duration(now, self.policy.session_ttl),
            completed_at: None,
        };

        if let Err(err) = self.store.insert(&session).await {
            self.abandon_upload(&staging_key, &upload_id).await;
            return Err(err.into());
        }
        self.store.mark_uploading(id, Utc::now()).await?;

        info!(
            session_id = %id,
            key = %staging_key,
            upload_id = %upload_id,
            file_size = plan.file_size,
            part_count = plan.part_count,
            "created upload session"
        );
        self.publish(id).await;

        Ok(CreatedSession {
            session_id: id,
            video_id: id,
            part_size: plan.part_size,
            part_count: plan.part_count,
            expires_at: session.expires_at,
            parts: urls
                .into_iter()
                .map(|(part_number, upload_url)| PartUrl {
                    part_number,
                    upload_url,
                })
                .collect(),
        })
    }

    /// Record the ETag the store returned for one part.
    pub async fn report_part_complete(
        &self,
        id: Uuid,
        part_number: u32,
        etag: &str,
    ) -> Result<PartReport, UploadError> {
        let session = self.load(id).await?;
        if session.status != SessionStatus::Uploading {
            return Err(UploadError::InvalidState {
                status: session.status,
                action: "report a part for",
            });
        }
        if part_number == 0 || part_number > session.part_count {
            return Err(UploadError::InvalidPart {
                part_number,
                part_count: session.part_count,
            });
        }

        let etag = normalize_etag(etag);
        match self
            .store
            .record_part_etag(id, part_number, &etag, Utc::now())
            .await?
        {
            PartRecord::Recorded => {
                debug!(session_id = %id, part_number, %etag, "recorded part");
                self.publish(id).await;
                Ok(PartReport {
                    part_number,
                    recorded: true,
                })
            }
            PartRecord::Unchanged => Ok(PartReport {
                part_number,
                recorded: false,
            }),
            PartRecord::Conflict { recorded } => Err(UploadError::PartConflict {
                part_number,
                recorded,
            }),
            PartRecord::NotUploading(status) => Err(UploadError::InvalidState {
                status,
                action: "report a part for",
            }),
            PartRecord::UnknownSession => Err(UploadError::SessionNotFound(id)),
            PartRecord::UnknownPart => Err(UploadError::InvalidPart {
                part_number,
                part_count: session.part_count,
            }),
        }
    }

    pub async fn get_progress(&self, id: Uuid) -> Result<UploadProgress, UploadError> {
        let session = self.load(id).await?;
        let plan = PartPlan {
            file_size: session.file_size,
            part_size: session.part_size,
            part_count: session.part_count,
        };
        let bytes_reported = session
            .parts
            .iter()
            .filter(|p| p.etag.is_some())
            .map(|p| plan.part_len(p.part_number))
            .sum();
        let parts_reported = session.parts_reported();
        Ok(UploadProgress {
            session_id: id,
            status: session.status,
            parts_reported,
            part_count: session.part_count,
            percentage: percentage(parts_reported, session.part_count),
            bytes_reported,
        })
    }

    /// Finalize the upload and promote it into the library.
    ///
    /// Calling it on a `completed` session returns the stored result; on a
    /// `completing` session it resumes, unless another request holds the lease.
    pub async fn complete(&self, id: Uuid) -> Result<CompletedUpload, UploadError> {
        let session = self.load(id).await?;
        match session.status {
            SessionStatus::Uploading => {}
            SessionStatus::Completed => return self.completed_result(&session).await,
            SessionStatus::Completing => return self.resume_session(session).await,
            status => {
                return Err(UploadError::InvalidState {
                    status,
                    action: "complete",
                });
            }
        }

        let missing = session.missing_parts();
        if !missing.is_empty() {
            return Err(UploadError::IncompletePartSet { missing });
        }

        let now = Utc::now();
        if !self
            .store
            .claim_completion(id, now, self.lease_until(now))
            .await?
        {
            let current = self.load(id).await?;
            return match current.status {
                SessionStatus::Uploading => Err(UploadError::IncompletePartSet {
                    missing: current.missing_parts(),
                }),
                SessionStatus::Completing => Err(UploadError::CompletionInProgress(id)),
                SessionStatus::Completed => self.completed_result(&current).await,
                status => Err(UploadError::InvalidState {
                    status,
                    action: "complete",
                }),
            };
        }
        info!(session_id = %id, "completion started");

        let session = self.load(id).await?;
        self.run_completion(session).await
    }

    /// Continue a `completing` session from its last recorded stage.
    pub async fn resume(&self, id: Uuid) -> Result<CompletedUpload, UploadError> {
        let session = self.load(id).await?;
        match session.status {
            SessionStatus::Completing => self.resume_session(session).await,
            SessionStatus::Completed => self.completed_result(&session).await,
            status => Err(UploadError::InvalidState {
                status,
                action: "resume",
            }),
        }
    }

    /// Cancel the session. Aborting an aborted session is a no-op.
    pub async fn abort(&self, id: Uuid) -> Result<AbortOutcome, UploadError> {
        let session = self.load(id).await?;
        let aborted = AbortOutcome {
            session_id: id,
            status: SessionStatus::Aborted,
        };
        match session.status {
            SessionStatus::Aborted => return Ok(aborted),
            status if status.is_terminal() => {
                return Err(UploadError::InvalidState {
                    status,
                    action: "abort",
                });
            }
            _ => {}
        }

        let now = Utc::now();
        if !self.store.abort(id, now).await? {
            let current = self.load(id).await?;
            return match current.status {
                SessionStatus::Aborted => Ok(aborted),
                SessionStatus::Completing if current.lease_held(now) => {
                    Err(UploadError::CompletionInProgress(id))
                }
                status => Err(UploadError::InvalidState {
                    status,
                    action: "abort",
                }),
            };
        }
        info!(session_id = %id, from = %session.status, "aborted upload session");

        // The stage may have advanced between the first read and the abort.
        let session = self.load(id).await?;
        self.discard_objects(&session).await;
        self.publish(id).await;
        Ok(aborted)
    }

    /// Bring local part bookkeeping in line with what the store received.
    pub async fn reconcile(&self, id: Uuid) -> Result<ReconcileReport, UploadError> {
        let session = self.load(id).await?;
        match session.status {
            SessionStatus::Initiated | SessionStatus::Uploading => {
                self.reconcile_parts(session).await
            }
            SessionStatus::Completing => self.reconcile_completion(session).await,
            status => Err(UploadError::InvalidState {
                status,
                action: "reconcile",
            }),
        }
    }

    pub async fn sweep_expired(&self) -> SweepReport {
        self.sweep_expired_at(Utc::now()).await
    }

    /// Expire every unfinished session whose deadline is before `now`, and
    /// try to finish stuck completions that are past promotion. Never fails.
    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let ids = match self.store.list_expired(now, SWEEP_BATCH).await {
            Ok(ids) => ids,
            Err(err) => {
                error!(error = %err, "listing expired upload sessions failed");
                report.failures += 1;
                return report;
            }
        };

        for id in ids {
            report.scanned += 1;
            match self.store.expire(id, now).await {
                Ok(true) => {}
                Ok(false) => {
                    if self.sweep_resume(id, now).await {
                        report.resumed += 1;
                    }
                    continue;
                }
                Err(err) => {
                    error!(session_id = %id, error = %err, "expiring upload session failed");
                    report.failures += 1;
                    continue;
                }
            }
            report.expired += 1;
            info!(session_id = %id, "expired upload session");

            match self.store.fetch(id).await {
                Ok(Some(session)) => {
                    report.failures += self.discard_objects(&session).await;
                    self.notifier.publish(ProgressEvent::from_session(&session));
                }
                Ok(None) => {}
                Err(err) => {
                    error!(session_id = %id, error = %err, "reloading expired session failed");
                    report.failures += 1;
                }
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                expired = report.expired,
                resumed = report.resumed,
                failures = report.failures,
                "sweep finished"
            );
        }
        report
    }

    /// Re-issue every part URL of an unfinished upload.
    pub async fn refresh_part_urls(&self, id: Uuid) -> Result<Vec<PartUrl>, UploadError> {
        let session = self.load(id).await?;
        if !matches!(
            session.status,
            SessionStatus::Initiated | SessionStatus::Uploading
        ) {
            return Err(UploadError::InvalidState {
                status: session.status,
                action: "refresh part URLs for",
            });
        }

        let urls = self
            .presign_parts(&session.staging_key, &session.upload_id, session.part_count)
            .await?;
        if !self.store.update_part_urls(id, &urls, Utc::now()).await? {
            let current = self.load(id).await?;
            return Err(UploadError::InvalidState {
                status: current.status,
                action: "refresh part URLs for",
            });
        }
        debug!(session_id = %id, parts = urls.len(), "refreshed part URLs");

        Ok(urls
            .into_iter()
            .map(|(part_number, upload_url)| PartUrl {
                part_number,
                upload_url,
            })
            .collect())
    }

    pub async fn get_session(&self, id: Uuid) -> Result<UploadSession, UploadError> {
        self.load(id).await
    }

    /// Newest first; `limit` is clamped to `1..=100` and defaults to 20.
    pub async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<UploadSession>, UploadError> {
        let limit = limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
        let offset = offset.unwrap_or(0).max(0);
        Ok(self.store.list(status, limit, offset).await?)
    }

    async fn load(&self, id: Uuid) -> Result<UploadSession, UploadError> {
        self.store
            .fetch(id)
            .await?
            .ok_or(UploadError::SessionNotFound(id))
    }

    fn lease_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        add_duration(now, self.policy.completion_lease)
    }

    async fn presign_parts(
        &self,
        key: &str,
        upload_id: &str,
        part_count: u32,
    ) -> Result<Vec<(u32, String)>, GatewayError> {
        let ttl = self.policy.part_url_ttl;
        stream::iter(1..=part_count)
            .map(|n| async move {
                self.gateway
                    .presign_part_upload(key, upload_id, n, ttl)
                    .await
                    .map(|url| (n, url))
            })
            .buffered(PRESIGN_CONCURRENCY)
            .try_collect()
            .await
    }

    async fn abandon_upload(&self, key: &str, upload_id: &str) {
        if let Err(err) = self.gateway.abort_multipart_upload(key, upload_id).await {
            warn!(key, upload_id, error = %err, "could not abort abandoned multipart upload");
        }
    }

    async fn completed_result(
        &self,
        session: &UploadSession,
    ) -> Result<CompletedUpload, UploadError> {
        let video_id = session.video_id.unwrap_or(session.id);
        let video = self.registrar.get_video(video_id).await?;
        Ok(CompletedUpload {
            video_id,
            library_key: session.library_key.clone(),
            video,
        })
    }

    async fn resume_session(&self, session: UploadSession) -> Result<CompletedUpload, UploadError> {
        let id = session.id;
        let now = Utc::now();
        if !self.store.claim_resume(id, now, self.lease_until(now)).await? {
            let current = self.load(id).await?;
            return match current.status {
                SessionStatus::Completed => self.completed_result(&current).await,
                SessionStatus::Completing => Err(UploadError::CompletionInProgress(id)),
                status => Err(UploadError::InvalidState {
                    status,
                    action: "resume",
                }),
            };
        }
        info!(session_id = %id, stage = session.completion_stage.as_str(), "resuming completion");

        let session = self.load(id).await?;
        self.run_completion(session).await
    }

    /// Run the completion stages the session has not recorded yet. The caller
    /// holds the lease.
    async fn run_completion(&self, session: UploadSession) -> Result<CompletedUpload, UploadError> {
        let id = session.id;
        let mut stage = session.completion_stage;
        let mut video = None;

        if stage == CompletionStage::Pending {
            self.finalize(&session).await?;
            self.record_stage(id, CompletionStage::Finalized).await?;
            stage = CompletionStage::Finalized;
        }

        if stage == CompletionStage::Finalized {
            if let Err(err) = self
                .gateway
                .copy_object(&session.staging_key, &session.library_key)
                .await
            {
                return Err(self.step_failed(id, "promote", err.into()).await);
            }
            info!(session_id = %id, key = %session.library_key, "promoted object to library");
            self.record_stage(id, CompletionStage::Promoted).await?;
            stage = CompletionStage::Promoted;
        }

        if stage == CompletionStage::Promoted {
            let new_video = NewVideo {
                video_id: id,
                library_key: session.library_key.clone(),
                course_id: session.course_id,
                module_id: session.module_id,
                lesson_id: session.lesson_id,
                title: session
                    .title
                    .clone()
                    .unwrap_or_else(|| default_title(&session.filename)),
                original_filename: session.filename.clone(),
                content_type: session.content_type.clone(),
                size_bytes: session.file_size,
                duration_seconds: None,
            };
            match self.registrar.register_video(&new_video).await {
                Ok(entry) => video = Some(entry),
                Err(err) => {
                    let err = UploadError::RegistrationFailed(err.to_string());
                    return Err(self.step_failed(id, "register", err).await);
                }
            }
            self.record_stage(id, CompletionStage::Registered).await?;
        }

        // Only reached once the library copy is confirmed.
        if let Err(err) = self.gateway.delete_object(&session.staging_key).await {
            warn!(
                session_id = %id,
                key = %session.staging_key,
                error = %err,
                "could not delete staging object"
            );
        }

        if !self.store.finish_completion(id, id, Utc::now()).await? {
            return Err(self.lost_claim(id, "complete").await);
        }
        info!(session_id = %id, video_id = %id, "upload completed");
        self.publish(id).await;

        let video = match video {
            Some(video) => video,
            None => self.registrar.get_video(id).await?,
        };
        Ok(CompletedUpload {
            video_id: id,
            library_key: session.library_key,
            video,
        })
    }

    /// Assemble the multipart upload. An upload that is already gone but whose
    /// object exists counts as finalized by an earlier attempt.
    async fn finalize(&self, session: &UploadSession) -> Result<(), UploadError> {
        let id = session.id;
        let parts: Vec<CompletedPart> = session
            .parts
            .iter()
            .filter_map(|p| {
                p.etag.as_ref().map(|etag| CompletedPart {
                    part_number: p.part_number,
                    etag: etag.clone(),
                })
            })
            .collect();

        match self
            .gateway
            .complete_multipart_upload(&session.staging_key, &session.upload_id, &parts)
            .await
        {
            Ok(meta) => {
                info!(
                    session_id = %id,
                    key = %session.staging_key,
                    upload_id = %session.upload_id,
                    etag = ?meta.etag,
                    "finalized multipart upload"
                );
                Ok(())
            }
            Err(GatewayError::InvalidUploadId(upload_id)) => {
                match self.gateway.head_object(&session.staging_key).await {
                    Ok(Some(_)) => {
                        info!(
                            session_id = %id,
                            %upload_id,
                            "multipart upload was already finalized"
                        );
                        Ok(())
                    }
                    Ok(None) => Err(self
                        .step_failed(id, "finalize", UploadError::InvalidUploadId(upload_id))
                        .await),
                    Err(err) => Err(self.step_failed(id, "finalize", err.into()).await),
                }
            }
            // Outcome unknown: stay completing so recovery can find out.
            Err(GatewayError::Timeout(op)) => Err(self
                .step_failed(id, "finalize", UploadError::StorageTimeout(op))
                .await),
            Err(err) => {
                let err = UploadError::from(err);
                warn!(
                    session_id = %id,
                    error = %err,
                    "store rejected finalization; back to uploading"
                );
                match self.store.revert_to_uploading(id, &err.to_string(), Utc::now()).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(
                            session_id = %id,
                            "session moved on before it could be reverted"
                        )
                    }
                    Err(store_err) => {
                        error!(
                            session_id = %id,
                            error = %store_err,
                            "reverting session failed"
                        )
                    }
                }
                Err(err)
            }
        }
    }

    async fn record_stage(&self, id: Uuid, stage: CompletionStage) -> Result<(), UploadError> {
        if self.store.advance_stage(id, stage, Utc::now()).await? {
            debug!(session_id = %id, stage = stage.as_str(), "completion stage recorded");
            Ok(())
        } else {
            Err(self.lost_claim(id, "complete").await)
        }
    }

    /// Release the lease after a failed step, keeping the session `completing`.
    async fn step_failed(&self, id: Uuid, step: &'static str, err: UploadError) -> UploadError {
        warn!(
            session_id = %id,
            step,
            error = %err,
            "completion step failed; session left completing"
        );
        if let Err(store_err) = self.store.release_lease(id, &err.to_string(), Utc::now()).await {
            error!(session_id = %id, error = %store_err, "releasing completion lease failed");
        }
        err
    }

    /// Explain why a conditional update found the session in another state.
    async fn lost_claim(&self, id: Uuid, action: &'static str) -> UploadError {
        match self.store.fetch(id).await {
            Ok(Some(session)) if session.status == SessionStatus::Completing => {
                UploadError::CompletionInProgress(id)
            }
            Ok(Some(session)) => UploadError::InvalidState {
                status: session.status,
                action,
            },
            Ok(None) => UploadError::SessionNotFound(id),
            Err(err) => err.into(),
        }
    }

    async fn reconcile_parts(
        &self,
        session: UploadSession,
    ) -> Result<ReconcileReport, UploadError> {
        let id = session.id;
        let listed = self
            .gateway
            .list_upload_parts(&session.staging_key, &session.upload_id)
            .await?;

        let mut upstream = BTreeMap::new();
        for part in listed {
            if part.part_number == 0 || part.part_number > session.part_count {
                warn!(
                    session_id = %id,
                    part_number = part.part_number,
                    "store reports a part outside the plan"
                );
                continue;
            }
            upstream.insert(part.part_number, normalize_etag(&part.etag));
        }

        let mut report = ReconcileReport::default();
        let mut updates = Vec::new();
        for part in &session.parts {
            let store_etag = upstream.get(&part.part_number);
            match (&part.etag, store_etag) {
                (None, Some(etag)) => {
                    report.added.push(part.part_number);
                    updates.push((part.part_number, Some(etag.clone())));
                }
                (Some(local), Some(etag)) if local != etag => {
                    report.corrected.push(part.part_number);
                    updates.push((part.part_number, Some(etag.clone())));
                }
                (Some(_), None) => {
                    report.cleared.push(part.part_number);
                    updates.push((part.part_number, None));
                }
                _ => {}
            }
        }

        if !self
            .store
            .apply_reconciliation(id, &updates, Utc::now())
            .await?
        {
            return Err(self.lost_claim(id, "reconcile").await);
        }

        let current = self.load(id).await?;
        report.missing = current.missing_parts();
        report.status = Some(current.status);
        if report.changed() {
            info!(
                session_id = %id,
                added = report.added.len(),
                corrected = report.corrected.len(),
                cleared = report.cleared.len(),
                "reconciled parts with the store"
            );
            self.notifier.publish(ProgressEvent::from_session(&current));
        }
        Ok(report)
    }

    async fn reconcile_completion(
        &self,
        session: UploadSession,
    ) -> Result<ReconcileReport, UploadError> {
        let id = session.id;
        if session.lease_held(Utc::now()) {
            return Err(UploadError::CompletionInProgress(id));
        }

        let mut report = ReconcileReport {
            missing: session.missing_parts(),
            status: Some(session.status),
            ..Default::default()
        };
        if session.completion_stage != CompletionStage::Pending {
            return Ok(report);
        }

        match self
            .gateway
            .list_upload_parts(&session.staging_key, &session.upload_id)
            .await
        {
            Ok(_) => {}
            Err(GatewayError::InvalidUploadId(_)) => {
                if self.gateway.head_object(&session.staging_key).await?.is_some() {
                    if self
                        .store
                        .advance_stage(id, CompletionStage::Finalized, Utc::now())
                        .await?
                    {
                        info!(session_id = %id, "upload already finalized upstream");
                        report.finalized_upstream = true;
                    }
                } else {
                    warn!(session_id = %id, "multipart upload is gone and no object was assembled");
                }
            }
            Err(err) => return Err(err.into()),
        }
        Ok(report)
    }

    /// Resume a stale completion the sweeper could not expire.
    async fn sweep_resume(&self, id: Uuid, now: DateTime<Utc>) -> bool {
        let session = match self.store.fetch(id).await {
            Ok(Some(session)) => session,
            Ok(None) => return false,
            Err(err) => {
                error!(session_id = %id, error = %err, "reloading stale session failed");
                return false;
            }
        };
        if session.status != SessionStatus::Completing || session.lease_held(now) {
            return false;
        }
        match self.resume_session(session).await {
            Ok(done) => {
                info!(
                    session_id = %id,
                    video_id = %done.video_id,
                    "sweeper finished stalled completion"
                );
                true
            }
            Err(err) => {
                warn!(
                    session_id = %id,
                    error = %err,
                    "sweeper could not finish stalled completion"
                );
                false
            }
        }
    }

    /// Best-effort removal of everything a dead session left in the store.
    /// Returns how many calls failed.
    async fn discard_objects(&self, session: &UploadSession) -> usize {
        let mut failures = 0;
        if let Err(err) = self
            .gateway
            .abort_multipart_upload(&session.staging_key, &session.upload_id)
            .await
        {
            warn!(
                session_id = %session.id,
                upload_id = %session.upload_id,
                error = %err,
                "could not abort multipart upload"
            );
            failures += 1;
        }
        if let Err(err) = self.gateway.delete_object(&session.staging_key).await {
            warn!(
                session_id = %session.id,
                key = %session.staging_key,
                error = %err,
                "could not delete staging object"
            );
            failures += 1;
        }
        if session.completion_stage >= CompletionStage::Promoted {
            if let Err(err) = self.gateway.delete_object(&session.library_key).await {
                warn!(
                    session_id = %session.id,
                    key = %session.library_key,
                    error = %err,
                    "could not delete promoted object"
                );
                failures += 1;
            }
        }
        failures
    }

    async fn publish(&self, id: Uuid) {
        match self.store.fetch(id).await {
            Ok(Some(session)) => self.notifier.publish(ProgressEvent::from_session(&session)),
            Ok(None) => {}
            Err(err) => debug!(session_id = %id, error = %err, "skipping progress event"),
        }
    }
}

/// Size, type and extension checks done before any storage call.
fn validate_file(policy: &UploadPolicy, req: &CreateSession) -> Result<(), UploadError> {
    if req.filename.trim().is_empty() {
        return Err(UploadError::InvalidFile("filename is required".into()));
    }
    if req.file_size == 0 {
        return Err(UploadError::InvalidFile("file is empty".into()));
    }
    if req.file_size > policy.max_file_size {
        return Err(UploadError::InvalidFile(format!(
            "file is {} bytes; the limit is {} bytes",
            req.file_size, policy.max_file_size
        )));
    }
    if !policy
        .allowed_content_types
        .iter()
        .any(|t| t.eq_ignore_ascii_case(req.content_type.trim()))
    {
        return Err(UploadError::InvalidFile(format!(
            "content type `{}` is not allowed",
            req.content_type
        )));
    }
    match keys::extension(&req.filename) {
        Some(ext) if policy.allowed_extensions.iter().any(|e| *e == ext) => Ok(()),
        Some(ext) => Err(UploadError::InvalidFile(format!(
            "extension `.{}` is not allowed",
            ext
        ))),
        None => Err(UploadError::InvalidFile("filename has no extension".into())),
    }
}

/// Filename without its extension.
fn default_title(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((stem, _)) if !stem.trim().is_empty() => stem.trim().to_string(),
        _ => filename.trim().to_string(),
    }
}

/// 9999-12-31T23:59:59Z, the last instant with a four-digit year.
const LATEST_STORED_SECS: i64 = 253_402_300_799;

/// `now + duration`, saturating at the last instant whose RFC 3339 text still
/// sorts correctly against other stored timestamps.
fn add_duration(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    let latest =
        DateTime::from_timestamp(LATEST_STORED_SECS, 0).unwrap_or(DateTime::<Utc>::MAX_UTC);
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .map_or(latest, |at| at.min(latest))
}
