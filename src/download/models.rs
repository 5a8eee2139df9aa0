//! 下载任务相关的数据模型定义。
//!
//! 包含任务描述（DownloadJob）、状态枚举、任务快照、事件类型与服务类型。

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Shared handle to a queued job. Identity is the allocation (and its [`JobId`]).
pub type JobHandle = Arc<DownloadJob>;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    fn next() -> Self {
        Self(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Downloading)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Downloading => "Downloading",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DownloadOptions {
    pub audio_only: bool,
}

impl DownloadOptions {
    pub fn file_extension(&self) -> &'static str {
        if self.audio_only { "mp3" } else { "mp4" }
    }
}

/// Mutable execution state of a job, guarded by the job's own mutex.
#[derive(Debug, Clone)]
pub struct JobState {
    pub status: DownloadStatus,
    pub progress: f64,
    pub speed: f64,
    pub completed_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
}

impl Default for JobState {
    fn default() -> Self {
        Self {
            status: DownloadStatus::Pending,
            progress: 0.0,
            speed: 0.0,
            completed_at: None,
            error_message: None,
        }
    }
}

/// One queued download request.
///
/// `name`/`url`/`options` are fixed at creation. Status, progress and the
/// terminal timestamps change only through the transition methods below,
/// which refuse to leave a terminal state.
#[derive(Debug)]
pub struct DownloadJob {
    id: JobId,
    name: String,
    url: String,
    options: DownloadOptions,
    created_at: OffsetDateTime,
    cancel: AtomicBool,
    state: Mutex<JobState>,
}

impl DownloadJob {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::with_options(name, url, DownloadOptions::default())
    }

    pub fn with_options(
        name: impl Into<String>,
        url: impl Into<String>,
        options: DownloadOptions,
    ) -> Self {
        Self {
            id: JobId::next(),
            name: name.into(),
            url: url.into(),
            options,
            created_at: OffsetDateTime::now_utc(),
            cancel: AtomicBool::new(false),
            state: Mutex::new(JobState::default()),
        }
    }

    pub fn into_handle(self) -> JobHandle {
        Arc::new(self)
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn options(&self) -> DownloadOptions {
        self.options
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn status(&self) -> DownloadStatus {
        self.lock_state().status
    }

    pub fn progress(&self) -> f64 {
        self.lock_state().progress
    }

    pub fn state(&self) -> JobState {
        self.lock_state().clone()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let state = self.state();
        JobSnapshot {
            id: self.id,
            name: self.name.clone(),
            url: self.url.clone(),
            status: state.status,
            progress: state.progress,
            speed: state.speed,
            created_at: self.created_at,
            completed_at: state.completed_at,
            error_message: state.error_message,
        }
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    // ── 状态迁移 ──────────────────────────────────────────────────

    /// PENDING -> DOWNLOADING. Returns `false` when the job is not pending.
    pub(crate) fn mark_downloading(&self) -> bool {
        let mut st = self.lock_state();
        if st.status != DownloadStatus::Pending {
            return false;
        }
        st.status = DownloadStatus::Downloading;
        true
    }

    /// Records a progress report. Terminal jobs ignore late reports.
    pub(crate) fn update_progress(&self, progress: f64, speed: f64) -> bool {
        let mut st = self.lock_state();
        if st.status.is_terminal() {
            return false;
        }
        st.progress = progress.clamp(0.0, 100.0);
        st.speed = speed.max(0.0);
        true
    }

    pub(crate) fn mark_completed(&self) -> bool {
        self.finish(DownloadStatus::Completed, None)
    }

    pub(crate) fn mark_failed(&self, error: impl Into<String>) -> bool {
        self.finish(DownloadStatus::Failed, Some(error.into()))
    }

    pub(crate) fn mark_cancelled(&self) -> bool {
        self.finish(DownloadStatus::Cancelled, None)
    }

    /// Overrides the stored progress after a terminal transition (the forced 100%).
    pub(crate) fn force_progress(&self, progress: f64) {
        self.lock_state().progress = progress.clamp(0.0, 100.0);
    }

    fn finish(&self, status: DownloadStatus, error: Option<String>) -> bool {
        let mut st = self.lock_state();
        if st.status.is_terminal() {
            return false;
        }
        st.status = status;
        st.error_message = error;
        if st.completed_at.is_none() {
            st.completed_at = Some(OffsetDateTime::now_utc());
        }
        true
    }

    fn lock_state(&self) -> MutexGuard<'_, JobState> {
        // A poisoned job state is still structurally valid; keep reading it.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Immutable copy of a job, handed to UI callbacks and printed as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub name: String,
    pub url: String,
    pub status: DownloadStatus,
    pub progress: f64,
    pub speed: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
}

// ── 事件 ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Started,
    Progress,
    Completed,
    Failed,
    Cancelled,
}

impl EventKind {
    pub const COUNT: usize = 5;

    pub const ALL: [EventKind; Self::COUNT] = [
        EventKind::Started,
        EventKind::Progress,
        EventKind::Completed,
        EventKind::Failed,
        EventKind::Cancelled,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Started => 0,
            Self::Progress => 1,
            Self::Completed => 2,
            Self::Failed => 3,
            Self::Cancelled => 4,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DownloadEvent {
    Started {
        job: JobHandle,
    },
    Progress {
        job: JobHandle,
        progress: f64,
        speed: f64,
    },
    Completed {
        job: JobHandle,
    },
    Failed {
        job: JobHandle,
        error: String,
    },
    Cancelled {
        job: JobHandle,
    },
}

impl DownloadEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Started { .. } => EventKind::Started,
            Self::Progress { .. } => EventKind::Progress,
            Self::Completed { .. } => EventKind::Completed,
            Self::Failed { .. } => EventKind::Failed,
            Self::Cancelled { .. } => EventKind::Cancelled,
        }
    }

    pub fn job(&self) -> &JobHandle {
        match self {
            Self::Started { job }
            | Self::Progress { job, .. }
            | Self::Completed { job }
            | Self::Failed { job, .. }
            | Self::Cancelled { job } => job,
        }
    }
}

// ── 服务类型 ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Youtube,
    Twitter,
    Instagram,
    Pinterest,
    Soundcloud,
    /// Any other http(s) host, fetched as a plain file.
    Direct,
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Youtube => "youtube",
            Self::Twitter => "twitter",
            Self::Instagram => "instagram",
            Self::Pinterest => "pinterest",
            Self::Soundcloud => "soundcloud",
            Self::Direct => "direct",
        };
        f.write_str(s)
    }
}
