//! 下载协调器：把总线事件翻译成 UI 回调。
//!
//! 所有回调都在总线的分发线程上执行（CLI 下即主线程）。协调器只读取
//! 处理器的任务列表，从不直接修改任务状态；取消请求也交给处理器完成。

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::event_bus::{EventBus, Listener};
use super::models::{
    DownloadEvent, DownloadJob, DownloadOptions, DownloadStatus, EventKind, JobHandle, JobId,
    JobSnapshot,
};
use super::processor::DownloadProcessor;
use super::throttle::{DEFAULT_THROTTLE_INTERVAL, KeyedThrottle};
use crate::base_system::panic_message;

type OverallProgressFn = Arc<dyn Fn(f64) + Send + Sync>;
type RefreshListFn = Arc<dyn Fn(&[JobSnapshot]) + Send + Sync>;
type ButtonsFn = Arc<dyn Fn(bool) + Send + Sync>;
type ReportErrorFn = Arc<dyn Fn(&FailureReport) + Send + Sync>;
type StatusFn = Arc<dyn Fn(&str, bool) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureReport {
    pub job_name: String,
    pub error: String,
}

/// One UI hook. Registering a kind again replaces the previous closure.
#[derive(Clone)]
pub enum UiCallback {
    UpdateOverallProgress(OverallProgressFn),
    RefreshList(RefreshListFn),
    SetButtonsEnabled(ButtonsFn),
    ReportError(ReportErrorFn),
    /// `(message, is_error)`
    UpdateStatus(StatusFn),
}

impl UiCallback {
    pub fn overall_progress(f: impl Fn(f64) + Send + Sync + 'static) -> Self {
        Self::UpdateOverallProgress(Arc::new(f))
    }

    pub fn refresh_list(f: impl Fn(&[JobSnapshot]) + Send + Sync + 'static) -> Self {
        Self::RefreshList(Arc::new(f))
    }

    pub fn buttons_enabled(f: impl Fn(bool) + Send + Sync + 'static) -> Self {
        Self::SetButtonsEnabled(Arc::new(f))
    }

    pub fn report_error(f: impl Fn(&FailureReport) + Send + Sync + 'static) -> Self {
        Self::ReportError(Arc::new(f))
    }

    pub fn status(f: impl Fn(&str, bool) + Send + Sync + 'static) -> Self {
        Self::UpdateStatus(Arc::new(f))
    }

    fn name(&self) -> &'static str {
        match self {
            Self::UpdateOverallProgress(_) => "update_overall_progress",
            Self::RefreshList(_) => "refresh_list",
            Self::SetButtonsEnabled(_) => "set_buttons_enabled",
            Self::ReportError(_) => "report_error",
            Self::UpdateStatus(_) => "update_status",
        }
    }
}

#[derive(Default)]
struct CallbackSlots {
    overall: Option<OverallProgressFn>,
    refresh: Option<RefreshListFn>,
    buttons: Option<ButtonsFn>,
    report: Option<ReportErrorFn>,
    status: Option<StatusFn>,
}

pub struct DownloadCoordinator {
    processor: Arc<DownloadProcessor>,
    callbacks: Mutex<CallbackSlots>,
    throttle: Mutex<KeyedThrottle<JobId>>,
    subscriptions: Mutex<Vec<(EventKind, Listener)>>,
}

impl DownloadCoordinator {
    pub fn new(processor: Arc<DownloadProcessor>) -> Self {
        Self::with_throttle_interval(processor, DEFAULT_THROTTLE_INTERVAL)
    }

    pub fn with_throttle_interval(processor: Arc<DownloadProcessor>, interval: Duration) -> Self {
        Self {
            processor,
            callbacks: Mutex::new(CallbackSlots::default()),
            throttle: Mutex::new(KeyedThrottle::new(interval)),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn processor(&self) -> &Arc<DownloadProcessor> {
        &self.processor
    }

    pub fn register_callback(&self, callback: UiCallback) {
        debug!(target: "coordinator", "registered ui callback: {}", callback.name());
        let mut slots = self.lock_callbacks();
        match callback {
            UiCallback::UpdateOverallProgress(f) => slots.overall = Some(f),
            UiCallback::RefreshList(f) => slots.refresh = Some(f),
            UiCallback::SetButtonsEnabled(f) => slots.buttons = Some(f),
            UiCallback::ReportError(f) => slots.report = Some(f),
            UiCallback::UpdateStatus(f) => slots.status = Some(f),
        }
    }

    // ── 总线订阅 ──────────────────────────────────────────────────

    /// Subscribes to every event kind. The listeners only hold a weak reference.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) {
        let mut subs = self.lock_subscriptions();
        for kind in EventKind::ALL {
            let weak = Arc::downgrade(self);
            let listener = bus.subscribe(kind, move |event| {
                if let Some(coordinator) = weak.upgrade() {
                    coordinator.handle_event(event);
                }
                Ok(())
            });
            subs.push((kind, listener));
        }
        info!(target: "coordinator", "attached to event bus");
    }

    pub fn detach(&self, bus: &EventBus) {
        let subs: Vec<_> = self.lock_subscriptions().drain(..).collect();
        for (kind, listener) in &subs {
            bus.unsubscribe(*kind, listener);
        }
        if !subs.is_empty() {
            info!(target: "coordinator", "detached from event bus");
        }
    }

    pub fn handle_event(&self, event: &DownloadEvent) {
        self.handle_event_at(event, Instant::now());
    }

    fn handle_event_at(&self, event: &DownloadEvent, now: Instant) {
        match event {
            DownloadEvent::Started { job } => {
                debug!(target: "coordinator", "started: {}", job.name());
                self.refresh_list();
            }
            DownloadEvent::Progress { job, progress, .. } => {
                let emit = self.lock_throttle().should_emit_at(job.id(), now);
                if emit {
                    self.update_overall(self.overall_progress());
                    if *progress < 100.0 {
                        self.update_status(&format!("Downloading {}", job.name()), false);
                    }
                }
            }
            DownloadEvent::Completed { job } => {
                self.lock_throttle().forget(&job.id());
                self.update_overall(self.overall_progress());
                self.refresh_list();
                self.set_buttons_enabled(!self.processor.has_active_jobs());
                self.update_status(&format!("Download completed: {}", job.name()), false);
            }
            DownloadEvent::Failed { job, error } => {
                self.lock_throttle().forget(&job.id());
                self.refresh_list();
                self.set_buttons_enabled(!self.processor.has_active_jobs());
                self.report_error(&FailureReport {
                    job_name: job.name().to_string(),
                    error: error.clone(),
                });
            }
            DownloadEvent::Cancelled { job } => {
                self.lock_throttle().forget(&job.id());
                debug!(target: "coordinator", "cancelled: {}", job.name());
                self.refresh_list();
                self.set_buttons_enabled(!self.processor.has_active_jobs());
            }
        }
        self.prune_throttle();
    }

    /// Mean progress of pending/downloading jobs; 100 when only finished work
    /// remains and at least one job completed, else 0.
    pub fn overall_progress(&self) -> f64 {
        let jobs = self.processor.get_jobs();
        let active: Vec<f64> = jobs
            .iter()
            .filter(|j| j.status().is_active())
            .map(|j| j.progress())
            .collect();
        if active.is_empty() {
            let any_completed = jobs
                .iter()
                .any(|j| j.status() == DownloadStatus::Completed);
            return if any_completed { 100.0 } else { 0.0 };
        }
        active.iter().sum::<f64>() / active.len() as f64
    }

    // ── 列表操作 ──────────────────────────────────────────────────

    pub fn add_download(
        &self,
        name: impl Into<String>,
        url: impl Into<String>,
        options: DownloadOptions,
    ) -> JobHandle {
        let job = DownloadJob::with_options(name, url, options).into_handle();
        self.processor.add_job(job.clone());
        self.refresh_list();
        job
    }

    pub fn remove_downloads(&self, indices: &[usize]) -> usize {
        let removed = self.processor.remove_jobs(indices);
        self.refresh_list();
        self.prune_throttle();
        removed
    }

    pub fn clear_downloads(&self) {
        self.processor.clear_jobs();
        self.refresh_list();
        self.prune_throttle();
    }

    /// Starts every pending job. Returns how many were handed to the worker.
    pub fn start_downloads(&self, destination_dir: impl Into<PathBuf>) -> usize {
        self.set_buttons_enabled(false);
        self.refresh_list();

        match self.processor.start_pending(destination_dir, None, None) {
            Ok(0) => {
                self.update_status("No pending downloads", false);
                self.set_buttons_enabled(true);
                0
            }
            Ok(n) => {
                info!(target: "coordinator", "started {n} downloads");
                self.update_status(&format!("Starting {n} downloads"), false);
                n
            }
            Err(err) => {
                warn!(target: "coordinator", "cannot start downloads: {err}");
                self.update_status(&format!("Cannot start downloads: {err}"), true);
                self.set_buttons_enabled(!self.processor.is_processing());
                0
            }
        }
    }

    /// Requests cancellation of every pending or downloading job.
    pub fn cancel_all(&self) -> usize {
        let mut n = 0;
        for job in self.processor.get_jobs() {
            if job.status().is_active() && self.processor.cancel_job(&job) {
                n += 1;
            }
        }
        if n > 0 {
            info!(target: "coordinator", "cancellation requested for {n} jobs");
        }
        n
    }

    // ── UI 回调 ──────────────────────────────────────────────────

    fn update_overall(&self, value: f64) {
        let cb = self.lock_callbacks().overall.clone();
        if let Some(cb) = cb {
            isolate("update_overall_progress", || cb(value));
        }
    }

    fn refresh_list(&self) {
        let cb = self.lock_callbacks().refresh.clone();
        if let Some(cb) = cb {
            let snapshot: Vec<JobSnapshot> =
                self.processor.get_jobs().iter().map(|j| j.snapshot()).collect();
            isolate("refresh_list", || cb(&snapshot));
        }
    }

    fn set_buttons_enabled(&self, enabled: bool) {
        let cb = self.lock_callbacks().buttons.clone();
        if let Some(cb) = cb {
            isolate("set_buttons_enabled", || cb(enabled));
        }
    }

    fn report_error(&self, report: &FailureReport) {
        let cb = self.lock_callbacks().report.clone();
        if let Some(cb) = cb {
            isolate("report_error", || cb(report));
        }
    }

    fn update_status(&self, msg: &str, is_error: bool) {
        let cb = self.lock_callbacks().status.clone();
        if let Some(cb) = cb {
            isolate("update_status", || cb(msg, is_error));
        }
    }

    fn prune_throttle(&self) {
        let live: HashSet<JobId> = self
            .processor
            .get_jobs()
            .iter()
            .filter(|j| j.status().is_active())
            .map(|j| j.id())
            .collect();
        self.lock_throttle().retain(|id| live.contains(id));
    }

    fn lock_callbacks(&self) -> MutexGuard<'_, CallbackSlots> {
        self.callbacks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_throttle(&self) -> MutexGuard<'_, KeyedThrottle<JobId>> {
        self.throttle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_subscriptions(&self) -> MutexGuard<'_, Vec<(EventKind, Listener)>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn isolate(what: &str, f: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        error!(target: "coordinator", "ui callback {what} panicked: {}", panic_message(payload));
    }
}
