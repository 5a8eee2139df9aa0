//! 下载任务处理器。
//!
//! 持有有序任务列表，并在一个专用后台线程中严格按顺序逐个执行任务：
//! 同一时刻最多只有一个任务处于 DOWNLOADING。单个任务的失败（策略返回
//! false、返回错误或 panic）只会把该任务标记为 FAILED，批次继续执行。
//!
//! 取消是协作式的：工作线程只在开始每个任务前检查取消标记，已经进入
//! 下载策略调用的任务不会被强行中断。

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::event_bus::EventBus;
use super::models::{DownloadEvent, DownloadStatus, JobHandle};
use super::paths::prepare_output_path;
use super::strategy::{StrategyResolver, parse_http_url};
use super::throttle::{DEFAULT_THROTTLE_INTERVAL, ProgressThrottle};
use crate::base_system::panic_message;

/// Caller-side progress callback: `(job, percent)`. Runs on the worker thread.
pub type ProgressCallback = Arc<dyn Fn(&JobHandle, f64) + Send + Sync>;
/// Caller-side completion callback: `(success, message)`. Runs on the worker thread.
pub type CompletionCallback = Arc<dyn Fn(bool, &str) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("a download batch is already running")]
    Busy,
    #[error("failed to spawn download worker: {0}")]
    Spawn(#[from] io::Error),
}

pub struct DownloadProcessor {
    jobs: Mutex<Vec<JobHandle>>,
    bus: Arc<EventBus>,
    resolver: Arc<dyn StrategyResolver>,
    throttle_interval: Duration,
    busy: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadProcessor {
    pub fn new(bus: Arc<EventBus>, resolver: Arc<dyn StrategyResolver>) -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            bus,
            resolver,
            throttle_interval: DEFAULT_THROTTLE_INTERVAL,
            busy: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    pub fn with_throttle_interval(mut self, interval: Duration) -> Self {
        self.throttle_interval = interval;
        self
    }

    // ── 任务列表 ──────────────────────────────────────────────────

    pub fn add_job(&self, job: JobHandle) {
        debug!(target: "processor", "queued {} {} ({})", job.id(), job.name(), job.url());
        self.lock_jobs().push(job);
    }

    /// Removes the jobs at `indices`. Out-of-range and repeated indices are ignored.
    pub fn remove_jobs(&self, indices: &[usize]) -> usize {
        let mut sorted = indices.to_vec();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        sorted.dedup();

        let mut jobs = self.lock_jobs();
        let mut removed = 0;
        for idx in sorted {
            if idx < jobs.len() {
                let job = jobs.remove(idx);
                debug!(target: "processor", "removed {} {}", job.id(), job.name());
                removed += 1;
            }
        }
        removed
    }

    pub fn clear_jobs(&self) {
        self.lock_jobs().clear();
    }

    /// Copy of the current list; the handles are shared, the vector is not.
    pub fn get_jobs(&self) -> Vec<JobHandle> {
        self.lock_jobs().clone()
    }

    pub fn has_active_jobs(&self) -> bool {
        self.lock_jobs().iter().any(|j| j.status().is_active())
    }

    pub fn is_processing(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    // ── 执行 ──────────────────────────────────────────────────────

    /// Spawns one worker that runs `jobs` strictly in order.
    pub fn start_processing(
        &self,
        jobs: Vec<JobHandle>,
        destination_dir: impl Into<PathBuf>,
        on_progress: Option<ProgressCallback>,
        on_complete: Option<CompletionCallback>,
    ) -> Result<(), ProcessorError> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(ProcessorError::Busy);
        }
        // The previous worker (if any) has already cleared `busy`.
        self.reap_worker();

        let worker = Worker {
            bus: self.bus.clone(),
            resolver: self.resolver.clone(),
            throttle_interval: self.throttle_interval,
            destination_dir: destination_dir.into(),
            on_progress,
            on_complete,
        };
        let busy = self.busy.clone();

        info!(target: "processor", "starting {} downloads", jobs.len());
        let spawned = thread::Builder::new()
            .name("download-worker".to_string())
            .spawn(move || {
                let _guard = BusyGuard(busy);
                worker.run(&jobs);
            });

        match spawned {
            Ok(handle) => {
                *self.lock_worker() = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.busy.store(false, Ordering::SeqCst);
                error!(target: "processor", "failed to spawn download worker: {err}");
                Err(ProcessorError::Spawn(err))
            }
        }
    }

    /// Starts a batch with every job that is currently PENDING. Returns the batch size.
    pub fn start_pending(
        &self,
        destination_dir: impl Into<PathBuf>,
        on_progress: Option<ProgressCallback>,
        on_complete: Option<CompletionCallback>,
    ) -> Result<usize, ProcessorError> {
        let pending: Vec<JobHandle> = self
            .get_jobs()
            .into_iter()
            .filter(|j| j.status() == DownloadStatus::Pending)
            .collect();
        let n = pending.len();
        if n == 0 {
            return Ok(0);
        }
        self.start_processing(pending, destination_dir, on_progress, on_complete)?;
        Ok(n)
    }

    /// Requests cancellation of `job`. Returns `false` if it was already terminal.
    ///
    /// While a batch runs, only the worker changes status: it cancels the job
    /// when it reaches it. A job already inside its strategy call runs to the end.
    pub fn cancel_job(&self, job: &JobHandle) -> bool {
        if job.status().is_terminal() {
            return false;
        }
        job.request_cancel();
        if !self.is_processing() && job.status() == DownloadStatus::Pending && job.mark_cancelled()
        {
            info!(target: "processor", "cancelled {} {}", job.id(), job.name());
            self.bus.publish(DownloadEvent::Cancelled { job: job.clone() });
        }
        true
    }

    /// Blocks until the current worker (if any) has finished.
    pub fn join(&self) {
        let handle = self.lock_worker().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(target: "processor", "download worker terminated abnormally");
            }
        }
    }

    fn reap_worker(&self) {
        if let Some(handle) = self.lock_worker().take() {
            let _ = handle.join();
        }
    }

    fn lock_jobs(&self) -> MutexGuard<'_, Vec<JobHandle>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ── 工作线程 ──────────────────────────────────────────────────

struct Worker {
    bus: Arc<EventBus>,
    resolver: Arc<dyn StrategyResolver>,
    throttle_interval: Duration,
    destination_dir: PathBuf,
    on_progress: Option<ProgressCallback>,
    on_complete: Option<CompletionCallback>,
}

impl Worker {
    fn run(&self, jobs: &[JobHandle]) {
        for (idx, job) in jobs.iter().enumerate() {
            debug!(target: "processor", "job {}/{}: {}", idx + 1, jobs.len(), job.name());
            self.run_one(job);
        }
        info!(target: "processor", "batch of {} downloads finished", jobs.len());
    }

    fn run_one(&self, job: &JobHandle) {
        if job.cancel_requested() {
            if job.mark_cancelled() {
                info!(target: "processor", "skipping cancelled download: {}", job.name());
                self.bus.publish(DownloadEvent::Cancelled { job: job.clone() });
            }
            return;
        }

        let status = job.status();
        if status.is_terminal() {
            debug!(target: "processor", "{} already {status}, not re-running", job.name());
            return;
        }
        // Invalid URLs never reach a strategy; the job is marked failed instead.
        if parse_http_url(job.url()).is_none() {
            warn!(target: "processor", "skipping {}: empty or invalid url {:?}", job.name(), job.url());
            self.fail(job, format!("Invalid or empty URL, skipped: {:?}", job.url()));
            return;
        }
        if job.mark_downloading() {
            self.bus.publish(DownloadEvent::Started { job: job.clone() });
        }

        let Some(strategy) = self.resolver.resolve(job.url()) else {
            self.fail(job, format!("No downloader available for URL: {}", job.url()));
            return;
        };

        let save_path = match prepare_output_path(&self.destination_dir, job) {
            Ok(p) => p,
            Err(err) => {
                self.fail(
                    job,
                    format!("Cannot prepare {}: {err}", self.destination_dir.display()),
                );
                return;
            }
        };

        info!(
            target: "processor",
            "downloading {} via {} -> {}",
            job.name(),
            strategy.service(),
            save_path.display()
        );
        match self.execute(job, strategy.as_ref(), &save_path) {
            Ok(true) => self.complete(job),
            Ok(false) => self.fail(job, format!("Failed to download: {}", job.name())),
            Err(msg) => self.fail(job, msg),
        }
    }

    /// Runs the strategy with a fresh throttle; panics and errors become `Err(message)`.
    fn execute(
        &self,
        job: &JobHandle,
        strategy: &dyn super::strategy::DownloadStrategy,
        save_path: &Path,
    ) -> Result<bool, String> {
        let mut throttle = ProgressThrottle::new(self.throttle_interval);
        let mut sink = |progress: f64, speed: f64| {
            if !progress.is_finite() {
                return;
            }
            let progress = progress.clamp(0.0, 100.0);
            if !job.update_progress(progress, speed) {
                return;
            }
            if throttle.should_forward(progress) {
                self.forward_progress(job, progress, speed);
            }
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            strategy.download(job.url(), save_path, &mut sink)
        }));
        match outcome {
            Ok(Ok(ok)) => Ok(ok),
            Ok(Err(err)) => Err(format!("Download error: {err:#}")),
            Err(payload) => Err(format!(
                "Download error: strategy panicked: {}",
                panic_message(payload)
            )),
        }
    }

    fn complete(&self, job: &JobHandle) {
        if !job.mark_completed() {
            warn!(target: "processor", "{} reached a terminal state before completion", job.name());
            return;
        }
        job.force_progress(100.0);
        let speed = job.state().speed;
        self.forward_progress(job, 100.0, speed);

        info!(target: "processor", "successfully downloaded: {}", job.name());
        self.notify_complete(true, &format!("Downloaded: {}", job.name()));
        self.bus.publish(DownloadEvent::Completed { job: job.clone() });
    }

    fn fail(&self, job: &JobHandle, msg: String) {
        if !job.mark_failed(msg.clone()) {
            return;
        }
        error!(target: "processor", "{}: {msg}", job.name());
        self.notify_complete(false, &msg);
        self.bus.publish(DownloadEvent::Failed {
            job: job.clone(),
            error: msg,
        });
    }

    fn forward_progress(&self, job: &JobHandle, progress: f64, speed: f64) {
        if let Some(cb) = self.on_progress.as_ref() {
            isolate("progress callback", || cb(job, progress));
        }
        self.bus.publish(DownloadEvent::Progress {
            job: job.clone(),
            progress,
            speed,
        });
    }

    fn notify_complete(&self, success: bool, msg: &str) {
        if let Some(cb) = self.on_complete.as_ref() {
            isolate("completion callback", || cb(success, msg));
        }
    }
}

fn isolate(what: &str, f: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        error!(target: "processor", "{what} panicked: {}", panic_message(payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::models::{DownloadJob, EventKind, ServiceType};
    use crate::download::strategy::{DownloadStrategy, ProgressSink};
    use anyhow::{Result, anyhow};
    use crossbeam_channel as channel;
    use std::sync::atomic::AtomicUsize;

    struct FnStrategy<F>(F);

    impl<F> DownloadStrategy for FnStrategy<F>
    where
        F: Fn(&str, ProgressSink<'_>) -> Result<bool> + Send + Sync,
    {
        fn service(&self) -> ServiceType {
            ServiceType::Direct
        }

        fn download(&self, url: &str, _save_path: &Path, progress: ProgressSink<'_>) -> Result<bool> {
            (self.0)(url, progress)
        }
    }

    fn strategy<F>(f: F) -> Arc<dyn DownloadStrategy>
    where
        F: Fn(&str, ProgressSink<'_>) -> Result<bool> + Send + Sync + 'static,
    {
        Arc::new(FnStrategy(f))
    }

    /// Resolves every URL except those containing "unsupported".
    struct TestResolver(Arc<dyn DownloadStrategy>);

    impl StrategyResolver for TestResolver {
        fn resolve(&self, url: &str) -> Option<Arc<dyn DownloadStrategy>> {
            (!url.contains("unsupported")).then(|| self.0.clone())
        }
    }

    type Completions = Arc<Mutex<Vec<(bool, String)>>>;

    fn completion_recorder() -> (CompletionCallback, Completions) {
        let log: Completions = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let cb: CompletionCallback = Arc::new(move |ok: bool, msg: &str| {
            l.lock().unwrap().push((ok, msg.to_string()));
        });
        (cb, log)
    }

    fn processor(strategy: Arc<dyn DownloadStrategy>) -> (Arc<EventBus>, DownloadProcessor) {
        let bus = Arc::new(EventBus::new());
        let p = DownloadProcessor::new(bus.clone(), Arc::new(TestResolver(strategy)));
        (bus, p)
    }

    fn enqueue(p: &DownloadProcessor, specs: &[(&str, &str)]) -> Vec<JobHandle> {
        specs
            .iter()
            .map(|(name, url)| {
                let job = DownloadJob::new(*name, *url).into_handle();
                p.add_job(job.clone());
                job
            })
            .collect()
    }

    fn run_all(p: &DownloadProcessor, dest: &Path, on_complete: Option<CompletionCallback>) {
        p.start_processing(p.get_jobs(), dest, None, on_complete)
            .unwrap();
        p.join();
    }

    fn assert_timestamp_invariant(jobs: &[JobHandle]) {
        for job in jobs {
            let st = job.state();
            assert_eq!(st.completed_at.is_some(), st.status.is_terminal(), "{}", job.name());
            if st.error_message.is_some() {
                assert_eq!(st.status, DownloadStatus::Failed);
            }
        }
    }

    #[test]
    fn runs_jobs_one_at_a_time_in_order() {
        let watched: Arc<Mutex<Vec<JobHandle>>> = Arc::new(Mutex::new(Vec::new()));
        let max_active = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(Mutex::new(Vec::new()));

        let (w, m, c) = (watched.clone(), max_active.clone(), calls.clone());
        let (_bus, p) = processor(strategy(move |url, progress| {
            c.lock().unwrap().push(url.to_string());
            for step in [0.0, 50.0, 100.0] {
                let active = w
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|j| j.status() == DownloadStatus::Downloading)
                    .count();
                m.fetch_max(active, Ordering::SeqCst);
                progress(step, 1.0);
                thread::sleep(Duration::from_millis(5));
            }
            Ok(true)
        }));

        let jobs = enqueue(
            &p,
            &[
                ("a", "https://example.com/a"),
                ("b", "https://example.com/b"),
                ("c", "https://example.com/c"),
                ("d", "https://example.com/d"),
            ],
        );
        *watched.lock().unwrap() = jobs.clone();

        let tmp = tempfile::tempdir().unwrap();
        let (cb, done) = completion_recorder();
        run_all(&p, tmp.path(), Some(cb));

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "https://example.com/a",
                "https://example.com/b",
                "https://example.com/c",
                "https://example.com/d"
            ]
        );
        let msgs: Vec<String> = done.lock().unwrap().iter().map(|(_, m)| m.clone()).collect();
        assert_eq!(
            msgs,
            vec!["Downloaded: a", "Downloaded: b", "Downloaded: c", "Downloaded: d"]
        );

        let finished: Vec<_> = jobs.iter().map(|j| j.state().completed_at.unwrap()).collect();
        assert!(finished.windows(2).all(|w| w[0] <= w[1]));
        assert!(jobs.iter().all(|j| j.status() == DownloadStatus::Completed));
        assert!(jobs.iter().all(|j| j.progress() == 100.0));
        assert_timestamp_invariant(&jobs);
        assert!(!p.has_active_jobs());
    }

    #[test]
    fn one_failing_job_does_not_stop_the_batch() {
        let (_bus, p) = processor(strategy(|url, _| {
            if url.ends_with("/2") {
                Err(anyhow!("network exploded"))
            } else {
                Ok(true)
            }
        }));
        let jobs = enqueue(
            &p,
            &[
                ("one", "https://example.com/1"),
                ("two", "https://example.com/2"),
                ("three", "https://example.com/3"),
            ],
        );
        let tmp = tempfile::tempdir().unwrap();
        let (cb, done) = completion_recorder();
        run_all(&p, tmp.path(), Some(cb));

        let statuses: Vec<_> = jobs.iter().map(|j| j.status()).collect();
        assert_eq!(
            statuses,
            vec![
                DownloadStatus::Completed,
                DownloadStatus::Failed,
                DownloadStatus::Completed
            ]
        );
        let err = jobs[1].state().error_message.unwrap();
        assert!(err.contains("network exploded"), "{err}");
        assert_eq!(
            done.lock().unwrap().iter().map(|(ok, _)| *ok).collect::<Vec<_>>(),
            vec![true, false, true]
        );
        assert_timestamp_invariant(&jobs);
    }

    #[test]
    fn false_result_and_panics_are_failures() {
        let (_bus, p) = processor(strategy(|url, _| {
            if url.ends_with("/false") {
                return Ok(false);
            }
            if url.ends_with("/panic") {
                panic!("strategy bug");
            }
            Ok(true)
        }));
        let jobs = enqueue(
            &p,
            &[
                ("f", "https://example.com/false"),
                ("p", "https://example.com/panic"),
                ("ok", "https://example.com/ok"),
            ],
        );
        let tmp = tempfile::tempdir().unwrap();
        run_all(&p, tmp.path(), None);

        assert_eq!(jobs[0].status(), DownloadStatus::Failed);
        assert_eq!(
            jobs[0].state().error_message.as_deref(),
            Some("Failed to download: f")
        );
        assert_eq!(jobs[1].status(), DownloadStatus::Failed);
        assert!(jobs[1].state().error_message.unwrap().contains("strategy bug"));
        assert_eq!(jobs[2].status(), DownloadStatus::Completed);
        assert!(!p.is_processing());
    }

    #[test]
    fn missing_strategy_fails_only_that_job() {
        let (_bus, p) = processor(strategy(|_, _| Ok(true)));
        let jobs = enqueue(
            &p,
            &[
                ("x", "https://unsupported.example/x"),
                ("y", "https://example.com/y"),
            ],
        );
        let tmp = tempfile::tempdir().unwrap();
        run_all(&p, tmp.path(), None);

        assert_eq!(jobs[0].status(), DownloadStatus::Failed);
        assert!(
            jobs[0]
                .state()
                .error_message
                .unwrap()
                .starts_with("No downloader available")
        );
        assert_eq!(jobs[1].status(), DownloadStatus::Completed);
    }

    #[test]
    fn empty_url_is_skipped_and_marked_failed() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let c = calls.clone();
        let (_bus, p) = processor(strategy(move |url, _| {
            c.lock().unwrap().push(url.to_string());
            Ok(true)
        }));
        let jobs = enqueue(
            &p,
            &[
                ("A", "https://example.com/a"),
                ("B", ""),
                ("C", "https://example.com/c"),
            ],
        );
        let tmp = tempfile::tempdir().unwrap();
        run_all(&p, tmp.path(), None);

        assert_eq!(
            *calls.lock().unwrap(),
            vec!["https://example.com/a", "https://example.com/c"]
        );
        let snapshot = p.get_jobs();
        assert_eq!(snapshot[0].status(), DownloadStatus::Completed);
        assert_eq!(snapshot[1].status(), DownloadStatus::Failed);
        assert_eq!(snapshot[2].status(), DownloadStatus::Completed);
        assert_timestamp_invariant(&jobs);
    }

    #[test]
    fn progress_wrapper_throttles_but_passes_boundaries() {
        let (_bus, p) = processor(strategy(|_, progress| {
            for step in [0.0, 10.0, 20.0, 30.0, 100.0] {
                progress(step, 2.0);
            }
            Ok(true)
        }));
        enqueue(&p, &[("a", "https://example.com/a")]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let on_progress: ProgressCallback =
            Arc::new(move |_: &JobHandle, v: f64| s.lock().unwrap().push(v));

        let tmp = tempfile::tempdir().unwrap();
        p.start_processing(p.get_jobs(), tmp.path(), Some(on_progress), None)
            .unwrap();
        p.join();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.first(), Some(&0.0));
        assert_eq!(seen.last(), Some(&100.0));
        assert!(seen.iter().all(|v| *v == 0.0 || *v == 100.0), "{seen:?}");
    }

    #[test]
    fn throttle_state_does_not_leak_between_jobs() {
        let (_bus, p) = processor(strategy(|url, progress| {
            let step = if url.ends_with("/a") { 0.0 } else { 50.0 };
            progress(step, 0.0);
            Ok(true)
        }));
        let jobs = enqueue(
            &p,
            &[("a", "https://example.com/a"), ("b", "https://example.com/b")],
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let on_progress: ProgressCallback =
            Arc::new(move |job: &JobHandle, v: f64| s.lock().unwrap().push((job.id(), v)));

        let tmp = tempfile::tempdir().unwrap();
        p.start_processing(p.get_jobs(), tmp.path(), Some(on_progress), None)
            .unwrap();
        p.join();

        assert!(seen.lock().unwrap().contains(&(jobs[1].id(), 50.0)));
    }

    #[test]
    fn publishes_lifecycle_events_in_order() {
        let (bus, p) = processor(strategy(|_, progress| {
            progress(0.0, 0.0);
            Ok(true)
        }));
        enqueue(&p, &[("a", "https://example.com/a")]);

        let kinds = Arc::new(Mutex::new(Vec::new()));
        for kind in EventKind::ALL {
            let k = kinds.clone();
            bus.subscribe(kind, move |ev| {
                let tag = match ev {
                    DownloadEvent::Progress { progress, .. } => format!("progress:{progress}"),
                    other => format!("{:?}", other.kind()),
                };
                k.lock().unwrap().push(tag);
                Ok(())
            });
        }

        let tmp = tempfile::tempdir().unwrap();
        run_all(&p, tmp.path(), None);
        bus.dispatch_pending();

        assert_eq!(
            *kinds.lock().unwrap(),
            vec!["Started", "progress:0", "progress:100", "Completed"]
        );
    }

    #[test]
    fn remove_jobs_handles_order_duplicates_and_out_of_range() {
        let (_bus, p) = processor(strategy(|_, _| Ok(true)));
        enqueue(
            &p,
            &[
                ("a", "https://example.com/a"),
                ("b", "https://example.com/b"),
                ("c", "https://example.com/c"),
                ("d", "https://example.com/d"),
            ],
        );
        assert_eq!(p.remove_jobs(&[0, 2, 9, 2]), 2);
        let names: Vec<String> = p.get_jobs().iter().map(|j| j.name().to_string()).collect();
        assert_eq!(names, vec!["b", "d"]);

        p.clear_jobs();
        assert!(p.get_jobs().is_empty());
        assert_eq!(p.remove_jobs(&[0]), 0);
    }

    #[test]
    fn get_jobs_returns_an_independent_copy() {
        let (_bus, p) = processor(strategy(|_, _| Ok(true)));
        enqueue(&p, &[("a", "https://example.com/a")]);
        let mut copy = p.get_jobs();
        copy.clear();
        assert_eq!(p.get_jobs().len(), 1);
        assert!(p.has_active_jobs());
    }

    #[test]
    fn second_start_while_running_is_rejected() {
        let (gate_tx, gate_rx) = channel::bounded::<()>(0);
        let (_bus, p) = processor(strategy(move |_, _| {
            let _ = gate_rx.recv_timeout(Duration::from_secs(5));
            Ok(true)
        }));
        enqueue(&p, &[("a", "https://example.com/a")]);
        let tmp = tempfile::tempdir().unwrap();

        p.start_processing(p.get_jobs(), tmp.path(), None, None)
            .unwrap();
        let again = p.start_processing(p.get_jobs(), tmp.path(), None, None);
        assert!(matches!(again, Err(ProcessorError::Busy)));

        gate_tx.send(()).unwrap();
        p.join();
        assert!(!p.is_processing());
        assert_eq!(p.get_jobs()[0].status(), DownloadStatus::Completed);
    }

    #[test]
    fn cancellation_is_checked_between_jobs() {
        let (gate_tx, gate_rx) = channel::bounded::<()>(0);
        let (entered_tx, entered_rx) = channel::bounded::<()>(1);
        let (bus, p) = processor(strategy(move |_, _| {
            let _ = entered_tx.try_send(());
            let _ = gate_rx.recv_timeout(Duration::from_secs(5));
            Ok(true)
        }));
        let jobs = enqueue(
            &p,
            &[("a", "https://example.com/a"), ("b", "https://example.com/b")],
        );
        let tmp = tempfile::tempdir().unwrap();
        p.start_processing(p.get_jobs(), tmp.path(), None, None)
            .unwrap();

        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(p.cancel_job(&jobs[0]));
        assert!(p.cancel_job(&jobs[1]));
        // b is still pending: only the worker may move it while the batch runs
        assert_eq!(jobs[1].status(), DownloadStatus::Pending);

        gate_tx.send(()).unwrap();
        p.join();

        // a was already inside its strategy call and runs to the end
        assert_eq!(jobs[0].status(), DownloadStatus::Completed);
        assert_eq!(jobs[1].status(), DownloadStatus::Cancelled);
        assert_timestamp_invariant(&jobs);

        let cancelled = Arc::new(AtomicUsize::new(0));
        let c = cancelled.clone();
        bus.subscribe(EventKind::Cancelled, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.dispatch_pending();
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_while_idle_applies_immediately() {
        let (_bus, p) = processor(strategy(|_, _| Ok(true)));
        let jobs = enqueue(&p, &[("a", "https://example.com/a")]);
        assert!(p.cancel_job(&jobs[0]));
        assert_eq!(jobs[0].status(), DownloadStatus::Cancelled);
        assert!(!p.cancel_job(&jobs[0]));
        assert!(!p.has_active_jobs());
    }

    #[test]
    fn start_pending_only_takes_pending_jobs() {
        let (_bus, p) = processor(strategy(|_, _| Ok(true)));
        let jobs = enqueue(
            &p,
            &[("a", "https://example.com/a"), ("b", "https://example.com/b")],
        );
        p.cancel_job(&jobs[0]);

        let tmp = tempfile::tempdir().unwrap();
        let n = p.start_pending(tmp.path(), None, None).unwrap();
        p.join();

        assert_eq!(n, 1);
        assert_eq!(jobs[0].status(), DownloadStatus::Cancelled);
        assert_eq!(jobs[1].status(), DownloadStatus::Completed);
    }

    #[test]
    fn panicking_callbacks_stay_inside_the_worker() {
        let (_bus, p) = processor(strategy(|_, progress| {
            progress(0.0, 0.0);
            Ok(true)
        }));
        let jobs = enqueue(
            &p,
            &[("a", "https://example.com/a"), ("b", "https://example.com/b")],
        );
        let on_progress: ProgressCallback = Arc::new(|_: &JobHandle, _: f64| panic!("ui bug"));
        let on_complete: CompletionCallback = Arc::new(|_: bool, _: &str| panic!("ui bug"));

        let tmp = tempfile::tempdir().unwrap();
        p.start_processing(p.get_jobs(), tmp.path(), Some(on_progress), Some(on_complete))
            .unwrap();
        p.join();

        assert!(jobs.iter().all(|j| j.status() == DownloadStatus::Completed));
    }
}
