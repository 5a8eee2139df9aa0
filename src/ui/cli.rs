//! 命令行前端。
//!
//! 主线程运行事件分发循环，协调器的回调驱动一条总进度条；当按钮重新
//! “可用”（没有进行中的任务）时停止分发，等待工作线程结束并汇总结果。

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde::Serialize;
use tracing::info;

use crate::download::coordinator::{DownloadCoordinator, UiCallback};
use crate::download::event_bus::EventBus;
use crate::download::models::{DownloadOptions, DownloadStatus, JobId, JobSnapshot};
use crate::download::strategy::parse_http_url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub name: String,
    pub url: String,
}

/// Parses `name=url` or a bare URL. `position` numbers unnamed fallbacks.
pub fn parse_entry(raw: &str, position: usize) -> QueueEntry {
    let raw = raw.trim();
    if let Some((name, url)) = raw.split_once('=') {
        // `https://host/watch?v=1` also contains '='; only split before a scheme
        if !name.contains("://") && !name.trim().is_empty() {
            return QueueEntry {
                name: name.trim().to_string(),
                url: url.trim().to_string(),
            };
        }
    }
    QueueEntry {
        name: name_from_url(raw).unwrap_or_else(|| format!("download-{position}")),
        url: raw.to_string(),
    }
}

fn name_from_url(url: &str) -> Option<String> {
    let parsed = parse_http_url(url)?;
    let last = parsed
        .path_segments()
        .and_then(|mut segs| segs.rfind(|s| !s.is_empty()))
        .map(|s| match s.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem.to_string(),
            _ => s.to_string(),
        });
    last.or_else(|| parsed.host_str().map(str::to_string))
}

#[derive(Debug, Clone)]
pub struct CliRequest {
    pub entries: Vec<QueueEntry>,
    pub destination: PathBuf,
    pub audio_only: bool,
    pub json: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub jobs: Vec<JobSnapshot>,
}

impl RunSummary {
    fn from_jobs(jobs: Vec<JobSnapshot>) -> Self {
        let count = |s: DownloadStatus| jobs.iter().filter(|j| j.status == s).count();
        Self {
            completed: count(DownloadStatus::Completed),
            failed: count(DownloadStatus::Failed),
            cancelled: count(DownloadStatus::Cancelled),
            jobs,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }
}

fn make_bar(hidden: bool) -> ProgressBar {
    let target = if hidden {
        ProgressDrawTarget::hidden()
    } else {
        ProgressDrawTarget::stderr()
    };
    let bar = ProgressBar::with_draw_target(Some(100), target);
    let style = ProgressStyle::with_template("{prefix} [{elapsed_precise}] {wide_bar} {pos:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");
    bar.set_style(style);
    bar.set_prefix("总进度");
    bar
}

fn register_callbacks(coordinator: &DownloadCoordinator, bus: &Arc<EventBus>, bar: &ProgressBar) {
    let b = bar.clone();
    coordinator.register_callback(UiCallback::overall_progress(move |v| {
        b.set_position(v.round().clamp(0.0, 100.0) as u64);
    }));

    let b = bar.clone();
    coordinator.register_callback(UiCallback::status(move |msg, is_error| {
        if is_error {
            b.println(format!("error: {msg}"));
        }
        b.set_message(msg.to_string());
    }));

    let b = bar.clone();
    coordinator.register_callback(UiCallback::report_error(move |report| {
        b.println(format!("✗ {}: {}", report.job_name, report.error));
    }));

    // Print each finished job once; failures come through report_error.
    let b = bar.clone();
    let reported: Mutex<HashSet<JobId>> = Mutex::new(HashSet::new());
    coordinator.register_callback(UiCallback::refresh_list(move |jobs| {
        let mut reported = reported.lock().unwrap_or_else(|e| e.into_inner());
        for job in jobs.iter().filter(|j| j.status.is_terminal()) {
            if !reported.insert(job.id) {
                continue;
            }
            match job.status {
                DownloadStatus::Completed => b.println(format!("✓ {}", job.name)),
                DownloadStatus::Cancelled => b.println(format!("- {} (cancelled)", job.name)),
                _ => {}
            }
        }
    }));

    let bus = bus.clone();
    coordinator.register_callback(UiCallback::buttons_enabled(move |enabled| {
        if enabled {
            bus.stop_dispatch();
        }
    }));
}

/// Queues the request, runs the batch to the end and returns the final job list.
pub fn run(
    coordinator: &Arc<DownloadCoordinator>,
    bus: &Arc<EventBus>,
    request: &CliRequest,
    drain_interval: Duration,
) -> Result<RunSummary> {
    let bar = make_bar(request.json);
    register_callbacks(coordinator, bus, &bar);
    coordinator.attach(bus);

    let options = DownloadOptions {
        audio_only: request.audio_only,
    };
    for entry in &request.entries {
        coordinator.add_download(entry.name.as_str(), entry.url.as_str(), options);
    }

    info!(
        target: "startup",
        "queued {} downloads into {}",
        request.entries.len(),
        request.destination.display()
    );
    let started = coordinator.start_downloads(request.destination.clone());
    if started > 0 {
        bus.run_dispatch(drain_interval);
    }

    // Events published after the loop stopped still update the bar and list.
    coordinator.processor().join();
    bus.dispatch_pending();
    coordinator.detach(bus);
    bar.finish_and_clear();

    let jobs = coordinator
        .processor()
        .get_jobs()
        .iter()
        .map(|j| j.snapshot())
        .collect();
    let summary = RunSummary::from_jobs(jobs);

    if request.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "{} completed, {} failed, {} cancelled",
            summary.completed, summary.failed, summary.cancelled
        );
    }
    Ok(summary)
}
