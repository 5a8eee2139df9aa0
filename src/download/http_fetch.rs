//! 直链 HTTP 下载策略。
//!
//! 以流式读取写入目标目录下的临时文件，成功后再原子替换为最终文件名。

use std::io::{Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use reqwest::blocking::{Client, ClientBuilder};
use reqwest::header::{ACCEPT, ACCEPT_ENCODING, CONTENT_LENGTH, HeaderMap, HeaderValue};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::models::ServiceType;
use super::strategy::{DownloadStrategy, ProgressSink};

const CHUNK_SIZE: usize = 8192;
const SPEED_WINDOW: Duration = Duration::from_millis(250);

pub struct HttpFileStrategy {
    client: Client,
}

impl HttpFileStrategy {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = client_builder(timeout, user_agent)
            .build()
            .context("build http client")?;
        Ok(Self { client })
    }
}

fn client_builder(timeout: Duration, user_agent: &str) -> ClientBuilder {
    // reqwest is built without a gzip decoder; ask for identity bodies.
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));

    Client::builder()
        .default_headers(headers)
        .user_agent(user_agent)
        .connect_timeout(timeout)
        .timeout(None)
}

impl DownloadStrategy for HttpFileStrategy {
    fn service(&self) -> ServiceType {
        ServiceType::Direct
    }

    fn download(&self, url: &str, save_path: &Path, progress: ProgressSink<'_>) -> Result<bool> {
        let resp = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("request {url}"))?
            .error_for_status()
            .context("download status")?;

        let total = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);

        let dir = save_path
            .parent()
            .ok_or_else(|| anyhow!("save path has no parent: {}", save_path.display()))?;
        let mut tmp = NamedTempFile::new_in(dir).context("create temp file")?;

        progress(0.0, 0.0);
        let mut meter = SpeedMeter::new(Instant::now());
        let mut reader = resp;
        let mut buf = [0u8; CHUNK_SIZE];
        let mut done: u64 = 0;
        loop {
            let n = reader.read(&mut buf).context("read download stream")?;
            if n == 0 {
                break;
            }
            tmp.write_all(&buf[..n]).context("write temp file")?;
            done += n as u64;
            let speed = meter.record(n as u64, Instant::now());
            if total > 0 {
                // keep 100 for after the file is in place
                progress(percent(done, total).min(99.9), speed);
            }
        }
        tmp.flush().context("flush temp file")?;

        if total > 0 && done < total {
            debug!(target: "http", "short body for {url}: {done}/{total} bytes");
            return Ok(false);
        }

        tmp.persist(save_path)
            .with_context(|| format!("persist {}", save_path.display()))?;
        info!(target: "http", "saved {} ({done} bytes)", save_path.display());
        progress(100.0, meter.current());
        Ok(true)
    }
}

fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (done as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

/// Bytes-per-second over a short sliding window.
struct SpeedMeter {
    window_start: Instant,
    window_bytes: u64,
    current: f64,
}

impl SpeedMeter {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            window_bytes: 0,
            current: 0.0,
        }
    }

    fn record(&mut self, bytes: u64, now: Instant) -> f64 {
        self.window_bytes += bytes;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= SPEED_WINDOW {
            self.current = self.window_bytes as f64 / elapsed.as_secs_f64();
            self.window_start = now;
            self.window_bytes = 0;
        }
        self.current
    }

    fn current(&self) -> f64 {
        self.current
    }
}
