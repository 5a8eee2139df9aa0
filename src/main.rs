//! Media Queue Downloader：顺序执行的媒体下载队列。
//!
//! 代码结构（读代码入口）：
//! - `base_system`：配置/日志等基础设施
//! - `download`：任务模型、事件总线、顺序处理器与协调器、下载策略
//! - `ui`：命令行前端（进度条 + 汇总）

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::{info, warn};

mod base_system;
mod download;
mod ui;

use base_system::config::load_or_create;
use base_system::context::Config;
use base_system::logging::{LogOptions, LogSystem};
use download::coordinator::DownloadCoordinator;
use download::event_bus::EventBus;
use download::http_fetch::HttpFileStrategy;
use download::processor::DownloadProcessor;
use download::strategy::{ServiceDetector, StrategyRegistry};
use ui::cli::{CliRequest, parse_entry};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "media-queue-downloader")]
#[command(about = "Download a queue of media URLs one at a time")]
struct Cli {
    /// 下载地址：`名称=URL` 或直接给出 URL
    urls: Vec<String>,

    /// 保存目录（默认取配置中的 save_path）
    #[arg(long)]
    dest: Option<String>,

    /// 仅保存音频（输出 .mp3）
    #[arg(long, default_value_t = false)]
    audio_only: bool,

    /// 以 JSON 输出最终任务列表
    #[arg(long, default_value_t = false)]
    json: bool,

    /// 启用调试日志输出
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// 显示版本信息后退出
    #[arg(long, default_value_t = false)]
    version: bool,

    /// 数据目录路径（用于存放 config.yml 和 logs 等文件）
    #[arg(long)]
    data_dir: Option<String>,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    if cli.version {
        println!("Media Queue Downloader v{VERSION}");
        return Ok(ExitCode::SUCCESS);
    }

    let data_dir = cli.data_dir.as_deref().map(Path::new);
    let log = init_logging(cli.debug, data_dir)?;

    let config: Config = load_or_create(data_dir).context("load config")?;
    info!(target: "startup", "v{VERSION}, logs in {}", log.logs_dir().display());

    if cli.urls.is_empty() {
        eprintln!("nothing to download: pass one or more URLs (`name=url` or a bare url)");
        return Ok(ExitCode::from(2));
    }

    let destination = cli
        .dest
        .as_deref()
        .map(|d| download::paths::expand_home(Path::new(d)))
        .unwrap_or_else(|| config.default_save_dir());

    let bus = Arc::new(EventBus::new());
    let registry = build_registry(&config)?;
    let processor = Arc::new(
        DownloadProcessor::new(bus.clone(), Arc::new(registry))
            .with_throttle_interval(config.progress_throttle()),
    );
    let coordinator = Arc::new(DownloadCoordinator::with_throttle_interval(
        processor,
        config.coordinator_throttle(),
    ));

    {
        let coordinator = coordinator.clone();
        log.add_exit_hook(move || {
            coordinator.cancel_all();
        });
    }

    let request = CliRequest {
        entries: cli
            .urls
            .iter()
            .enumerate()
            .map(|(i, raw)| parse_entry(raw, i + 1))
            .collect(),
        destination,
        audio_only: cli.audio_only,
        json: cli.json,
    };
    let summary = ui::cli::run(&coordinator, &bus, &request, config.drain_interval())?;

    Ok(if summary.all_succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn build_registry(config: &Config) -> Result<StrategyRegistry> {
    let detector = ServiceDetector::new(&config.service_domains, config.allow_direct_http);
    let mut registry = StrategyRegistry::new(detector);
    if config.allow_direct_http {
        let http = HttpFileStrategy::new(config.connect_timeout(), &config.user_agent)?;
        registry.register(Arc::new(http));
    }

    let services = registry.supported_services();
    if services.is_empty() {
        warn!(target: "startup", "no download strategies enabled; every job will fail");
    } else {
        info!(target: "startup", "download strategies: {services:?}");
    }
    Ok(registry)
}

fn init_logging(debug: bool, base_dir: Option<&Path>) -> Result<LogSystem> {
    let opts = LogOptions {
        debug,
        use_color: true,
        archive_on_exit: true,
        console: debug,
    };
    LogSystem::init_with_base(opts, base_dir).map_err(|e| anyhow!(e))
}
