//! 全局配置结构（Config）与默认值。
//!
//! 该模块同时提供生成 `config.yml` 的字段元信息。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::{ConfigError, ConfigSpec, FieldMeta};
use crate::download::models::ServiceType;
use crate::download::paths::expand_home;
use crate::download::strategy::default_service_domains;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // 路径配置
    #[serde(default)]
    pub save_path: String,

    // 调度配置
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,
    #[serde(default = "default_throttle_ms")]
    pub progress_throttle_ms: u64,
    #[serde(default = "default_throttle_ms")]
    pub coordinator_throttle_ms: u64,

    // 网络配置
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_true")]
    pub allow_direct_http: bool,
    #[serde(default = "default_service_domains")]
    pub service_domains: BTreeMap<ServiceType, Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            save_path: String::new(),
            drain_interval_ms: default_drain_interval_ms(),
            progress_throttle_ms: default_throttle_ms(),
            coordinator_throttle_ms: default_throttle_ms(),
            request_timeout: default_request_timeout(),
            user_agent: default_user_agent(),
            allow_direct_http: default_true(),
            service_domains: default_service_domains(),
        }
    }
}

impl ConfigSpec for Config {
    const FILE_NAME: &'static str = "config.yml";

    fn fields() -> &'static [FieldMeta] {
        static FIELDS: [FieldMeta; 8] = [
            FieldMeta {
                name: "save_path",
                description: "保存路径（留空使用系统下载目录，支持 ~ 开头）",
            },
            FieldMeta {
                name: "drain_interval_ms",
                description: "事件分发间隔, 单位ms",
            },
            FieldMeta {
                name: "progress_throttle_ms",
                description: "单个任务进度上报的最小间隔, 单位ms",
            },
            FieldMeta {
                name: "coordinator_throttle_ms",
                description: "界面总进度刷新的最小间隔（按任务计）, 单位ms",
            },
            FieldMeta {
                name: "request_timeout",
                description: "连接超时时间（秒）",
            },
            FieldMeta {
                name: "user_agent",
                description: "HTTP 请求使用的 User-Agent",
            },
            FieldMeta {
                name: "allow_direct_http",
                description: "未识别的 http(s) 地址是否按直链文件下载",
            },
            FieldMeta {
                name: "service_domains",
                description: "各服务对应的域名（先精确匹配，再包含匹配）",
            },
        ];
        &FIELDS
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.drain_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "drain_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.request_timeout == 0 {
            return Err(ConfigError::Validation(
                "request_timeout must be greater than 0".to_string(),
            ));
        }
        if self.user_agent.trim().is_empty() {
            return Err(ConfigError::Validation(
                "user_agent must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Destination directory: `save_path`, else the OS download dir, else `./downloads`.
    pub fn default_save_dir(&self) -> PathBuf {
        let configured = self.save_path.trim();
        if !configured.is_empty() {
            return expand_home(Path::new(configured));
        }
        dirs::download_dir().unwrap_or_else(|| PathBuf::from("downloads"))
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn progress_throttle(&self) -> Duration {
        Duration::from_millis(self.progress_throttle_ms)
    }

    pub fn coordinator_throttle(&self) -> Duration {
        Duration::from_millis(self.coordinator_throttle_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

fn default_true() -> bool {
    true
}

fn default_drain_interval_ms() -> u64 {
    50
}

fn default_throttle_ms() -> u64 {
    100
}

fn default_request_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("media-queue-downloader/{}", env!("CARGO_PKG_VERSION"))
}
