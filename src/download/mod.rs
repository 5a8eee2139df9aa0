//! 下载队列模块入口。
//!
//! 子模块：
//! - `models`：数据模型（DownloadJob / JobSnapshot / DownloadEvent 等）
//! - `event_bus`：跨线程事件总线（发布不阻塞，分发在 UI 线程）
//! - `throttle`：进度上报节流
//! - `strategy`：下载策略接口、服务识别与策略注册表
//! - `http_fetch`：直链 HTTP 下载策略
//! - `paths`：输出路径与文件名清洗
//! - `processor`：顺序执行任务的后台处理器
//! - `coordinator`：事件到 UI 回调的协调器

pub mod coordinator;
pub mod event_bus;
pub mod http_fetch;
pub mod models;
pub mod paths;
pub mod processor;
pub mod strategy;
pub mod throttle;
