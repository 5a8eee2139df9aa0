//! 交互层入口。
//!
//! 目前只有命令行前端：把队列协调器的 UI 回调接到终端进度条上。

pub mod cli;
