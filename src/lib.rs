//! mega-api - MEGA 命令与通知协议的传输客户端
//!
//! 模块划分：
//! - **api**: 会话、命令通道（EAGAIN 指数退避重试）、长轮询通知循环、错误码映射、HTTP 抽象
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **observability**: tracing 日志初始化
//! - **shutdown**: 信号监听与优雅关闭

pub mod api;
pub mod config;
pub mod observability;
pub mod shutdown;

pub use api::{
    ActionBatch, ApiError, ApiSession, Cursor, ErrorCode, HttpClient, NotificationEvent,
    NotificationState, RetryPolicy, SessionConfig, Subscription,
};
