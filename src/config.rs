//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `MEGA__*` 覆盖（双下划线表示嵌套，如 `MEGA__API__KEEPALIVE=true`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::api::{RetryPolicy, SessionConfig, DEFAULT_GATEWAY, MAX_RETRIES};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub log: LogSection,
}

/// [api] 段：网关、keepalive、会话标识与 HTTP 客户端选项
#[derive(Debug, Clone, Deserialize)]
pub struct ApiSection {
    #[serde(default = "default_gateway")]
    pub gateway: String,
    /// 命令响应带 sn 时自动启动通知循环
    #[serde(default)]
    pub keepalive: bool,
    pub sid: Option<String>,
    /// 仅限制建立连接的时间；等待请求本身不设超时
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    pub user_agent: Option<String>,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            gateway: default_gateway(),
            keepalive: false,
            sid: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            user_agent: None,
        }
    }
}

fn default_gateway() -> String {
    DEFAULT_GATEWAY.to_string()
}

fn default_connect_timeout_secs() -> u64 {
    30
}

/// [retry] 段：EAGAIN 重试次数与首次退避
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    MAX_RETRIES
}

fn default_initial_delay_ms() -> u64 {
    2000
}

/// [log] 段：tracing 过滤指令，RUST_LOG 优先
#[derive(Debug, Clone, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl AppConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_retries,
            Duration::from_millis(self.retry.initial_delay_ms),
        )
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            gateway: self.api.gateway.clone(),
            keepalive: self.api.keepalive,
            retry: self.retry_policy(),
            sid: self.api.sid.clone(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 MEGA__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 MEGA__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("MEGA")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.api.gateway, "https://g.api.mega.co.nz/");
        assert!(!cfg.api.keepalive);
        assert_eq!(cfg.retry_policy(), RetryPolicy::default());
        assert_eq!(cfg.log.filter, "info");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[api]
gateway = "https://example.test/"
keepalive = true
sid = "session-1"

[retry]
max_retries = 2
initial_delay_ms = 500
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.api.gateway, "https://example.test/");
        assert!(cfg.api.keepalive);
        assert_eq!(cfg.api.connect_timeout_secs, 30);

        let session = cfg.session_config();
        assert_eq!(session.sid.as_deref(), Some("session-1"));
        assert_eq!(session.retry.max_retries, 2);
        assert_eq!(session.retry.delay_for(2), Duration::from_secs(1));
    }
}
