//! API 会话：会话标识、请求计数器、网关地址、通知开关与生命周期
//!
//! 一个会话同时承载两类异步活动：任意多个并发的命令请求，以及至多一个通知循环。
//! `close()` 取消在途的轮询/等待请求；在途命令不受影响，由调用方自行等待或放弃。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::Rng;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::http::{HttpClient, ReqwestHttpClient};
use super::notify::{self, Cursor, NotificationHub, NotificationState, Subscription};
use super::retry::RetryPolicy;
use crate::config::AppConfig;

/// 默认 API 网关
pub const DEFAULT_GATEWAY: &str = "https://g.api.mega.co.nz/";

/// 会话配置
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// 网关基址，`cs` / `sc` 端点拼接在其后
    pub gateway: String,
    /// 命令响应带 `sn` 时是否自动启动通知循环
    pub keepalive: bool,
    pub retry: RetryPolicy,
    /// 已登录时的会话标识
    pub sid: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            gateway: DEFAULT_GATEWAY.to_string(),
            keepalive: false,
            retry: RetryPolicy::default(),
            sid: None,
        }
    }
}

/// 正在运行的通知循环
struct PollerHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub(crate) struct SessionInner<H> {
    pub(crate) http: H,
    gateway: String,
    pub(crate) keepalive: bool,
    pub(crate) retry: RetryPolicy,
    sid: RwLock<Option<String>>,
    counter: AtomicU64,
    pub(crate) hub: NotificationHub,
    pub(crate) state_tx: watch::Sender<NotificationState>,
    poller: Mutex<Option<PollerHandle>>,
    shutdown: CancellationToken,
}

impl<H> SessionInner<H> {
    pub(crate) fn endpoint(&self, name: &str) -> String {
        format!("{}{}", self.gateway, name)
    }

    pub(crate) async fn sid(&self) -> Option<String> {
        self.sid.read().await.clone()
    }

    /// 取下一个请求 id；每次调用都递增，绝不复用
    pub(crate) fn next_request_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn set_state(&self, state: NotificationState) {
        tracing::debug!(?state, "notification state");
        self.state_tx.send_replace(state);
    }
}

/// API 会话；Clone 共享同一会话
pub struct ApiSession<H: HttpClient + 'static = ReqwestHttpClient> {
    pub(crate) inner: Arc<SessionInner<H>>,
}

impl<H: HttpClient + 'static> Clone for ApiSession<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ApiSession<ReqwestHttpClient> {
    /// 按应用配置创建基于 reqwest 的会话
    pub fn from_config(cfg: &AppConfig) -> Self {
        let http = ReqwestHttpClient::with_options(
            std::time::Duration::from_secs(cfg.api.connect_timeout_secs),
            cfg.api.user_agent.as_deref(),
        );
        Self::new(cfg.session_config(), http)
    }
}

impl<H: HttpClient + 'static> ApiSession<H> {
    pub fn new(config: SessionConfig, http: H) -> Self {
        let mut gateway = config.gateway;
        if !gateway.ends_with('/') {
            gateway.push('/');
        }
        let (state_tx, _) = watch::channel(NotificationState::Idle);
        let counter = rand::thread_rng().gen_range(10_000_000..100_000_000);

        Self {
            inner: Arc::new(SessionInner {
                http,
                gateway,
                keepalive: config.keepalive,
                retry: config.retry,
                sid: RwLock::new(config.sid),
                counter: AtomicU64::new(counter),
                hub: NotificationHub::default(),
                state_tx,
                poller: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn gateway(&self) -> &str {
        &self.inner.gateway
    }

    pub fn keepalive(&self) -> bool {
        self.inner.keepalive
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.inner.retry
    }

    pub async fn sid(&self) -> Option<String> {
        self.inner.sid().await
    }

    /// 登录成功后设置会话标识（或注销时清空）
    pub async fn set_sid(&self, sid: Option<String>) {
        *self.inner.sid.write().await = sid;
    }

    /// 订阅通知事件；会话关闭后流结束
    pub fn subscribe(&self) -> Subscription {
        self.inner.hub.subscribe()
    }

    pub fn notification_state(&self) -> NotificationState {
        self.inner.state_tx.borrow().clone()
    }

    /// 监听通知循环状态变化
    pub fn watch_notifications(&self) -> watch::Receiver<NotificationState> {
        self.inner.state_tx.subscribe()
    }

    /// 从给定游标启动通知循环
    ///
    /// 已有循环在运行或会话已关闭时不做任何事并返回 false；同一会话同一时刻至多一个轮询/等待请求。
    pub async fn start_notifications(&self, sn: impl Into<Cursor>) -> bool {
        let sn = sn.into();
        // 持锁后检查关闭标志，与 close() 的先取消后取锁配对
        let mut poller = self.inner.poller.lock().await;
        if self.inner.shutdown.is_cancelled() {
            tracing::debug!(%sn, "session closed, not starting notification loop");
            return false;
        }
        if let Some(running) = poller.as_ref() {
            if !running.handle.is_finished() {
                tracing::debug!(%sn, "notification loop already running");
                return false;
            }
        }

        tracing::info!(%sn, "starting notification loop");
        let token = self.inner.shutdown.child_token();
        self.inner.set_state(NotificationState::Polling { sn: sn.clone() });
        let handle = tokio::spawn(notify::run(
            Arc::clone(&self.inner),
            sn,
            token.clone(),
        ));
        *poller = Some(PollerHandle { token, handle });
        true
    }

    /// 通知循环是否在运行
    pub async fn is_notifying(&self) -> bool {
        self.inner
            .poller
            .lock()
            .await
            .as_ref()
            .is_some_and(|p| !p.handle.is_finished())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// 关闭会话：中止在途的轮询/等待请求并等待循环退出，结束所有订阅；可重复调用
    pub async fn close(&self) {
        self.inner.shutdown.cancel();

        let running = self.inner.poller.lock().await.take();
        if let Some(PollerHandle { token, handle }) = running {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::warn!("notification loop ended abnormally: {}", e);
            }
        }

        if !matches!(self.notification_state(), NotificationState::Failed { .. }) {
            self.inner.set_state(NotificationState::Stopped);
        }
        self.inner.hub.close();
    }
}
