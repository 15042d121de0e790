//! 通知循环：Polling → Waiting → Polling 状态机
//!
//! - **Polling**：POST `sc?sn=…&sid=…`（表单体再带一次 `sn`）；响应带 `w` 转入 Waiting，
//!   带 `sn` 则先投递动作批次再用新游标立即重新轮询
//! - **Waiting**：POST 服务端给出的一次性等待 URL，无论成功与否都以原游标回到 Polling
//! - **Stopped**：会话关闭，不向订阅者报错
//! - **Failed**：传输错误、EAGAIN 重试用尽、其它错误码或意外响应；向订阅者投递 Failed 事件后停止
//!
//! 循环在单个任务里顺序推进，因此同一时刻至多一个在途的轮询/等待请求。

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::ApiError;
use super::http::{HttpClient, RequestBody};
use super::retry::RetryState;
use super::session::SessionInner;

/// 通知流游标（服务端下发的不透明 `sn`）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(sn: impl Into<String>) -> Self {
        Self(sn.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Cursor {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Cursor {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// 一次游标推进时一起下发的动作
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionBatch {
    /// 投递时的游标
    pub sn: Cursor,
    /// 同一响应携带的下一个游标
    pub next_sn: Cursor,
    pub actions: Vec<Value>,
}

/// 订阅者收到的事件
#[derive(Debug, Clone)]
pub enum NotificationEvent {
    Actions(ActionBatch),
    /// 流已中断，不会再有后续事件
    Failed(Arc<ApiError>),
}

/// 通知循环对外可见的状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationState {
    /// 尚未启动
    Idle,
    Polling { sn: Cursor },
    Waiting { sn: Cursor, url: String },
    Stopped,
    Failed { sn: Cursor, reason: String },
}

/// 订阅者注册表；每个订阅者一条无界通道，保证顺序且不丢事件
#[derive(Default)]
pub(crate) struct NotificationHub {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<NotificationEvent>>>,
    closed: AtomicBool,
}

impl NotificationHub {
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<NotificationEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.lock();
        if !self.closed.load(Ordering::SeqCst) {
            subscribers.push(tx);
        }
        Subscription { rx }
    }

    /// 投递给所有仍在监听的订阅者，顺带清理已断开的
    pub(crate) fn emit(&self, event: NotificationEvent) {
        self.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.lock().clear();
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.lock().len()
    }
}

/// 通知事件订阅；会话关闭后返回 None
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<NotificationEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<NotificationEvent> {
        self.rx.recv().await
    }

    /// 非阻塞读取
    pub fn try_recv(&mut self) -> Option<NotificationEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = NotificationEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// 单次轮询响应的解释结果
#[derive(Debug)]
pub(crate) enum PollOutcome {
    Wait(String),
    Advance { next: Cursor, actions: Vec<Value> },
    Fail(ApiError),
}

/// 解释轮询响应；EAGAIN 也作为 Fail 返回，是否重试由循环决定
pub(crate) fn interpret_poll(result: Result<Option<Value>, ApiError>) -> PollOutcome {
    let value = match result {
        Ok(Some(value)) => value,
        Ok(None) => return PollOutcome::Fail(ApiError::EmptyResponse),
        Err(e) => return PollOutcome::Fail(e),
    };

    if let Some(code) = value.as_i64().filter(|n| *n < 0) {
        return PollOutcome::Fail(ApiError::from_code(code));
    }

    let Some(obj) = value.as_object() else {
        return PollOutcome::Fail(ApiError::UnexpectedResponse(format!(
            "poll response is not an object: {value}"
        )));
    };

    if let Some(w) = obj.get("w") {
        return match w.as_str() {
            Some(url) if !url.is_empty() => PollOutcome::Wait(url.to_string()),
            _ => PollOutcome::Fail(ApiError::UnexpectedResponse(format!(
                "invalid wait url: {w}"
            ))),
        };
    }

    let Some(next) = obj.get("sn").and_then(Value::as_str) else {
        return PollOutcome::Fail(ApiError::UnexpectedResponse(
            "poll response carries neither `w` nor `sn`".to_string(),
        ));
    };

    let actions = match obj.get("a") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(other) => {
            return PollOutcome::Fail(ApiError::UnexpectedResponse(format!(
                "action list is not an array: {other}"
            )))
        }
    };

    PollOutcome::Advance {
        next: Cursor::from(next),
        actions,
    }
}

enum LoopState {
    Polling { sn: Cursor, retry: RetryState },
    Waiting { sn: Cursor, url: String },
    Stopped,
    Failed { sn: Cursor, error: ApiError },
}

/// 取消时返回 None，并丢弃在途的 future（即中止请求）
async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

async fn poll_once<H: HttpClient>(
    inner: &SessionInner<H>,
    sn: &Cursor,
) -> Result<Option<Value>, ApiError> {
    let mut query = vec![("sn", sn.to_string())];
    if let Some(sid) = inner.sid().await {
        query.push(("sid", sid));
    }
    let body = RequestBody::Form(vec![("sn".to_string(), sn.to_string())]);
    let resp = inner.http.post(&inner.endpoint("sc"), &query, body).await?;
    resp.decode_json()
}

async fn poll_step<H: HttpClient>(
    inner: &SessionInner<H>,
    sn: Cursor,
    mut retry: RetryState,
    cancel: &CancellationToken,
) -> LoopState {
    inner.set_state(NotificationState::Polling { sn: sn.clone() });
    let Some(result) = cancellable(cancel, poll_once(inner, &sn)).await else {
        return LoopState::Stopped;
    };

    match interpret_poll(result) {
        PollOutcome::Wait(url) => LoopState::Waiting { sn, url },
        PollOutcome::Advance { next, actions } => {
            if actions.is_empty() {
                tracing::debug!(%sn, %next, "cursor advanced without actions");
            } else {
                tracing::debug!(%sn, %next, count = actions.len(), "action batch received");
                inner.hub.emit(NotificationEvent::Actions(ActionBatch {
                    sn,
                    next_sn: next.clone(),
                    actions,
                }));
            }
            LoopState::Polling {
                sn: next,
                retry: RetryState::new(),
            }
        }
        PollOutcome::Fail(error) if error.is_retryable() => match retry.next_delay(&inner.retry) {
            Some(delay) => {
                tracing::warn!(
                    %sn,
                    retry = retry.retries(),
                    "notification poll got EAGAIN, retrying in {:?}",
                    delay
                );
                match cancellable(cancel, tokio::time::sleep(delay)).await {
                    Some(()) => LoopState::Polling { sn, retry },
                    None => LoopState::Stopped,
                }
            }
            None => LoopState::Failed {
                sn,
                error: error.exhausted(retry.retries()),
            },
        },
        PollOutcome::Fail(error) => LoopState::Failed { sn, error },
    }
}

/// 等待请求的响应体被丢弃；失败只记日志
async fn wait_step<H: HttpClient>(
    inner: &SessionInner<H>,
    sn: Cursor,
    url: String,
    cancel: &CancellationToken,
) -> LoopState {
    inner.set_state(NotificationState::Waiting {
        sn: sn.clone(),
        url: url.clone(),
    });
    match cancellable(cancel, inner.http.post(&url, &[], RequestBody::Empty)).await {
        None => return LoopState::Stopped,
        Some(Err(e)) => tracing::warn!(%sn, "wait request failed: {}", e),
        Some(Ok(_)) => tracing::debug!(%sn, "wait request returned"),
    }
    LoopState::Polling {
        sn,
        retry: RetryState::new(),
    }
}

/// 通知循环主体，由会话 spawn；返回即表示进入 Stopped 或 Failed
pub(crate) async fn run<H: HttpClient>(
    inner: Arc<SessionInner<H>>,
    sn: Cursor,
    cancel: CancellationToken,
) {
    let mut state = LoopState::Polling {
        sn,
        retry: RetryState::new(),
    };

    loop {
        state = match state {
            LoopState::Polling { sn, retry } => poll_step(&inner, sn, retry, &cancel).await,
            LoopState::Waiting { sn, url } => wait_step(&inner, sn, url, &cancel).await,
            LoopState::Stopped => {
                tracing::info!("notification loop stopped");
                inner.set_state(NotificationState::Stopped);
                return;
            }
            LoopState::Failed { sn, error } => {
                tracing::error!(%sn, "notification loop failed: {}", error);
                inner.set_state(NotificationState::Failed {
                    sn,
                    reason: error.to_string(),
                });
                inner.hub.emit(NotificationEvent::Failed(Arc::new(error)));
                return;
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::error::{ErrorCode, TransportError};
    use serde_json::json;

    #[test]
    fn test_wait_only_response() {
        match interpret_poll(Ok(Some(json!({"w": "https://wait/x"})))) {
            PollOutcome::Wait(url) => assert_eq!(url, "https://wait/x"),
            other => panic!("Expected Wait, got {other:?}"),
        }
    }

    #[test]
    fn test_advance_with_actions() {
        match interpret_poll(Ok(Some(json!({"a": [{"a": "u"}, {"a": "d"}], "sn": "A2"})))) {
            PollOutcome::Advance { next, actions } => {
                assert_eq!(next, Cursor::from("A2"));
                assert_eq!(actions, vec![json!({"a": "u"}), json!({"a": "d"})]);
            }
            other => panic!("Expected Advance, got {other:?}"),
        }
    }

    #[test]
    fn test_advance_without_actions() {
        match interpret_poll(Ok(Some(json!({"sn": "A3"})))) {
            PollOutcome::Advance { next, actions } => {
                assert_eq!(next.as_str(), "A3");
                assert!(actions.is_empty());
            }
            other => panic!("Expected Advance, got {other:?}"),
        }
    }

    #[test]
    fn test_error_codes() {
        assert!(matches!(
            interpret_poll(Ok(Some(json!(-9)))),
            PollOutcome::Fail(ApiError::Protocol(ErrorCode::NotFound))
        ));
        assert!(matches!(
            interpret_poll(Ok(Some(json!(-3)))),
            PollOutcome::Fail(ApiError::Protocol(ErrorCode::Eagain))
        ));
        assert!(matches!(
            interpret_poll(Ok(Some(json!(-99)))),
            PollOutcome::Fail(ApiError::UnknownCode(-99))
        ));
    }

    #[test]
    fn test_neither_w_nor_sn_is_unexpected() {
        assert!(matches!(
            interpret_poll(Ok(Some(json!({"a": []})))),
            PollOutcome::Fail(ApiError::UnexpectedResponse(_))
        ));
        assert!(matches!(
            interpret_poll(Ok(Some(json!("ok")))),
            PollOutcome::Fail(ApiError::UnexpectedResponse(_))
        ));
        assert!(matches!(
            interpret_poll(Ok(None)),
            PollOutcome::Fail(ApiError::EmptyResponse)
        ));
    }

    #[test]
    fn test_transport_error_passthrough() {
        let err = ApiError::Transport(TransportError::Request("reset".to_string()));
        assert!(matches!(
            interpret_poll(Err(err)),
            PollOutcome::Fail(ApiError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_hub_delivers_in_order_and_drops_closed() {
        let hub = NotificationHub::default();
        let mut first = hub.subscribe();
        let second = hub.subscribe();
        drop(second);

        for n in 0..3 {
            hub.emit(NotificationEvent::Actions(ActionBatch {
                sn: Cursor::from(format!("S{n}")),
                next_sn: Cursor::from(format!("S{}", n + 1)),
                actions: vec![json!(n)],
            }));
        }
        assert_eq!(hub.subscriber_count(), 1);

        for n in 0..3 {
            match first.recv().await {
                Some(NotificationEvent::Actions(batch)) => assert_eq!(batch.actions, vec![json!(n)]),
                other => panic!("Expected Actions, got {other:?}"),
            }
        }

        hub.close();
        assert!(first.recv().await.is_none());
        let mut late = hub.subscribe();
        assert!(late.recv().await.is_none());
    }
}
