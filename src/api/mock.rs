//! Mock HTTP 客户端（用于测试，无需网络）
//!
//! 按 URL 区分三类请求：`…/cs` 命令、`…/sc` 轮询、其它为等待 URL。每类各有一条脚本队列；
//! 轮询/等待队列为空时请求一直挂起（模拟长轮询无数据），直到 future 被丢弃。
//! 记录所有请求，并统计轮询 + 等待请求的并发峰值。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;

use super::error::TransportError;
use super::http::{HttpClient, HttpResponse, RequestBody};

/// 单次脚本响应
#[derive(Debug, Clone)]
pub enum MockReply {
    Json(Value),
    Raw(HttpResponse),
    Error(TransportError),
    /// 永不返回，直到请求被取消
    Hang,
}

impl From<Value> for MockReply {
    fn from(value: Value) -> Self {
        MockReply::Json(value)
    }
}

/// 请求类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Command,
    Poll,
    Wait,
}

impl RequestKind {
    fn classify(url: &str) -> Self {
        if url.ends_with("/cs") {
            RequestKind::Command
        } else if url.ends_with("/sc") {
            RequestKind::Poll
        } else {
            RequestKind::Wait
        }
    }
}

/// 已记录的请求
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub kind: RequestKind,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
}

impl RecordedRequest {
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Default)]
struct Script {
    commands: VecDeque<MockReply>,
    polls: VecDeque<MockReply>,
    waits: VecDeque<MockReply>,
    requests: Vec<RecordedRequest>,
}

#[derive(Default)]
struct MockState {
    script: Mutex<Script>,
    notify: Notify,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// 脚本化的 HttpClient；Clone 共享同一份状态
#[derive(Clone, Default)]
pub struct MockHttpClient {
    state: Arc<MockState>,
}

/// 轮询/等待请求的在途计数；future 被丢弃时同样递减
struct InFlightGuard<'a>(&'a MockState);

impl<'a> InFlightGuard<'a> {
    fn enter(state: &'a MockState) -> Self {
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.state
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push_command(&self, reply: impl Into<MockReply>) -> &Self {
        self.script().commands.push_back(reply.into());
        self
    }

    pub fn push_poll(&self, reply: impl Into<MockReply>) -> &Self {
        self.script().polls.push_back(reply.into());
        self
    }

    pub fn push_wait(&self, reply: impl Into<MockReply>) -> &Self {
        self.script().waits.push_back(reply.into());
        self
    }

    /// 全部已记录请求（按发送顺序）
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.script().requests.clone()
    }

    pub fn requests_of(&self, kind: RequestKind) -> Vec<RecordedRequest> {
        self.script()
            .requests
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    /// 当前在途的轮询/等待请求数
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// 轮询/等待请求的历史并发峰值
    pub fn peak_in_flight(&self) -> usize {
        self.state.peak_in_flight.load(Ordering::SeqCst)
    }

    /// 等待直到某类请求累计达到 n 个
    pub async fn wait_for(&self, kind: RequestKind, n: usize) {
        loop {
            let notified = self.state.notify.notified();
            if self.requests_of(kind).len() >= n {
                return;
            }
            notified.await;
        }
    }

    async fn reply(reply: MockReply) -> Result<HttpResponse, TransportError> {
        match reply {
            MockReply::Json(value) => Ok(HttpResponse::json(&value)),
            MockReply::Raw(resp) => Ok(resp),
            MockReply::Error(err) => Err(err),
            MockReply::Hang => futures_util::future::pending().await,
        }
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn post(
        &self,
        url: &str,
        query: &[(&str, String)],
        body: RequestBody,
    ) -> Result<HttpResponse, TransportError> {
        let kind = RequestKind::classify(url);
        let reply = {
            let mut script = self.script();
            script.requests.push(RecordedRequest {
                kind,
                url: url.to_string(),
                query: query
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
                body,
            });
            let queued = match kind {
                RequestKind::Command => script.commands.pop_front(),
                RequestKind::Poll => script.polls.pop_front(),
                RequestKind::Wait => script.waits.pop_front(),
            };
            queued.unwrap_or_else(|| match kind {
                RequestKind::Command => MockReply::Error(TransportError::Request(
                    "no scripted reply".to_string(),
                )),
                RequestKind::Poll | RequestKind::Wait => MockReply::Hang,
            })
        };
        self.state.notify.notify_waiters();

        if kind == RequestKind::Command {
            return Self::reply(reply).await;
        }
        let _guard = InFlightGuard::enter(&self.state);
        Self::reply(reply).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_scripted_replies_in_order() {
        let mock = MockHttpClient::new();
        mock.push_command(json!([1])).push_command(json!([2]));

        let first = mock
            .post("https://g/cs", &[], RequestBody::Empty)
            .await
            .unwrap();
        let second = mock
            .post("https://g/cs", &[], RequestBody::Empty)
            .await
            .unwrap();
        assert_eq!(first.body, b"[1]");
        assert_eq!(second.body, b"[2]");

        let third = mock.post("https://g/cs", &[], RequestBody::Empty).await;
        assert!(third.is_err());
        assert_eq!(mock.requests_of(RequestKind::Command).len(), 3);
    }

    #[tokio::test]
    async fn test_dropped_hang_releases_in_flight() {
        let mock = MockHttpClient::new();
        let fut = mock.post("https://wait/x", &[], RequestBody::Empty);
        let res = tokio::time::timeout(std::time::Duration::from_millis(10), fut).await;
        assert!(res.is_err());
        assert_eq!(mock.in_flight(), 0);
        assert_eq!(mock.peak_in_flight(), 1);
        assert_eq!(mock.requests()[0].kind, RequestKind::Wait);
    }
}
