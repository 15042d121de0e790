//! 命令通道：单条命令包装为单元素批次 POST 到 `cs`，EAGAIN 指数退避重试
//!
//! 每次 HTTP 尝试都消耗一个新的请求 id；传输错误立即返回不重试。
//! 开启 keepalive 时，响应中的 `sn` 会启动通知循环。

use serde::Serialize;
use serde_json::{json, Value};

use super::error::ApiError;
use super::http::{HttpClient, RequestBody};
use super::notify::Cursor;
use super::retry::RetryState;
use super::session::ApiSession;

/// 单次尝试的结果：成功值或服务端错误码
enum Attempt {
    Success(Value),
    Code(i64),
}

/// 解包服务端响应：非空数组取首元素，其余原样使用
fn unwrap_response(value: Option<Value>) -> Result<Attempt, ApiError> {
    let value = match value {
        None | Some(Value::Null) => return Err(ApiError::EmptyResponse),
        Some(Value::Array(mut items)) if !items.is_empty() => items.swap_remove(0),
        Some(other) => other,
    };

    match value.as_i64() {
        Some(code) if code < 0 => Ok(Attempt::Code(code)),
        _ => Ok(Attempt::Success(value)),
    }
}

impl<H: HttpClient + 'static> ApiSession<H> {
    /// 发送一条命令并返回解包后的响应
    pub async fn request<C: Serialize + ?Sized>(&self, command: &C) -> Result<Value, ApiError> {
        let mut retry = RetryState::new();
        self.request_with_state(command, &mut retry).await
    }

    /// 同 [`request`](Self::request)，重试次数与累计退避时间写入 `retry`
    pub async fn request_with_state<C: Serialize + ?Sized>(
        &self,
        command: &C,
        retry: &mut RetryState,
    ) -> Result<Value, ApiError> {
        let command =
            serde_json::to_value(command).map_err(|e| ApiError::Serialize(e.to_string()))?;
        let body = json!([command]);

        loop {
            match self.send_once(&body).await? {
                Attempt::Success(value) => {
                    self.maybe_start_notifications(&value).await;
                    return Ok(value);
                }
                Attempt::Code(code) => {
                    let error = ApiError::from_code(code);
                    if error.is_retryable() {
                        if let Some(delay) = retry.next_delay(&self.inner.retry) {
                            tracing::warn!(
                                retry = retry.retries(),
                                "command got EAGAIN, retrying in {:?}",
                                delay
                            );
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        let error = error.exhausted(retry.retries());
                        tracing::debug!(code, "command gave up: {}", error);
                        return Err(error);
                    }
                    tracing::debug!(code, "command failed: {}", error);
                    return Err(error);
                }
            }
        }
    }

    async fn send_once(&self, body: &Value) -> Result<Attempt, ApiError> {
        let id = self.inner.next_request_id();
        let mut query = vec![("id", id.to_string())];
        if let Some(sid) = self.inner.sid().await {
            query.push(("sid", sid));
        }

        tracing::debug!(id, "sending command");
        let resp = self
            .inner
            .http
            .post(
                &self.inner.endpoint("cs"),
                &query,
                RequestBody::Json(body.clone()),
            )
            .await?;
        unwrap_response(resp.decode_json()?)
    }

    async fn maybe_start_notifications(&self, response: &Value) {
        if !self.inner.keepalive {
            return;
        }
        if let Some(sn) = response.get("sn").and_then(Value::as_str) {
            self.start_notifications(Cursor::from(sn)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unwrap(value: Value) -> Result<Attempt, ApiError> {
        unwrap_response(Some(value))
    }

    #[test]
    fn test_unwraps_first_element() {
        match unwrap(json!([{"u": "x"}, {"ignored": true}])).unwrap() {
            Attempt::Success(v) => assert_eq!(v, json!({"u": "x"})),
            Attempt::Code(_) => panic!("Expected success"),
        }
    }

    #[test]
    fn test_bare_negative_number_is_code() {
        assert!(matches!(unwrap(json!(-3)).unwrap(), Attempt::Code(-3)));
        assert!(matches!(unwrap(json!([-9])).unwrap(), Attempt::Code(-9)));
    }

    #[test]
    fn test_non_negative_numbers_are_success() {
        assert!(matches!(unwrap(json!([0])).unwrap(), Attempt::Success(_)));
        assert!(matches!(unwrap(json!(17)).unwrap(), Attempt::Success(_)));
    }

    #[test]
    fn test_empty_response() {
        assert!(matches!(unwrap_response(None), Err(ApiError::EmptyResponse)));
        assert!(matches!(unwrap(Value::Null), Err(ApiError::EmptyResponse)));
    }

    #[test]
    fn test_empty_array_passes_through() {
        match unwrap(json!([])).unwrap() {
            Attempt::Success(v) => assert_eq!(v, json!([])),
            Attempt::Code(_) => panic!("Expected success"),
        }
    }
}
