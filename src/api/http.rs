//! HTTP 发送能力抽象
//!
//! 会话只依赖 `post(url, query, body)`：命令（JSON 体）、轮询（query + 表单体）、等待（空体）三种请求形态共用。
//! 生产环境用 ReqwestHttpClient；测试用 MockHttpClient。

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::error::{ApiError, TransportError};

/// 请求体
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(Value),
    /// application/x-www-form-urlencoded
    Form(Vec<(String, String)>),
    Empty,
}

/// 最小 HTTP 响应
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn json(value: &Value) -> Self {
        Self::ok(value.to_string())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 解析 JSON 响应；非 2xx 视为传输错误，空体返回 Ok(None)
    pub fn decode_json(&self) -> Result<Option<Value>, ApiError> {
        if !self.is_success() {
            return Err(TransportError::Status(self.status).into());
        }
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&self.body)?))
    }
}

/// HTTP 发送能力：POST 并返回响应或传输错误
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn post(
        &self,
        url: &str,
        query: &[(&str, String)],
        body: RequestBody,
    ) -> Result<HttpResponse, TransportError>;
}

/// 基于 reqwest 的实现；只设置连接超时，等待请求不设整体超时
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    inner: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self {
            inner: reqwest::Client::new(),
        }
    }

    pub fn with_options(connect_timeout: Duration, user_agent: Option<&str>) -> Self {
        let mut builder = reqwest::Client::builder().connect_timeout(connect_timeout);
        if let Some(ua) = user_agent {
            builder = builder.user_agent(ua.to_string());
        }
        let inner = builder.build().unwrap_or_else(|e| {
            tracing::warn!("Failed to build HTTP client ({}), using defaults", e);
            reqwest::Client::new()
        });
        Self { inner }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn post(
        &self,
        url: &str,
        query: &[(&str, String)],
        body: RequestBody,
    ) -> Result<HttpResponse, TransportError> {
        let mut builder = self.inner.post(url);
        if !query.is_empty() {
            builder = builder.query(query);
        }
        builder = match body {
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Form(pairs) => builder.form(&pairs),
            RequestBody::Empty => builder,
        };

        let resp = builder
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        let status = resp.status().as_u16();
        let body = resp
            .bytes()
            .await
            .map_err(|e| TransportError::Body(e.to_string()))?
            .to_vec();

        Ok(HttpResponse { status, body })
    }
}
