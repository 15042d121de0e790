//! API 错误类型与错误码映射
//!
//! 三类错误：传输错误（无响应）、协议错误（负整数错误码）、逻辑错误（空响应 / 意外响应）。
//! 只有 EAGAIN (-3) 可重试。

use std::fmt;

use thiserror::Error;

/// 服务端返回 EAGAIN 时的默认最大重试次数
pub const MAX_RETRIES: u32 = 4;

/// 传输层错误：未拿到可用响应
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Request(String),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("Failed to read response body: {0}")]
    Body(String),
}

/// 协议错误码（-1 ~ -18），互斥，不可组合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Internal,
    Args,
    Eagain,
    RateLimit,
    Failed,
    TooMany,
    Range,
    Expired,
    NotFound,
    Circular,
    Access,
    Exist,
    Incomplete,
    Key,
    Sid,
    Blocked,
    OverQuota,
    TempUnavail,
}

impl ErrorCode {
    const ALL: [ErrorCode; 18] = [
        ErrorCode::Internal,
        ErrorCode::Args,
        ErrorCode::Eagain,
        ErrorCode::RateLimit,
        ErrorCode::Failed,
        ErrorCode::TooMany,
        ErrorCode::Range,
        ErrorCode::Expired,
        ErrorCode::NotFound,
        ErrorCode::Circular,
        ErrorCode::Access,
        ErrorCode::Exist,
        ErrorCode::Incomplete,
        ErrorCode::Key,
        ErrorCode::Sid,
        ErrorCode::Blocked,
        ErrorCode::OverQuota,
        ErrorCode::TempUnavail,
    ];

    /// 负整数 -> 错误码；范围外返回 None
    pub fn from_code(code: i64) -> Option<Self> {
        if !(-18..=-1).contains(&code) {
            return None;
        }
        Self::ALL.get((-code - 1) as usize).copied()
    }

    /// 服务端使用的负整数
    pub fn code(self) -> i64 {
        -(Self::ALL.iter().position(|c| *c == self).unwrap_or(0) as i64 + 1)
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::Internal => "EINTERNAL",
            ErrorCode::Args => "EARGS",
            ErrorCode::Eagain => "EAGAIN",
            ErrorCode::RateLimit => "ERATELIMIT",
            ErrorCode::Failed => "EFAILED",
            ErrorCode::TooMany => "ETOOMANY",
            ErrorCode::Range => "ERANGE",
            ErrorCode::Expired => "EEXPIRED",
            ErrorCode::NotFound => "ENOENT",
            ErrorCode::Circular => "ECIRCULAR",
            ErrorCode::Access => "EACCESS",
            ErrorCode::Exist => "EEXIST",
            ErrorCode::Incomplete => "EINCOMPLETE",
            ErrorCode::Key => "EKEY",
            ErrorCode::Sid => "ESID",
            ErrorCode::Blocked => "EBLOCKED",
            ErrorCode::OverQuota => "EOVERQUOTA",
            ErrorCode::TempUnavail => "ETEMPUNAVAIL",
        }
    }

    /// 人类可读描述（不含名称与错误码前缀）
    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::Internal => "An internal error has occurred. Please submit a bug report, detailing the exact circumstances in which this error occurred.",
            ErrorCode::Args => "You have passed invalid arguments to this command.",
            ErrorCode::Eagain => "A temporary congestion or server malfunction prevented your request from being processed. No data was altered.",
            ErrorCode::RateLimit => "You have exceeded your command weight per time quota. Please wait a few seconds, then try again (this should never happen in sane real-life applications).",
            ErrorCode::Failed => "The upload failed. Please restart it from scratch.",
            ErrorCode::TooMany => "Too many concurrent IP addresses are accessing this upload target URL.",
            ErrorCode::Range => "The upload file packet is out of range or not starting and ending on a chunk boundary.",
            ErrorCode::Expired => "The upload target URL you are trying to access has expired. Please request a fresh one.",
            ErrorCode::NotFound => "Object (typically, node or user) not found. Wrong password?",
            ErrorCode::Circular => "Circular linkage attempted",
            ErrorCode::Access => "Access violation (e.g., trying to write to a read-only share)",
            ErrorCode::Exist => "Trying to create an object that already exists",
            ErrorCode::Incomplete => "Trying to access an incomplete resource",
            ErrorCode::Key => "A decryption operation failed (never returned by the API)",
            ErrorCode::Sid => "Invalid or expired user session, please relogin",
            ErrorCode::Blocked => "User blocked",
            ErrorCode::OverQuota => "Request over quota",
            ErrorCode::TempUnavail => "Resource temporarily not available, please try again later",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.name(), self.code(), self.description())
    }
}

/// 命令通道与通知循环对外暴露的错误
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Protocol(ErrorCode),

    /// 可重试错误码在重试次数用尽后仍被返回；`retries` 为实际重试次数
    #[error("{code} Retried {retries} times.")]
    Exhausted { code: ErrorCode, retries: u32 },

    /// 错误码表之外的负整数，原样上报
    #[error("API error {0}")]
    UnknownCode(i64),

    #[error("Empty response")]
    EmptyResponse,

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("JSON parse error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Failed to serialize command: {0}")]
    Serialize(String),
}

impl ApiError {
    /// 将服务端返回的负整数转为错误
    pub fn from_code(code: i64) -> Self {
        match ErrorCode::from_code(code) {
            Some(c) => ApiError::Protocol(c),
            None => ApiError::UnknownCode(code),
        }
    }

    /// 重试用尽：把协议错误标记上实际重试次数，其它错误原样返回
    pub fn exhausted(self, retries: u32) -> Self {
        match self {
            ApiError::Protocol(code) => ApiError::Exhausted { code, retries },
            other => other,
        }
    }

    /// 仅 EAGAIN 可重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Protocol(ErrorCode::Eagain))
    }

    /// 协议错误码（含未知码）；其它类别返回 None
    pub fn code(&self) -> Option<i64> {
        match self {
            ApiError::Protocol(c) | ApiError::Exhausted { code: c, .. } => Some(c.code()),
            ApiError::UnknownCode(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, ApiError::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_cover_full_range() {
        for n in -18..=-1 {
            let code = ErrorCode::from_code(n).expect("code in range");
            assert_eq!(code.code(), n);
        }
        assert_eq!(ErrorCode::from_code(0), None);
        assert_eq!(ErrorCode::from_code(-19), None);
        assert_eq!(ErrorCode::from_code(3), None);
    }

    #[test]
    fn test_enoent_message() {
        let err = ApiError::from_code(-9);
        assert_eq!(
            err.to_string(),
            "ENOENT (-9): Object (typically, node or user) not found. Wrong password?"
        );
    }

    #[test]
    fn test_eagain_message_mentions_retries() {
        let msg = ApiError::from_code(-3).exhausted(MAX_RETRIES).to_string();
        assert!(msg.starts_with("EAGAIN (-3): "));
        assert!(msg.ends_with("No data was altered. Retried 4 times."));
    }

    #[test]
    fn test_exhausted_reports_actual_retry_count() {
        let err = ApiError::from_code(-3).exhausted(2);
        assert!(matches!(
            err,
            ApiError::Exhausted { code: ErrorCode::Eagain, retries: 2 }
        ));
        assert!(err.to_string().ends_with("Retried 2 times."));
        assert_eq!(err.code(), Some(-3));
        assert!(!err.is_retryable());

        let plain = ErrorCode::Eagain.to_string();
        assert!(!plain.contains("Retried"));
    }

    #[test]
    fn test_exhausted_leaves_other_errors_alone() {
        let err = ApiError::EmptyResponse.exhausted(4);
        assert!(matches!(err, ApiError::EmptyResponse));
    }

    #[test]
    fn test_unknown_code_is_untranslated() {
        let err = ApiError::from_code(-42);
        assert!(matches!(err, ApiError::UnknownCode(-42)));
        assert_eq!(err.to_string(), "API error -42");
        assert_eq!(err.code(), Some(-42));
    }

    #[test]
    fn test_only_eagain_is_retryable() {
        assert!(ApiError::from_code(-3).is_retryable());
        for n in (-18..=-1).filter(|n| *n != -3) {
            assert!(!ApiError::from_code(n).is_retryable(), "code {n}");
        }
        assert!(!ApiError::Transport(TransportError::Status(503)).is_retryable());
        assert!(!ApiError::EmptyResponse.is_retryable());
    }

    #[test]
    fn test_esid_and_etempunavail() {
        assert_eq!(ErrorCode::from_code(-15), Some(ErrorCode::Sid));
        assert_eq!(
            ErrorCode::TempUnavail.to_string(),
            "ETEMPUNAVAIL (-18): Resource temporarily not available, please try again later"
        );
    }
}
