//! MEGA API 传输层：命令通道、重试策略、长轮询通知与错误码映射

pub mod command;
pub mod error;
pub mod http;
pub mod mock;
pub mod notify;
pub mod retry;
pub mod session;

pub use error::{ApiError, ErrorCode, TransportError, MAX_RETRIES};
pub use http::{HttpClient, HttpResponse, ReqwestHttpClient, RequestBody};
pub use mock::{MockHttpClient, MockReply, RecordedRequest, RequestKind};
pub use notify::{ActionBatch, Cursor, NotificationEvent, NotificationState, Subscription};
pub use retry::{RetryPolicy, RetryState};
pub use session::{ApiSession, SessionConfig, DEFAULT_GATEWAY};
