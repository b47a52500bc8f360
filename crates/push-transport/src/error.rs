//! 推送传输错误类型
//!
//! 区分三类错误：启动期的配置错误（致命）、单条消息的投递错误（只影响该任务）、
//! 以及队列协作方返回的错误。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 配置错误，在 init 时同步返回，阻止启动
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Missing push gateway credential (apiKey)")]
    MissingCredential,

    #[error("Invalid option {field}: {message}")]
    InvalidOption {
        field: &'static str,
        message: String,
    },
}

/// 投递错误
///
/// 由网关原始错误分类得到，每个原始错误只对应一个变体。
/// 作为任务失败结果交给队列记录，不会向上抛出中断 worker。
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryError {
    #[error("Gateway server unavailable (status {status})")]
    ServerUnavailable { status: u16 },

    #[error("Unauthorized ({status}). Check that your API credential is correct")]
    Unauthorized { status: u16 },

    #[error("Invalid request (status {status})")]
    InvalidRequest { status: u16 },

    #[error("{message}")]
    Unknown { message: String },
}

impl DeliveryError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::ServerUnavailable { .. } => "SERVER_UNAVAILABLE",
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::InvalidRequest { .. } => "INVALID_REQUEST",
            Self::Unknown { .. } => "UNKNOWN",
        }
    }

    /// 网关返回的原始状态码（Unknown 没有状态码）
    pub fn raw_status(&self) -> Option<u16> {
        match self {
            Self::ServerUnavailable { status }
            | Self::Unauthorized { status }
            | Self::InvalidRequest { status } => Some(*status),
            Self::Unknown { .. } => None,
        }
    }

    /// 面向人的状态描述
    pub fn status_text(&self) -> &'static str {
        match self {
            Self::ServerUnavailable { .. } => "Internal Server Error",
            Self::Unauthorized { .. } => "Unauthorized",
            Self::InvalidRequest { .. } => "Invalid Request",
            Self::Unknown { .. } => "Unknown",
        }
    }

    /// 是否为网关侧的瞬时故障
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ServerUnavailable { .. })
    }
}

/// 队列协作方错误
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue is shutting down, no new jobs accepted")]
    ShuttingDown,

    #[error("Queue {queue} already has a registered worker")]
    AlreadyProcessing { queue: String },

    #[error("Invalid concurrency {0}, must be positive")]
    InvalidConcurrency(usize),

    #[error("Shutdown timed out after {timeout:?}, in-flight jobs abandoned")]
    ShutdownTimeout { timeout: Duration },

    #[error("Queue operation failed: {0}")]
    OperationFailed(String),
}

/// 推送传输的顶层错误
#[derive(Debug, Error)]
pub enum PushError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("Gateway client initialization failed: {0}")]
    Gateway(String),

    #[error("Push transport has been stopped")]
    Stopped,
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, PushError>;

impl PushError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::InvalidMessage(_) => "INVALID_MESSAGE",
            Self::Queue(QueueError::ShutdownTimeout { .. }) => "SHUTDOWN_TIMEOUT",
            Self::Queue(_) => "QUEUE_ERROR",
            Self::Delivery(e) => e.code(),
            Self::Gateway(_) => "GATEWAY_ERROR",
            Self::Stopped => "STOPPED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_error_display() {
        let err = DeliveryError::ServerUnavailable { status: 503 };
        assert_eq!(err.to_string(), "Gateway server unavailable (status 503)");

        let err = DeliveryError::Unauthorized { status: 401 };
        assert!(err.to_string().contains("API credential is correct"));

        let err = DeliveryError::Unknown {
            message: "weird".to_string(),
        };
        assert_eq!(err.to_string(), "weird");
    }

    #[test]
    fn test_delivery_error_code_and_status() {
        let err = DeliveryError::InvalidRequest { status: 400 };
        assert_eq!(err.code(), "INVALID_REQUEST");
        assert_eq!(err.raw_status(), Some(400));
        assert_eq!(err.status_text(), "Invalid Request");
        assert!(!err.is_transient());

        let err = DeliveryError::Unknown {
            message: "socket hang up".to_string(),
        };
        assert_eq!(err.raw_status(), None);

        assert!(DeliveryError::ServerUnavailable { status: 502 }.is_transient());
    }

    #[test]
    fn test_delivery_error_serialization() {
        let err = DeliveryError::Unauthorized { status: 401 };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "unauthorized");
        assert_eq!(json["status"], 401);
    }

    #[test]
    fn test_push_error_code() {
        let err: PushError = ConfigurationError::MissingCredential.into();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
        assert_eq!(err.to_string(), "Missing push gateway credential (apiKey)");

        let err: PushError = QueueError::ShutdownTimeout {
            timeout: Duration::from_millis(5000),
        }
        .into();
        assert_eq!(err.code(), "SHUTDOWN_TIMEOUT");

        let err: PushError = DeliveryError::InvalidRequest { status: 400 }.into();
        assert_eq!(err.code(), "INVALID_REQUEST");

        assert_eq!(PushError::Stopped.code(), "STOPPED");
    }
}
