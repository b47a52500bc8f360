//! 推送网关客户端抽象
//!
//! `GatewayClient` 只负责把载荷送到网关并带回原始响应或原始错误，
//! 不做任何分类。分类统一由 `normalizer` 完成，方便替换网关实现和测试。

mod fcm;

pub use fcm::FcmClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 网关请求载荷（不含接收方）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayPayload {
    /// 透传的网关消息选项（priority、collapse_key ...）
    #[serde(flatten)]
    pub options: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    pub notification: Map<String, Value>,
}

/// 接收方：单个 token 直接发送，多个走批量
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipients {
    Single(String),
    Multiple(Vec<String>),
}

impl Recipients {
    /// 按数量选择单发或批量；空列表返回 None
    pub fn from_slice(recipients: &[String]) -> Option<Self> {
        match recipients {
            [] => None,
            [single] => Some(Self::Single(single.clone())),
            many => Some(Self::Multiple(many.to_vec())),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Multiple(tokens) => tokens.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 网关原始响应
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// 逐个接收方的结果，顺序与请求一致
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<Map<String, Value>>>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// 网关原始错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawGatewayError {
    /// 网关返回了 HTTP 状态码
    Status(u16),
    /// 没有状态码的失败（网络错误、响应无法解析等）
    Other(String),
}

impl std::fmt::Display for RawGatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status(code) => write!(f, "gateway responded with status {}", code),
            Self::Other(message) => f.write_str(message),
        }
    }
}

/// 推送网关客户端
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// 发送一次推送请求
    async fn send(
        &self,
        payload: &GatewayPayload,
        to: &Recipients,
    ) -> Result<RawResponse, RawGatewayError>;
}
