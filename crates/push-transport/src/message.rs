//! 消息与投递结果
//!
//! `Message` 由外部消息存储持有，本模块只读写其中几个字段：
//! 入队时打上传输名/队列名，并在缺省时补上发送方。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// 待投递的通知消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    /// 设备 token 或其他接收方地址，有序且非空
    #[serde(alias = "to")]
    pub recipients: Vec<String>,
    #[serde(default, alias = "from")]
    pub sender: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
    #[serde(default, alias = "options")]
    pub delivery_options: DeliveryOptions,
    #[serde(default, alias = "transport")]
    pub transport_name: Option<String>,
    #[serde(default)]
    pub queue_name: Option<String>,
}

impl Message {
    pub fn new<I, S>(recipients: I, body: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: Uuid::now_v7(),
            recipients: recipients.into_iter().map(Into::into).collect(),
            sender: None,
            subject: None,
            body: body.into(),
            delivery_options: DeliveryOptions::default(),
            transport_name: None,
            queue_name: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_options(mut self, options: DeliveryOptions) -> Self {
        self.delivery_options = options;
        self
    }

    /// 是否只模拟发送
    pub fn is_fake(&self) -> bool {
        self.delivery_options.fake
    }
}

/// 消息附带的投递选项
///
/// `data` 与 `notification` 合并进网关载荷；其余键按网关消息选项原样透传
/// （如 priority、collapse_key、time_to_live）。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryOptions {
    #[serde(default)]
    pub fake: bool,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub notification: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeliveryOptions {
    /// 模拟发送，不访问网关
    pub fn fake() -> Self {
        Self {
            fake: true,
            ..Self::default()
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_notification(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.notification.insert(key.into(), value.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// 投递状态（目前只有成功，失败走 `DeliveryError`）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Success,
}

/// 归一化后的投递结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResult {
    pub status: DeliveryStatus,
    pub provider_message: String,
    /// 与 recipients 按位置一一对应；网关未返回逐个结果时为空
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub per_recipient: Vec<RecipientResult>,
    /// 网关响应中的其余字段（multicast_id、success、failure ...）
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl DeliveryResult {
    pub const DEFAULT_PROVIDER_MESSAGE: &'static str = "success";

    /// 不带网关细节的成功结果
    pub fn success() -> Self {
        Self {
            status: DeliveryStatus::Success,
            provider_message: Self::DEFAULT_PROVIDER_MESSAGE.to_string(),
            per_recipient: Vec::new(),
            details: Map::new(),
        }
    }
}

/// 单个接收方的网关结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientResult {
    pub to: String,
    #[serde(flatten)]
    pub detail: Map<String, Value>,
}
