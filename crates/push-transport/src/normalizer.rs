//! 网关结果归一化
//!
//! 把网关原始响应/原始错误转换为统一的 `DeliveryResult` 或分类后的 `DeliveryError`。
//! 纯函数，不做 I/O。

use serde_json::Value;

use crate::error::DeliveryError;
use crate::gateway::{RawGatewayError, RawResponse};
use crate::message::{DeliveryResult, DeliveryStatus, RecipientResult};

/// 按状态码分类
///
/// 顺序有意义：网关在重叠区间复用状态码，先判 5xx，再单独挑出 401，
/// 其余 ≤500 的非 200 状态都视为请求无效。200 不是错误，返回 None。
pub fn classify_status(status: u16) -> Option<DeliveryError> {
    if status >= 500 {
        Some(DeliveryError::ServerUnavailable { status })
    } else if status == 401 {
        Some(DeliveryError::Unauthorized { status })
    } else if status != 200 {
        Some(DeliveryError::InvalidRequest { status })
    } else {
        None
    }
}

/// 分类原始错误；None 表示应走成功路径
pub fn classify(raw_error: &RawGatewayError) -> Option<DeliveryError> {
    match raw_error {
        RawGatewayError::Status(status) => classify_status(*status),
        RawGatewayError::Other(message) => Some(DeliveryError::Unknown {
            message: message.clone(),
        }),
    }
}

/// 归一化一次网关调用的结果
///
/// 网关返回逐个结果时按下标与 `recipients` 对齐；条目缺失的接收方只保留 `to`，
/// 多出来的条目丢弃，因此 `per_recipient` 长度总等于 `recipients` 长度。
pub fn normalize(
    raw_error: Option<RawGatewayError>,
    raw_response: Option<RawResponse>,
    recipients: &[String],
) -> Result<DeliveryResult, DeliveryError> {
    if let Some(error) = raw_error.as_ref().and_then(classify) {
        return Err(error);
    }

    let Some(response) = raw_response else {
        return Ok(DeliveryResult::success());
    };

    let per_recipient = match response.results {
        Some(results) => {
            let mut results = results.into_iter();
            recipients
                .iter()
                .map(|to| {
                    let mut detail = results.next().unwrap_or_default();
                    // 接收方以 recipients 为准
                    detail.remove("to");
                    RecipientResult {
                        to: to.clone(),
                        detail,
                    }
                })
                .collect()
        }
        None => Vec::new(),
    };

    let mut details = response.rest;
    // 这些键已经有了专门的字段
    details.remove("status");
    details.remove("providerMessage");
    details.remove("perRecipient");

    Ok(DeliveryResult {
        status: DeliveryStatus::Success,
        provider_message: response
            .message
            .unwrap_or_else(|| DeliveryResult::DEFAULT_PROVIDER_MESSAGE.to_string()),
        per_recipient,
        details: details
            .into_iter()
            .filter(|(_, value)| !value.is_null())
            .collect::<serde_json::Map<String, Value>>(),
    })
}
