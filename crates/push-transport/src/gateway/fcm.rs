//! FCM legacy HTTP 客户端

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::{Map, Value};
use tracing::{Instrument, debug, info_span, warn};

use super::{GatewayClient, GatewayPayload, RawGatewayError, RawResponse, Recipients};
use crate::config::Configuration;
use crate::error::PushError;

/// 通过 `https://fcm.googleapis.com/fcm/send` 发送推送
///
/// 内部 reqwest 连接池可在 worker 间共享，单个实例即可服务整个进程。
#[derive(Debug, Clone)]
pub struct FcmClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl FcmClient {
    pub fn new(config: &Configuration) -> Result<Self, PushError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| PushError::Gateway(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.gateway_credential.clone(),
        })
    }

    /// 组装请求体：载荷字段 + to / registration_ids
    fn request_body(payload: &GatewayPayload, to: &Recipients) -> Result<Value, RawGatewayError> {
        let mut body: Map<String, Value> = match serde_json::to_value(payload) {
            Ok(Value::Object(map)) => map,
            Ok(_) => Map::new(),
            Err(e) => return Err(RawGatewayError::Other(e.to_string())),
        };

        match to {
            Recipients::Single(token) => {
                body.insert("to".to_string(), Value::String(token.clone()));
            }
            Recipients::Multiple(tokens) => {
                body.insert(
                    "registration_ids".to_string(),
                    Value::Array(tokens.iter().cloned().map(Value::String).collect()),
                );
            }
        }

        Ok(Value::Object(body))
    }
}

#[async_trait]
impl GatewayClient for FcmClient {
    async fn send(
        &self,
        payload: &GatewayPayload,
        to: &Recipients,
    ) -> Result<RawResponse, RawGatewayError> {
        let body = Self::request_body(payload, to)?;
        let span = info_span!("fcm_send", recipients = to.len());

        async move {
            let response = self
                .client
                .post(&self.endpoint)
                .header(AUTHORIZATION, format!("key={}", self.api_key))
                .header(CONTENT_TYPE, "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| {
                    warn!(error = %e, "FCM 请求失败");
                    RawGatewayError::Other(e.to_string())
                })?;

            let status = response.status().as_u16();
            debug!(status, "收到 FCM 响应");

            if status != 200 {
                return Err(RawGatewayError::Status(status));
            }

            response
                .json::<RawResponse>()
                .await
                .map_err(|e| RawGatewayError::Other(format!("invalid gateway response: {e}")))
        }
        .instrument(span)
        .await
    }
}
