//! 消息分发
//!
//! 入队时只打标签并写一次队列，不访问网关；真正的投递在 worker 调用
//! `send` 时发生。`Dispatcher` 同时是队列的任务处理函数。

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use push_shared::observability::metrics;
use tracing::{debug, info, warn};

use crate::error::{DeliveryError, PushError};
use crate::gateway::{GatewayPayload, Recipients};
use crate::lifecycle::TransportContext;
use crate::message::{DeliveryResult, Message};
use crate::normalizer::normalize;
use crate::queue::{DeliveryJob, JobHandler, JobId};
use crate::{QUEUE_NAME, TRANSPORT_NAME};

#[derive(Clone)]
pub struct Dispatcher {
    context: Arc<TransportContext>,
}

impl Dispatcher {
    pub fn new(context: Arc<TransportContext>) -> Self {
        Self { context }
    }

    /// 给消息打上路由标签并写入推送队列
    ///
    /// 只修改 transport_name、queue_name，以及缺省时的 sender。
    pub async fn enqueue(&self, message: &mut Message) -> Result<JobId, PushError> {
        if message.recipients.is_empty() {
            return Err(PushError::InvalidMessage(
                "message must have at least one recipient".to_string(),
            ));
        }

        message.transport_name = Some(TRANSPORT_NAME.to_string());
        message.queue_name = Some(QUEUE_NAME.to_string());
        if message.sender.as_deref().is_none_or(str::is_empty) {
            message.sender = Some(self.context.config.default_sender.clone());
        }

        let job_id = self
            .context
            .queue
            .enqueue(QUEUE_NAME, message.clone())
            .await?;

        debug!(
            job_id = %job_id,
            message_id = %message.id,
            recipients = message.recipients.len(),
            "推送消息已入队"
        );
        Ok(job_id)
    }

    /// 直接投递一条消息
    ///
    /// 投递错误只通过返回值传出，不会 panic 或中断调用方。
    pub async fn send(&self, message: &Message) -> Result<DeliveryResult, DeliveryError> {
        if message.is_fake() {
            info!(message_id = %message.id, "模拟发送，跳过网关");
            return Ok(DeliveryResult::success());
        }

        let Some(to) = Recipients::from_slice(&message.recipients) else {
            return Err(DeliveryError::Unknown {
                message: "message has no recipients".to_string(),
            });
        };

        let payload = build_payload(message);
        let started = Instant::now();

        let (raw_error, raw_response) = match self.context.gateway.send(&payload, &to).await {
            Ok(response) => (None, Some(response)),
            Err(error) => (Some(error), None),
        };
        let outcome = normalize(raw_error, raw_response, &message.recipients);
        let elapsed = started.elapsed().as_secs_f64();

        match &outcome {
            Ok(result) => {
                metrics::record_push_delivery("success", None, elapsed);
                info!(
                    message_id = %message.id,
                    recipients = message.recipients.len(),
                    provider_message = %result.provider_message,
                    "推送投递成功"
                );
            }
            Err(error) => {
                metrics::record_push_delivery("failed", Some(error.code()), elapsed);
                warn!(
                    message_id = %message.id,
                    code = error.code(),
                    status = ?error.raw_status(),
                    error = %error,
                    "推送投递失败"
                );
            }
        }

        outcome
    }
}

#[async_trait]
impl JobHandler for Dispatcher {
    async fn handle(&self, job: &DeliveryJob) -> Result<DeliveryResult, DeliveryError> {
        self.send(&job.message).await
    }
}

/// 组装网关载荷
///
/// subject/body 覆盖 notification 提示中的同名键；其余投递选项原样透传。
pub fn build_payload(message: &Message) -> GatewayPayload {
    let options = &message.delivery_options;

    let mut notification = options.notification.clone();
    if let Some(subject) = &message.subject {
        notification.insert("title".to_string(), subject.clone().into());
    }
    notification.insert("body".to_string(), message.body.clone().into());

    GatewayPayload {
        options: options.extra.clone(),
        data: (!options.data.is_empty()).then(|| options.data.clone()),
        notification,
    }
}
