//! Open311 推送传输
//!
//! 把通知消息写入推送队列，由有并发上限的 worker 池取出后经推送网关（FCM）投递，
//! 网关的原始响应统一归一化为 `DeliveryResult` / `DeliveryError`。
//! 生命周期由 `PushTransport` 管理：init 幂等，stop 在超时内优雅排空在途任务。

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod message;
pub mod normalizer;
pub mod queue;

/// 写入消息 transport_name 的传输名
pub const TRANSPORT_NAME: &str = "open311-push";
/// 推送队列名
pub const QUEUE_NAME: &str = "push";
/// 服务名，用于配置文件与日志
pub const SERVICE_NAME: &str = "open311-push";

pub use config::{Configuration, PushOptions, resolve};
pub use dispatcher::Dispatcher;
pub use error::{ConfigurationError, DeliveryError, PushError, QueueError, Result};
pub use gateway::{
    FcmClient, GatewayClient, GatewayPayload, RawGatewayError, RawResponse, Recipients,
};
pub use lifecycle::{LifecycleState, PushTransport, TransportContext};
pub use message::{DeliveryOptions, DeliveryResult, DeliveryStatus, Message, RecipientResult};
pub use normalizer::normalize;
pub use queue::{
    DeliveryJob, InMemoryJobQueue, JobEvent, JobHandler, JobId, JobQueue, JobState, RetentionPolicy,
};
