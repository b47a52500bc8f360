//! 任务队列协作方
//!
//! `JobQueue` 描述传输层对队列的全部依赖：入队、按并发上限注册消费者、
//! 以及带超时的优雅关闭。默认实现是进程内的 `InMemoryJobQueue`。

mod memory;

pub use memory::InMemoryJobQueue;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{DeliveryError, QueueError};
use crate::message::{DeliveryResult, Message};

/// 任务 ID
pub type JobId = Uuid;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
    /// 失败后等待退避结束再重新入队
    Delayed,
}

/// 一条投递任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub id: JobId,
    pub queue_name: String,
    pub message: Message,
    pub state: JobState,
    /// 已执行次数
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<DeliveryError>,
    pub result: Option<DeliveryResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryJob {
    pub fn new(queue_name: impl Into<String>, message: Message, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            queue_name: queue_name.into(),
            message,
            state: JobState::Queued,
            attempts: 0,
            max_attempts,
            last_error: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn transition(&mut self, state: JobState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}

/// 队列事件，供调用方观察任务完成情况
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Enqueued { id: JobId, queue: String },
    Started { id: JobId, attempt: u32 },
    Completed { id: JobId, result: DeliveryResult },
    Retrying { id: JobId, attempt: u32, delay: Duration },
    Failed { id: JobId, error: DeliveryError },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Enqueued { id, .. }
            | Self::Started { id, .. }
            | Self::Completed { id, .. }
            | Self::Retrying { id, .. }
            | Self::Failed { id, .. } => *id,
        }
    }
}

/// 各状态的任务数量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub queued: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
}

/// 默认最多保留的已结束任务数
pub const DEFAULT_MAX_FINISHED_JOBS: usize = 1000;

/// 已结束任务的保留策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// 任务完成后立即移除，失败的任务仍按上限保留
    pub remove_on_complete: bool,
    /// 最多保留的已结束任务数，超出时淘汰最早结束的
    pub max_finished: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            remove_on_complete: false,
            max_finished: DEFAULT_MAX_FINISHED_JOBS,
        }
    }
}

impl RetentionPolicy {
    /// 从透传的队列选项中读取，缺失或类型不符的键取默认值
    pub fn from_options(options: &Map<String, Value>) -> Self {
        let defaults = Self::default();
        let lookup = |keys: &[&str]| keys.iter().find_map(|key| options.get(*key));

        Self {
            remove_on_complete: lookup(&["remove_on_complete", "removeOnComplete"])
                .and_then(Value::as_bool)
                .unwrap_or(defaults.remove_on_complete),
            max_finished: lookup(&["max_finished_jobs", "maxFinishedJobs"])
                .and_then(Value::as_u64)
                .and_then(|n| usize::try_from(n).ok())
                .unwrap_or(defaults.max_finished),
        }
    }
}

/// 任务处理函数
///
/// 每个任务调用一次，返回值即任务的完成信号：Ok 标记完成，Err 标记失败。
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &DeliveryJob) -> Result<DeliveryResult, DeliveryError>;
}

/// 任务队列
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// 把消息包装成任务写入指定队列
    async fn enqueue(&self, queue_name: &str, message: Message) -> Result<JobId, QueueError>;

    /// 注册消费者，同一时刻最多 `concurrency` 个任务在执行
    ///
    /// 每个队列只能注册一次。
    fn process(
        &self,
        queue_name: &str,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), QueueError>;

    /// 停止接收新任务，并在 `timeout` 内等待在途任务完成
    ///
    /// 超时返回 `QueueError::ShutdownTimeout`，此时未完成的任务已被放弃。
    async fn shutdown(&self, timeout: Duration) -> Result<(), QueueError>;

    fn is_shutting_down(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_retention_defaults() {
        let policy = RetentionPolicy::from_options(&Map::new());
        assert_eq!(policy, RetentionPolicy::default());
        assert_eq!(policy.max_finished, DEFAULT_MAX_FINISHED_JOBS);
        assert!(!policy.remove_on_complete);
    }

    #[test]
    fn test_retention_from_camel_and_snake_keys() {
        let camel = RetentionPolicy::from_options(&options(
            json!({ "removeOnComplete": true, "maxFinishedJobs": 25 }),
        ));
        assert!(camel.remove_on_complete);
        assert_eq!(camel.max_finished, 25);

        let snake = RetentionPolicy::from_options(&options(
            json!({ "remove_on_complete": true, "max_finished_jobs": 7 }),
        ));
        assert!(snake.remove_on_complete);
        assert_eq!(snake.max_finished, 7);
    }

    #[test]
    fn test_retention_ignores_mistyped_values() {
        let policy = RetentionPolicy::from_options(&options(
            json!({ "removeOnComplete": "yes", "maxFinishedJobs": -3 }),
        ));
        assert_eq!(policy, RetentionPolicy::default());
    }
}
