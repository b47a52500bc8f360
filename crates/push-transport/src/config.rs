//! 配置解析
//!
//! 调用方选项覆盖内置默认值，生成不可变的 `Configuration` 快照。
//! 网关凭据是唯一没有默认值的必填项，缺失时无法投递。

use std::fmt;
use std::time::Duration;

use push_shared::config::ConfigError;
use push_shared::observability::ObservabilityConfig;
use push_shared::retry::RetryPolicy;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::SERVICE_NAME;
use crate::error::ConfigurationError;
use crate::queue::RetentionPolicy;

/// 默认优雅关闭超时（毫秒）
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
/// 默认并发数
pub const DEFAULT_CONCURRENCY: usize = 10;
/// 默认发送方
pub const DEFAULT_SENDER: &str = "open311";
/// FCM legacy HTTP 端点
pub const DEFAULT_ENDPOINT: &str = "https://fcm.googleapis.com/fcm/send";
/// 默认单次网关请求超时（毫秒）
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
/// 默认重试退避起点（毫秒）
pub const DEFAULT_BACKOFF_MS: u64 = 1000;

/// 调用方提供的选项，全部可选
///
/// 同时接受 snake_case（配置文件、环境变量）与原有的 camelCase 名称。
/// 未识别的键原样保留，交给队列协作方使用。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushOptions {
    #[serde(
        default,
        alias = "api_key",
        alias = "apiKey",
        alias = "gatewayCredential"
    )]
    pub gateway_credential: Option<String>,

    /// 优雅关闭超时（毫秒）
    #[serde(default)]
    pub timeout: Option<u64>,

    #[serde(default)]
    pub concurrency: Option<usize>,

    #[serde(default, alias = "from", alias = "defaultSender")]
    pub default_sender: Option<String>,

    #[serde(default)]
    pub endpoint: Option<String>,

    /// 单次网关请求超时（毫秒）
    #[serde(default, alias = "requestTimeout")]
    pub request_timeout: Option<u64>,

    /// 每个任务最多执行次数
    #[serde(default)]
    pub attempts: Option<u32>,

    /// 重试退避起点（毫秒）
    #[serde(default)]
    pub backoff: Option<u64>,

    #[serde(flatten)]
    pub queue: Map<String, Value>,
}

impl PushOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.gateway_credential = Some(api_key.into());
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.default_sender = Some(sender.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_attempts(mut self, attempts: u32, backoff_ms: u64) -> Self {
        self.attempts = Some(attempts);
        self.backoff = Some(backoff_ms);
        self
    }
}

/// 解析后的不可变配置
#[derive(Clone, PartialEq)]
pub struct Configuration {
    /// 优雅关闭时等待在途任务的上限
    pub timeout: Duration,
    /// 同时执行的投递任务上限
    pub concurrency: usize,
    pub default_sender: String,
    pub gateway_credential: String,
    pub endpoint: String,
    pub request_timeout: Duration,
    pub attempts: u32,
    pub backoff: Duration,
    /// 透传给队列协作方的其余选项
    pub queue_options: Map<String, Value>,
}

// 凭据不进日志
impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("timeout", &self.timeout)
            .field("concurrency", &self.concurrency)
            .field("default_sender", &self.default_sender)
            .field("gateway_credential", &"***")
            .field("endpoint", &self.endpoint)
            .field("request_timeout", &self.request_timeout)
            .field("attempts", &self.attempts)
            .field("backoff", &self.backoff)
            .field("queue_options", &self.queue_options)
            .finish()
    }
}

impl Configuration {
    /// 队列对失败任务的重试策略
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_attempts(self.attempts, self.backoff)
    }

    /// 已结束任务的保留策略，取自透传的队列选项
    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy::from_options(&self.queue_options)
    }
}

/// 合并调用方选项与默认值
///
/// 纯函数，没有副作用。
pub fn resolve(options: &PushOptions) -> Result<Configuration, ConfigurationError> {
    let gateway_credential = options
        .gateway_credential
        .as_deref()
        .map(str::trim)
        .filter(|credential| !credential.is_empty())
        .ok_or(ConfigurationError::MissingCredential)?
        .to_string();

    let concurrency = options.concurrency.unwrap_or(DEFAULT_CONCURRENCY);
    if concurrency == 0 {
        return Err(ConfigurationError::InvalidOption {
            field: "concurrency",
            message: "must be a positive integer".to_string(),
        });
    }

    let attempts = options.attempts.unwrap_or(1);
    if attempts == 0 {
        return Err(ConfigurationError::InvalidOption {
            field: "attempts",
            message: "must be a positive integer".to_string(),
        });
    }

    let default_sender = options
        .default_sender
        .clone()
        .filter(|sender| !sender.is_empty())
        .unwrap_or_else(|| DEFAULT_SENDER.to_string());

    Ok(Configuration {
        timeout: Duration::from_millis(options.timeout.unwrap_or(DEFAULT_TIMEOUT_MS)),
        concurrency,
        default_sender,
        gateway_credential,
        endpoint: options
            .endpoint
            .clone()
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
        request_timeout: Duration::from_millis(
            options.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
        ),
        attempts,
        backoff: Duration::from_millis(options.backoff.unwrap_or(DEFAULT_BACKOFF_MS)),
        queue_options: options.queue.clone(),
    })
}

/// 进程级配置：推送选项与可观测性配置
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    #[serde(default)]
    pub push: PushOptions,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从 config/ 目录与 OPEN311_ 环境变量加载
    pub fn load() -> Result<Self, ConfigError> {
        push_shared::config::load(SERVICE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_defaults() {
        let config = resolve(&PushOptions::new().with_api_key("k")).unwrap();

        assert_eq!(config.timeout, Duration::from_millis(5000));
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.default_sender, "open311");
        assert_eq!(config.gateway_credential, "k");
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.attempts, 1);
        assert_eq!(config.retry_policy().max_attempts(), 1);
    }

    #[test]
    fn test_resolve_user_options_win() {
        let options = PushOptions::new()
            .with_api_key("secret")
            .with_timeout(250)
            .with_concurrency(3)
            .with_sender("city-council")
            .with_attempts(4, 20);

        let config = resolve(&options).unwrap();
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.default_sender, "city-council");
        assert_eq!(config.attempts, 4);
        assert_eq!(config.backoff, Duration::from_millis(20));
    }

    #[test]
    fn test_resolve_missing_credential() {
        assert_eq!(
            resolve(&PushOptions::new()),
            Err(ConfigurationError::MissingCredential)
        );
        assert_eq!(
            resolve(&PushOptions::new().with_api_key("   ")),
            Err(ConfigurationError::MissingCredential)
        );
    }

    #[test]
    fn test_resolve_rejects_zero_concurrency() {
        let result = resolve(&PushOptions::new().with_api_key("k").with_concurrency(0));
        assert!(matches!(
            result,
            Err(ConfigurationError::InvalidOption {
                field: "concurrency",
                ..
            })
        ));
    }

    #[test]
    fn test_options_accept_original_names() {
        let options: PushOptions = serde_json::from_value(json!({
            "apiKey": "abc",
            "from": "sender@example.com",
            "timeout": 1000,
            "redis": { "host": "localhost" }
        }))
        .unwrap();

        assert_eq!(options.gateway_credential.as_deref(), Some("abc"));
        assert_eq!(options.default_sender.as_deref(), Some("sender@example.com"));
        assert_eq!(options.timeout, Some(1000));
        assert_eq!(options.queue["redis"]["host"], "localhost");

        let config = resolve(&options).unwrap();
        assert!(config.queue_options.contains_key("redis"));
    }

    #[test]
    fn test_retention_read_from_queue_options() {
        let options: PushOptions = serde_json::from_value(json!({
            "apiKey": "abc",
            "removeOnComplete": true,
            "maxFinishedJobs": 50
        }))
        .unwrap();

        let retention = resolve(&options).unwrap().retention_policy();
        assert!(retention.remove_on_complete);
        assert_eq!(retention.max_finished, 50);

        let defaults = resolve(&PushOptions::new().with_api_key("abc"))
            .unwrap()
            .retention_policy();
        assert_eq!(defaults, RetentionPolicy::default());
    }

    #[test]
    fn test_debug_redacts_credential() {
        let config = resolve(&PushOptions::new().with_api_key("very-secret")).unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("very-secret"));
    }
}
