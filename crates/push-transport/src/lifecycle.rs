//! 生命周期控制
//!
//! 状态机：Uninitialized -> Initializing -> Ready -> ShuttingDown -> Stopped。
//! 网关客户端与队列连接只在首次 init 时构造一次，之后通过 `TransportContext`
//! 显式传给分发器，不依赖进程级全局变量。

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::signal;
use tracing::{debug, error, info, warn};

use crate::QUEUE_NAME;
use crate::config::{Configuration, PushOptions, resolve};
use crate::dispatcher::Dispatcher;
use crate::error::{PushError, QueueError};
use crate::gateway::{FcmClient, GatewayClient};
use crate::message::{DeliveryResult, Message};
use crate::queue::{InMemoryJobQueue, JobId, JobQueue};

/// 根据配置构造网关客户端
pub type GatewayFactory =
    Arc<dyn Fn(&Configuration) -> Result<Arc<dyn GatewayClient>, PushError> + Send + Sync>;

/// 根据配置构造队列连接
pub type QueueFactory =
    Arc<dyn Fn(&Configuration) -> Result<Arc<dyn JobQueue>, PushError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Ready,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// init 之后共享的只读上下文
pub struct TransportContext {
    pub config: Configuration,
    pub gateway: Arc<dyn GatewayClient>,
    pub queue: Arc<dyn JobQueue>,
}

struct State {
    lifecycle: LifecycleState,
    context: Option<Arc<TransportContext>>,
    consuming: bool,
}

/// 推送传输
pub struct PushTransport {
    options: PushOptions,
    gateway_factory: GatewayFactory,
    queue_factory: QueueFactory,
    handle_signals: bool,
    state: Mutex<State>,
}

pub struct PushTransportBuilder {
    options: PushOptions,
    gateway_factory: Option<GatewayFactory>,
    queue_factory: Option<QueueFactory>,
    handle_signals: bool,
}

impl PushTransportBuilder {
    /// 替换网关客户端的构造方式（默认 FCM）
    pub fn gateway_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&Configuration) -> Result<Arc<dyn GatewayClient>, PushError> + Send + Sync + 'static,
    {
        self.gateway_factory = Some(Arc::new(factory));
        self
    }

    /// 替换队列连接的构造方式（默认进程内队列）
    pub fn queue_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&Configuration) -> Result<Arc<dyn JobQueue>, PushError> + Send + Sync + 'static,
    {
        self.queue_factory = Some(Arc::new(factory));
        self
    }

    /// 是否在 start 时安装终止信号处理（默认开启）
    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    pub fn build(self) -> Arc<PushTransport> {
        let gateway_factory: GatewayFactory = match self.gateway_factory {
            Some(factory) => factory,
            None => Arc::new(
                |config: &Configuration| -> Result<Arc<dyn GatewayClient>, PushError> {
                    Ok(Arc::new(FcmClient::new(config)?) as Arc<dyn GatewayClient>)
                },
            ),
        };
        let queue_factory: QueueFactory = match self.queue_factory {
            Some(factory) => factory,
            None => Arc::new(
                |config: &Configuration| -> Result<Arc<dyn JobQueue>, PushError> {
                    let queue = InMemoryJobQueue::with_retention(
                        config.retry_policy(),
                        config.retention_policy(),
                    );
                    Ok(Arc::new(queue) as Arc<dyn JobQueue>)
                },
            ),
        };

        Arc::new(PushTransport {
            options: self.options,
            gateway_factory,
            queue_factory,
            handle_signals: self.handle_signals,
            state: Mutex::new(State {
                lifecycle: LifecycleState::Uninitialized,
                context: None,
                consuming: false,
            }),
        })
    }
}

impl PushTransport {
    pub fn builder(options: PushOptions) -> PushTransportBuilder {
        PushTransportBuilder {
            options,
            gateway_factory: None,
            queue_factory: None,
            handle_signals: true,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state.lock().lifecycle
    }

    /// 初始化，幂等
    ///
    /// 构造过程在锁内完成，并发调用者会等待首次构造结束并拿到同一个上下文。
    /// 配置错误时回到 Uninitialized，可修正后重试。
    pub fn init(&self) -> Result<Arc<TransportContext>, PushError> {
        let mut state = self.state.lock();

        match state.lifecycle {
            LifecycleState::ShuttingDown | LifecycleState::Stopped => {
                return Err(PushError::Stopped);
            }
            LifecycleState::Ready | LifecycleState::Initializing => {
                if let Some(context) = &state.context {
                    return Ok(Arc::clone(context));
                }
            }
            LifecycleState::Uninitialized => {}
        }

        state.lifecycle = LifecycleState::Initializing;
        match self.build_context() {
            Ok(context) => {
                state.context = Some(Arc::clone(&context));
                state.lifecycle = LifecycleState::Ready;
                info!(
                    concurrency = context.config.concurrency,
                    timeout_ms = context.config.timeout.as_millis() as u64,
                    sender = %context.config.default_sender,
                    "推送传输初始化完成"
                );
                Ok(context)
            }
            Err(e) => {
                state.lifecycle = LifecycleState::Uninitialized;
                error!(code = e.code(), error = %e, "推送传输初始化失败");
                Err(e)
            }
        }
    }

    fn build_context(&self) -> Result<Arc<TransportContext>, PushError> {
        let config = resolve(&self.options)?;
        debug!(config = ?config, "配置解析完成");

        let gateway = (self.gateway_factory)(&config)?;
        let queue = (self.queue_factory)(&config)?;

        Ok(Arc::new(TransportContext {
            config,
            gateway,
            queue,
        }))
    }

    /// 开始消费推送队列
    ///
    /// 只注册一次消费者；重复调用直接返回。
    pub async fn start(self: &Arc<Self>) -> Result<(), PushError> {
        let context = self.init()?;

        {
            let mut state = self.state.lock();
            if state.consuming {
                debug!("推送队列消费者已注册，跳过");
                return Ok(());
            }

            let dispatcher = Dispatcher::new(Arc::clone(&context));
            context
                .queue
                .process(QUEUE_NAME, context.config.concurrency, Arc::new(dispatcher))?;
            state.consuming = true;
        }

        info!(
            queue = QUEUE_NAME,
            concurrency = context.config.concurrency,
            "推送传输已启动"
        );

        if self.handle_signals {
            let transport = Arc::clone(self);
            tokio::spawn(async move {
                shutdown_signal().await;
                transport.stop().await;
                info!("推送传输已停止，进程退出");
                std::process::exit(0);
            });
        }

        Ok(())
    }

    /// 优雅关闭，幂等
    ///
    /// 在 `timeout` 内等待在途任务完成；超时只记录告警，不返回错误。
    pub async fn stop(&self) {
        let context = {
            let mut state = self.state.lock();
            match state.lifecycle {
                LifecycleState::ShuttingDown | LifecycleState::Stopped => {
                    debug!(state = %state.lifecycle, "推送传输已在关闭，忽略重复 stop");
                    return;
                }
                LifecycleState::Uninitialized | LifecycleState::Initializing => {
                    state.lifecycle = LifecycleState::Stopped;
                    info!("推送传输未初始化，直接停止");
                    return;
                }
                LifecycleState::Ready => {
                    state.lifecycle = LifecycleState::ShuttingDown;
                    state.context.clone()
                }
            }
        };

        if let Some(context) = context {
            info!(
                timeout_ms = context.config.timeout.as_millis() as u64,
                "推送传输开始优雅关闭"
            );
            match context.queue.shutdown(context.config.timeout).await {
                Ok(()) => info!("在途任务已全部完成"),
                Err(QueueError::ShutdownTimeout { timeout }) => {
                    warn!(timeout_ms = timeout.as_millis() as u64, "关闭超时，放弃未完成任务");
                }
                Err(e) => warn!(error = %e, "队列关闭出错"),
            }
        }

        self.state.lock().lifecycle = LifecycleState::Stopped;
        info!("推送传输已停止");
    }

    /// 入队一条消息（需要时先 init）
    pub async fn enqueue(&self, message: &mut Message) -> Result<JobId, PushError> {
        let context = self.init()?;
        Dispatcher::new(context).enqueue(message).await
    }

    /// 直接投递一条消息，不经过队列
    pub async fn send(&self, message: &Message) -> Result<DeliveryResult, PushError> {
        let context = self.init()?;
        Ok(Dispatcher::new(context).send(message).await?)
    }
}

/// 等待 Ctrl+C 或 SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "无法监听 Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "无法监听 SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到 Ctrl+C，开始优雅关闭");
        }
        _ = terminate => {
            info!("收到 SIGTERM，开始优雅关闭");
        }
    }
}
