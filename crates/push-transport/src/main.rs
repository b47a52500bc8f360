//! 推送传输服务
//!
//! 加载配置、初始化日志与指标后开始消费推送队列，收到终止信号时优雅退出。

use anyhow::Context;
use open311_push::config::AppConfig;
use open311_push::{PushTransport, SERVICE_NAME};
use push_shared::config::load_dotenv;
use push_shared::observability;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    let config = AppConfig::load().context("加载配置失败")?;
    let observability_config = config.observability.clone().with_service_name(SERVICE_NAME);
    let _guard = observability::init(&observability_config).await?;

    info!(
        service = %config.service_name,
        environment = %config.environment,
        "Starting {}...",
        SERVICE_NAME
    );

    let transport = PushTransport::builder(config.push).build();
    transport.start().await?;

    // 信号处理任务负责 stop 并退出进程
    std::future::pending::<()>().await;
    Ok(())
}
