//! 配置管理模块
//!
//! 分层加载配置文件并允许环境变量覆盖，由各服务提供自己的强类型配置结构。

use config::{Config, Environment, File};
pub use config::ConfigError;
use serde::de::DeserializeOwned;
use std::path::PathBuf;

/// 环境变量前缀（OPEN311_PUSH__API_KEY -> push.api_key）
pub const ENV_PREFIX: &str = "OPEN311";

/// 配置来源
#[derive(Debug, Clone)]
pub struct ConfigSources {
    /// 配置文件目录
    pub config_dir: PathBuf,
    /// 运行环境（development / production ...）
    pub environment: String,
}

impl Default for ConfigSources {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("config"),
            environment: "development".to_string(),
        }
    }
}

impl ConfigSources {
    /// 从 `OPEN311_ENV` 与 `CONFIG_DIR` 环境变量解析配置来源
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            config_dir: std::env::var("CONFIG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.config_dir),
            environment: std::env::var("OPEN311_ENV").unwrap_or(defaults.environment),
        }
    }
}

/// 读取 `.env` 文件（不存在时静默忽略）
pub fn load_dotenv() {
    let _ = dotenvy::dotenv();
}

/// 按默认来源加载配置
pub fn load<T: DeserializeOwned>(service_name: &str) -> Result<T, ConfigError> {
    load_from(service_name, &ConfigSources::from_env())
}

/// 从指定来源加载配置
///
/// 加载顺序（后加载的会覆盖先加载的同名配置项）：
/// 1. {config_dir}/default.toml
/// 2. {config_dir}/{environment}.toml
/// 3. {config_dir}/{service_name}.toml
/// 4. 环境变量（OPEN311_ 前缀，`__` 表示层级）
///
/// 目标结构可以声明 `service_name` 与 `environment` 字段，二者总有默认值。
pub fn load_from<T: DeserializeOwned>(
    service_name: &str,
    sources: &ConfigSources,
) -> Result<T, ConfigError> {
    let dir = &sources.config_dir;

    let builder = Config::builder()
        .set_default("service_name", service_name)?
        .set_default("environment", sources.environment.clone())?
        .add_source(File::from(dir.join("default.toml")).required(false))
        .add_source(File::from(dir.join(format!("{}.toml", sources.environment))).required(false))
        .add_source(File::from(dir.join(format!("{}.toml", service_name))).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    builder.build()?.try_deserialize()
}
