use crate::relay::RelayConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayOptions,
    /// 初始路由表；运行期可通过 resolver 钩子增删
    #[serde(default)]
    pub routes: Vec<RouteRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址 (例如: "0.0.0.0:443")
    pub listen_addr: SocketAddr,
    /// 日志级别: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// 日志格式: json, pretty
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayOptions {
    /// 会话空闲超时(秒)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// 会话清理间隔(秒)
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    /// 是否记录每个被丢弃 datagram 的原因
    #[serde(default)]
    pub log_requests: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    /// SNI 模式 (支持通配符, 如 "*.example.com")
    pub sni: String,
    /// 后端地址
    pub target: SocketAddr,
}

// 默认值函数
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_cleanup_interval() -> u64 {
    30
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            cleanup_interval_secs: default_cleanup_interval(),
            log_requests: false,
        }
    }
}

impl RelayOptions {
    pub fn to_relay_config(&self) -> RelayConfig {
        RelayConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            log_requests: self.log_requests,
        }
    }
}

impl Config {
    /// 从文件加载配置
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        Ok(config)
    }

    /// 保存配置到文件
    pub fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path))?;

        Ok(())
    }
}
