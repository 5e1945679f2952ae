use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use snirelay::resolver::{ResolverChain, RouteResolver, StaticResolver};
use snirelay::{Config, Relay};

#[tokio::main]
async fn main() -> Result<()> {
    // 加载配置
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = Config::load(&config_path)?;

    // 初始化日志系统
    init_logging(&config.server.log_level, &config.server.log_format);

    info!("Starting snirelay...");
    info!("Configuration loaded from {}", config_path);

    // 构建路由：静态表加载配置里的初始路由，外部组件可在运行期
    // 通过 update_route / remove_route 钩子继续写入
    let static_resolver = Arc::new(StaticResolver::new());
    for route in &config.routes {
        static_resolver.update_route(&route.sni, route.target);
        info!("Loaded route from config: {} -> {}", route.sni, route.target);
    }

    let resolver: Arc<dyn RouteResolver> = Arc::new(ResolverChain::new(vec![
        static_resolver.clone() as Arc<dyn RouteResolver>,
    ]));

    // 启动中继
    let relay = Arc::new(
        Relay::bind(
            config.server.listen_addr,
            resolver,
            config.relay.to_relay_config(),
        )
        .await?,
    );
    let shutdown = relay.shutdown_handle();

    let mut relay_handle = tokio::spawn(relay.run());

    // 等待 SIGINT 或中继自身退出
    tokio::select! {
        result = &mut relay_handle => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Relay error: {}", e),
                Err(e) => error!("Relay task failed: {}", e),
            }
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down snirelay...");
            let _ = shutdown.send(());
        }
    }

    match relay_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Relay error: {}", e),
        Err(e) => error!("Relay task failed: {}", e),
    }

    Ok(())
}

/// 初始化日志系统
fn init_logging(log_level: &str, log_format: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_thread_ids(true))
            .init();
    }
}
