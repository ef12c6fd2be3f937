use service_discovery::config::Config;
use service_discovery::server;
use tracing_subscriber::EnvFilter;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    // RUST_LOG 优先，其次使用配置文件中的日志级别
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Starting service discovery...");
    server::start(config).await?;
    Ok(())
}
