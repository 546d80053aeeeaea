use std::process;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use sandboxd::config::Config;
use sandboxd::core::driver::BollardDriver;
use sandboxd::core::executor::Executor;
use sandboxd::core::kv::RedisKvDirectory;
use sandboxd::core::reaper::Reaper;
use sandboxd::core::registry::SessionRegistry;
use sandboxd::core::workspace::WorkspaceGateway;
use sandboxd::http::{create_router, AppState};
use sandboxd::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = logging::init_service_logging("/app/logs", "sandboxd");

    let pid = process::id();
    let pid_file = "/tmp/sandboxd.pid";
    if let Err(e) = std::fs::write(pid_file, pid.to_string()) {
        warn!("could not write PID file: {e}");
    }

    let pid_file_cleanup = pid_file.to_string();
    ctrlc::set_handler(move || {
        info!("shutting down sandboxd...");
        let _ = std::fs::remove_file(&pid_file_cleanup);
        std::process::exit(0);
    })?;

    info!("starting sandboxd, pid {pid}");

    let config = Arc::new(Config::from_env()?);

    info!("connecting to Docker...");
    let driver: Arc<dyn sandboxd::core::driver::ContainerDriver> =
        match BollardDriver::connect(config.docker_socket.as_deref()) {
            Ok(d) => Arc::new(d),
            Err(e) => {
                error!("failed to connect to Docker: {e}");
                return Err(anyhow::anyhow!("container engine not available"));
            }
        };

    info!("connecting to Redis at {}...", config.redis_url);
    let kv: Arc<dyn sandboxd::core::kv::KvDirectory> =
        match RedisKvDirectory::connect(&config.redis_url).await {
            Ok(k) => Arc::new(k),
            Err(e) => {
                error!("failed to connect to Redis: {e}");
                return Err(anyhow::anyhow!("KV directory not available"));
            }
        };

    let registry = Arc::new(SessionRegistry::new(kv.clone(), driver.clone(), config.clone()));
    let executor = Arc::new(Executor::new(driver.clone(), registry.clone()));
    let workspace = Arc::new(WorkspaceGateway::new(driver.clone(), config.workspace_max_file_size));

    let reaper = Reaper::new(driver.clone(), kv.clone(), registry.clone(), config.clone());
    tokio::spawn(reaper.run());

    let state = Arc::new(AppState {
        registry,
        executor,
        workspace,
        driver,
        config: config.clone(),
    });

    let app = create_router(state);

    info!("binding to {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("sandboxd started successfully");
    axum::serve(listener, app).await?;

    Ok(())
}
