use std::net::SocketAddr;
use std::panic;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, SandboxBackend};
use crate::core::engine::Engine;
use crate::core::gate::SchedulingGate;
use crate::core::pipeline::Pipeline;
use crate::core::reaper::DirectoryReaper;
use crate::core::registry::Registry;
use crate::core::traits::sandbox::Sandbox;
use crate::isolate::boxes::BoxPool;
use crate::isolate::sandbox::IsolateSandbox;
use crate::native::cgroup::CgroupRoot;
use crate::native::nix::NixBuilder;
use crate::native::sandbox::NativeSandbox;
use crate::storage::json::JsonFileStore;

mod config;
mod constants;
mod core;
mod http;
mod isolate;
mod native;
mod storage;
#[cfg(test)]
mod stubs;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    set_panic_hook();

    let config = Config::parse();
    tracing::debug!("Starting with {:?}", config);
    config.check_reclaim(unsafe { libc::geteuid() })?;

    tokio::fs::create_dir_all(&config.runtimes_dir).await?;
    tokio::fs::create_dir_all(&config.temp_dir).await?;

    let reaper = DirectoryReaper::new(config.delete_helper.clone());
    reaper.sweep(&config.temp_dir).await?;

    let store = Arc::new(JsonFileStore::new(config.catalog_path()));
    let registry = Registry::open(&config.runtimes_dir, &config.script_shell, store).await?;

    let sandbox: Arc<dyn Sandbox> = match config.sandbox_backend {
        SandboxBackend::Isolate => Arc::new(IsolateSandbox::new(
            &config.isolate_path,
            BoxPool::new(config.max_box_id),
            config.isolate_mounts.clone(),
            config.max_output_size,
        )),
        SandboxBackend::Native => Arc::new(NativeSandbox::new(
            CgroupRoot::open(&config.native_cgroup_root)?,
            config.max_output_size,
        )),
    };
    let builder = Arc::new(NixBuilder::new(
        &config.nix_bin_path,
        config.installation_timeout,
        config.update_timeout,
    ));

    let engine = Arc::new(Engine::new(
        SchedulingGate::new(config.max_concurrent_submissions as usize),
        registry,
        Pipeline::new(sandbox, reaper.clone(), &config.temp_dir),
        builder,
        reaper,
        &config.temp_dir,
        config.maxima(),
    ));

    let addr = SocketAddr::new(config.host, config.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!(
        "HTTP server listening on {} with {:?} sandbox and {} submission slots",
        addr,
        config.sandbox_backend,
        engine.gate().capacity()
    );
    axum::serve(listener, http::router(engine.clone()))
        .with_graceful_shutdown(shutdown_signal(engine))
        .await?;

    Ok(())
}

async fn shutdown_signal(engine: Arc<Engine>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutting down, in-flight submissions will finish");
    engine.close();
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
