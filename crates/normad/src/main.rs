//! normad - task orchestration daemon.
//!
//! Main entry point for the orchestrator binary.

use mimalloc::MiMalloc;
use normad::Daemon;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let repo_root = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            error!("failed to resolve current directory: {}", e);
            std::process::exit(1);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    let exit_code = runtime.block_on(async {
        match Daemon::new(&repo_root).await {
            Ok(daemon) => {
                let daemon_ref = &daemon;
                tokio::select! {
                    result = daemon.run() => {
                        if let Err(e) = result {
                            error!("normad error: {}", e);
                            return e.exit_code();
                        }
                        0
                    }
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("received SIGINT");
                        daemon_ref.shutdown();
                        0
                    }
                }
            }
            Err(e) => {
                error!("failed to initialize normad: {}", e);
                e.exit_code()
            }
        }
    });

    std::process::exit(exit_code);
}
