use clap::Parser;
use std::net::SocketAddr;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use denis_server::AppState;

#[derive(Parser, Debug)]
#[command(name = "denis-server")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:8793")]
    addr: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    let addr: SocketAddr = match args.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %args.addr);
            return;
        }
    };

    let state = match AppState::from_env() {
        Ok(state) => state,
        Err(err) => {
            error!(event = "state_init_failed", error = %err);
            return;
        }
    };
    let graph_enabled = state.graph.enabled();
    let app = denis_server::build_router(state);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "bind_failed", error = %err, addr = %addr);
            return;
        }
    };

    info!(event = "server_start", addr = %addr, graph_enabled);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "server_error", error = %err);
    }
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("DENIS_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
