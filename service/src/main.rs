use anyhow::Context;
use clap::Parser;
use killfeed_service::api::Api;
use killfeed_service::config::Config;
use killfeed_service::App;
use std::net::{IpAddr, SocketAddr};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host interface to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Listen port; overrides PORT from the environment.
    #[arg(short, long)]
    port: Option<u16>,

    /// Disable the inbound HTTP/channel surface; ingest still runs.
    #[arg(long)]
    headless: bool,

    /// Upstream queue long-poll URL.
    #[arg(long)]
    queue_url: Option<String>,

    /// Upstream metadata API base URL.
    #[arg(long)]
    esi_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut config = Config::from_env();
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.headless {
        config.headless = true;
    }
    if let Some(url) = args.queue_url {
        config.queue_url = url;
    }
    if let Some(url) = args.esi_url {
        config.esi_url = url;
    }

    let app = App::new(config).context("failed to assemble service")?;
    app.start().context("failed to start background tasks")?;

    if app.config.headless {
        info!("headless mode, inbound surface disabled");
        tokio::signal::ctrl_c().await.context("signal handler failed")?;
    } else {
        let router = Api::new(app.clone()).router();
        let addr = SocketAddr::new(args.host, app.config.port);
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!(%addr, "listening");
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("axum server error")?;
    }

    app.shutdown().await;
    Ok(())
}
