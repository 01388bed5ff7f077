mod auth;
mod error;
mod routes;
mod state;

use anyhow::{Context, Result};
use caronte_core::config::Config;
use clap::Parser;
use state::AppState;
use std::path::PathBuf;

#[derive(Parser, Debug)]
struct Args {
    #[clap(short, long, parse(from_os_str), value_name = "FILE")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("loading config from {:?}", args.config))?;
    let server_address = config.server_address.clone();

    let (state, rescan_worker) = AppState::new(config);

    let shutdown = state.shutdown.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown requested, draining in-flight work");
        shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
    })
    .context("installing Ctrl+C handler")?;

    let rules_for_rescan = state.rules.clone();
    std::thread::spawn(move || {
        rescan_worker.run(|| rules_for_rescan.current_database());
    });

    let app = routes::build(state);

    let addr = resolve_listen_address(&server_address)
        .with_context(|| format!("parsing server_address {server_address:?}"))?;
    log::info!("caronted listening on {addr}");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .context("HTTP server failed")?;

    Ok(())
}

/// `server_address` is either a bare IP (spec.md §9's validated field) or an IP:port
/// pair; the bare-IP form binds port 3333, caronte's default.
fn resolve_listen_address(server_address: &str) -> Result<std::net::SocketAddr> {
    if let Ok(addr) = server_address.parse::<std::net::SocketAddr>() {
        return Ok(addr);
    }
    let ip: std::net::IpAddr = server_address
        .parse()
        .with_context(|| format!("{server_address:?} is neither an IP nor an IP:port"))?;
    Ok(std::net::SocketAddr::new(ip, 3333))
}
