//! cindermud: a small telnet MUD server built around a fixed-pulse game
//! loop. One thread, non-blocking sockets, and a deferred event queue do
//! all the work; see `server` for the loop itself.

mod act;
mod color;
mod config;
mod events;
mod gmcp;
mod hotboot;
mod interp;
mod output;
mod pager;
mod server;
mod session;
mod world;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::server::{Exit, Server};
use crate::world::World;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,cindermud=info".into()),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let cfg = match Config::parse(&args[1..]) {
        Ok(cfg) => cfg,
        Err(err) => config::usage_and_exit(&args[0], &err),
    };

    if cfg.syntax_check {
        let world = World::build(cfg.mini);
        info!(
            rooms = world.rooms.len(),
            chars = world.chars.len(),
            "world loads cleanly"
        );
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    let (listener, adopted) = match cfg.hotboot_fd {
        Some(fd) => hotboot::recover(fd, &cfg).context("hot restart recovery")?,
        None => {
            let listener = TcpListener::bind(("0.0.0.0", cfg.port))
                .await
                .with_context(|| format!("binding port {}", cfg.port))?;
            (listener, Vec::new())
        }
    };
    info!(port = cfg.port, "listening");

    let mut server = Server::new(cfg, listener, shutdown_rx);
    for (stream, meta) in adopted {
        server.adopt_session(stream, meta);
    }

    let exit = server.run().await?;
    info!(
        accepted = server.stats.accepted,
        closed = server.stats.closed,
        commands = server.stats.commands,
        pool_allocated = server.pool.allocated,
        pool_overflows = server.pool.overflows,
        "server stopped"
    );
    match exit {
        Exit::Shutdown => Ok(()),
        Exit::Hotboot => hotboot::perform(server),
    }
}
