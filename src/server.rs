//! Accept loop: binds the listening socket, spawns one task per connection on a
//! single-threaded `LocalSet`, and drives the broker bridge alongside it.

use std::cell::RefCell;
use std::rc::Rc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::pubsub::{BrokerBridge, Registry, RedisBroker};

pub async fn run(config: Config) -> std::io::Result<()> {
    if config.tls.is_some() {
        warn!("TLS options were supplied but this listener only speaks plain TCP; ignoring them");
    }

    let bind_addr = format!("{}:{}", config.bind_host, config.bind_port);
    let listener = TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "listening");

    let registry = Rc::new(RefCell::new(Registry::new()));
    let broker_url = config.broker_url();
    let broker = RedisBroker::new(&broker_url).map_err(|err| {
        std::io::Error::new(std::io::ErrorKind::Other, err.to_string())
    })?;
    let bridge = BrokerBridge::new(&broker_url, broker.clone(), registry.clone())
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async move {
            tokio::task::spawn_local(bridge.run(shutdown_rx.clone()));
            let mut connections: tokio::task::JoinSet<()> = tokio::task::JoinSet::new();

            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(err) => {
                                error!(%err, "accept failed");
                                continue;
                            }
                        };
                        connections.spawn_local(crate::connection::handle(
                            stream,
                            peer,
                            registry.clone(),
                            broker.clone(),
                            shutdown_rx.clone(),
                        ));
                    }
                    Some(_) = connections.join_next(), if !connections.is_empty() => {}
                    _ = tokio::signal::ctrl_c() => {
                        info!("shutdown requested, closing open connections");
                        let _ = shutdown_tx.send(true);
                        break;
                    }
                }
            }

            // Every connection's reader loop selects on `shutdown_rx` (see
            // `connection::reader_loop`) and exits through its normal teardown path
            // (unsubscribe, drain, socket shutdown) rather than being cancelled
            // mid-flight; just wait for that to happen.
            while connections.join_next().await.is_some() {}
        })
        .await;

    Ok(())
}
