//! The external pub/sub broker, abstracted to three operations. `RedisBroker` is the
//! real implementation; the trait exists so the connection engine's tests don't
//! depend on a live Redis instance.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::error::BrokerError;
use crate::pubsub::registry::Registry;

/// Status of a single broker command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerStatus {
    Ok,
    Disconnected,
    Error(String),
}

impl From<BrokerError> for BrokerStatus {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Disconnected => BrokerStatus::Disconnected,
            BrokerError::Transport(e) => BrokerStatus::Error(e.to_string()),
        }
    }
}

/// The operations the connection engine drives the broker with, issued once the
/// caller has dropped any registry borrow (see `registry.rs`'s module docs).
/// `?Send`: this trait is used from the single-threaded `LocalSet` runtime, so nothing
/// here needs to cross threads.
#[async_trait(?Send)]
pub trait Broker {
    async fn publish(&self, channel: &str, payload: &[u8]) -> BrokerStatus;
    async fn subscribe(&self, channel: &str) -> BrokerStatus;
    async fn unsubscribe(&self, channel: &str) -> BrokerStatus;
}

/// A live (un)subscribe request handed from `RedisBroker` to the `BrokerBridge` task
/// that actually owns the pubsub connection, with a one-shot reply slot for the
/// outcome.
enum PubSubCommand {
    Subscribe(String, oneshot::Sender<BrokerStatus>),
    Unsubscribe(String, oneshot::Sender<BrokerStatus>),
}

/// Shared connection state: both fields are `None` while disconnected.
/// `publish`/`subscribe`/`unsubscribe` return `DISCONNECTED` without queueing while
/// this is the case.
struct Shared {
    command_conn: Option<redis::aio::MultiplexedConnection>,
    pubsub_cmds: Option<mpsc::UnboundedSender<PubSubCommand>>,
}

/// Redis-backed broker client.
#[derive(Clone)]
pub struct RedisBroker {
    client: redis::Client,
    shared: Rc<RefCell<Shared>>,
}

impl RedisBroker {
    pub fn new(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            shared: Rc::new(RefCell::new(Shared {
                command_conn: None,
                pubsub_cmds: None,
            })),
        })
    }

    async fn with_connection<F, Fut>(&self, op: F) -> BrokerStatus
    where
        F: FnOnce(redis::aio::MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = redis::RedisResult<()>>,
    {
        let Some(conn) = self.shared.borrow().command_conn.clone() else {
            return BrokerStatus::Disconnected;
        };
        match op(conn).await {
            Ok(()) => BrokerStatus::Ok,
            Err(err) => {
                warn!(%err, "broker command failed");
                BrokerStatus::Error(err.to_string())
            }
        }
    }

    /// Hand a live (un)subscribe request to `BrokerBridge`'s pump loop, the only task
    /// that owns the pubsub connection, and wait for it to run the command.
    async fn send_pubsub_command<F>(&self, build: F) -> BrokerStatus
    where
        F: FnOnce(oneshot::Sender<BrokerStatus>) -> PubSubCommand,
    {
        let Some(cmd_tx) = self.shared.borrow().pubsub_cmds.clone() else {
            return BrokerStatus::Disconnected;
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if cmd_tx.send(build(reply_tx)).is_err() {
            return BrokerStatus::Disconnected;
        }
        reply_rx.await.unwrap_or(BrokerStatus::Disconnected)
    }
}

#[async_trait(?Send)]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: &[u8]) -> BrokerStatus {
        let channel = channel.to_string();
        let payload = payload.to_vec();
        self.with_connection(|mut conn| async move {
            conn.publish::<_, _, ()>(channel, payload).await
        })
        .await
    }

    async fn subscribe(&self, channel: &str) -> BrokerStatus {
        let channel = channel.to_string();
        self.send_pubsub_command(|reply| PubSubCommand::Subscribe(channel, reply))
            .await
    }

    async fn unsubscribe(&self, channel: &str) -> BrokerStatus {
        let channel = channel.to_string();
        self.send_pubsub_command(|reply| PubSubCommand::Unsubscribe(channel, reply))
            .await
    }
}

/// Supervises the Redis connection: reconnects with capped exponential backoff,
/// replays every channel with a local subscriber once back up, and pumps inbound
/// broker messages into the registry.
pub struct BrokerBridge {
    client: redis::Client,
    broker: RedisBroker,
    registry: Rc<RefCell<Registry>>,
}

impl BrokerBridge {
    pub fn new(url: &str, broker: RedisBroker, registry: Rc<RefCell<Registry>>) -> Result<Self, BrokerError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            broker,
            registry,
        })
    }

    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut backoff = Duration::from_millis(200);
        const MAX_BACKOFF: Duration = Duration::from_secs(10);
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.connect_and_pump(&mut shutdown).await {
                Ok(()) => return, // shutdown requested mid-pump
                Err(err) => {
                    error!(%err, delay = ?backoff, "broker connection lost, reconnecting");
                    {
                        let mut shared = self.broker.shared.borrow_mut();
                        shared.command_conn = None;
                        shared.pubsub_cmds = None;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn connect_and_pump(
        &self,
        shutdown: &mut tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), BrokerError> {
        let command_conn = self.client.get_multiplexed_async_connection().await?;
        self.broker.shared.borrow_mut().command_conn = Some(command_conn);

        let mut pubsub = self.client.get_async_pubsub().await?;
        let channels = self.registry.borrow().active_channels();
        for channel in &channels {
            pubsub.subscribe(channel.as_str()).await?;
        }
        info!(resubscribed = channels.len(), "broker connected");

        // The live (un)subscribe commands `RedisBroker::subscribe`/`unsubscribe` issue
        // once a channel's first/last local subscriber appears arrive here, since
        // `pubsub` is the only handle that can drive `SUBSCRIBE`/`UNSUBSCRIBE` on the
        // wire and this task is its sole owner.
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        self.broker.shared.borrow_mut().pubsub_cmds = Some(cmd_tx);

        loop {
            // `on_message()` borrows `pubsub` mutably for the lifetime of the stream
            // it returns, so it is re-created fresh each iteration rather than held
            // across the loop — that leaves `pubsub` free for the command branch below
            // to call `subscribe`/`unsubscribe` on once the un-selected branches (and
            // their borrows) are dropped.
            tokio::select! {
                msg = pubsub.on_message().next() => {
                    let Some(msg) = msg else {
                        return Err(BrokerError::Disconnected);
                    };
                    let channel: String = msg.get_channel_name().to_string();
                    let payload: Vec<u8> = msg.get_payload_bytes().to_vec();
                    self.registry.borrow_mut().deliver(&channel, &payload);
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(PubSubCommand::Subscribe(channel, reply)) => {
                            let status = match pubsub.subscribe(channel.as_str()).await {
                                Ok(()) => BrokerStatus::Ok,
                                Err(err) => {
                                    warn!(%err, %channel, "live subscribe failed");
                                    BrokerStatus::Error(err.to_string())
                                }
                            };
                            let _ = reply.send(status);
                        }
                        Some(PubSubCommand::Unsubscribe(channel, reply)) => {
                            let status = match pubsub.unsubscribe(channel.as_str()).await {
                                Ok(()) => BrokerStatus::Ok,
                                Err(err) => {
                                    warn!(%err, %channel, "live unsubscribe failed");
                                    BrokerStatus::Error(err.to_string())
                                }
                            };
                            let _ = reply.send(status);
                        }
                        None => {} // every `RedisBroker` clone was dropped; keep pumping messages
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc as StdRc;

    /// An in-memory broker that just records which channels it was told to
    /// subscribe/unsubscribe/publish to, for connection-layer unit tests.
    #[derive(Clone, Default)]
    pub struct RecordingBroker {
        subscribed: StdRc<StdRefCell<Vec<String>>>,
        unsubscribed: StdRc<StdRefCell<Vec<String>>>,
        published: StdRc<StdRefCell<Vec<(String, Vec<u8>)>>>,
    }

    impl RecordingBroker {
        pub fn subscribed(&self) -> Vec<String> {
            self.subscribed.borrow().clone()
        }
        pub fn unsubscribed(&self) -> Vec<String> {
            self.unsubscribed.borrow().clone()
        }
        pub fn published(&self) -> Vec<(String, Vec<u8>)> {
            self.published.borrow().clone()
        }
    }

    #[async_trait(?Send)]
    impl Broker for RecordingBroker {
        async fn publish(&self, channel: &str, payload: &[u8]) -> BrokerStatus {
            self.published
                .borrow_mut()
                .push((channel.to_string(), payload.to_vec()));
            BrokerStatus::Ok
        }
        async fn subscribe(&self, channel: &str) -> BrokerStatus {
            self.subscribed.borrow_mut().push(channel.to_string());
            BrokerStatus::Ok
        }
        async fn unsubscribe(&self, channel: &str) -> BrokerStatus {
            self.unsubscribed.borrow_mut().push(channel.to_string());
            BrokerStatus::Ok
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingBroker;
    use super::*;

    #[tokio::test]
    async fn recording_broker_tracks_commands() {
        let broker = RecordingBroker::default();
        broker.subscribe("x").await;
        broker.publish("x", b"hi").await;
        broker.unsubscribe("x").await;
        assert_eq!(broker.subscribed(), vec!["x".to_string()]);
        assert_eq!(broker.unsubscribed(), vec!["x".to_string()]);
        assert_eq!(broker.published(), vec![("x".to_string(), b"hi".to_vec())]);
    }
}
