//! Pub/sub fanout: the broker client, the channel/subscriber registry, and the
//! string-interning pool backing it.

pub mod broker;
pub mod intern;
pub mod registry;

pub use broker::{Broker, BrokerBridge, BrokerStatus, RedisBroker};
pub use registry::{ChannelAction, Registry, Subscriber};
