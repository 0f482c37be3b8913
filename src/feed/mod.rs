pub mod backoff;
pub mod manager;
pub mod polling;
pub mod transport;

#[cfg(test)]
pub mod testing;

pub use backoff::{Backoff, ReconnectConfig};
pub use manager::{
    ConnectionEvent, ConnectionState, DriverExit, FeedDriver, SubscriptionId, SubscriptionManager,
};
pub use polling::PollingTransport;
pub use transport::{decode_tick, ControlMessage, SubscriptionAction, TickConnection, TickTransport, WsTransport};
