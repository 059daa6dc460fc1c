//! Publish/subscribe client used by the gateway to hear about domain events.

pub mod bus;
pub mod error;
pub mod event;
pub mod memory;
pub mod nats;
pub mod redis;
pub mod transport;

pub use bus::{ChannelConsumer, EventBus, EventBusConfig, EventConsumer, HandlerId};
pub use error::{Error, Result};
pub use event::{BusEvent, BusMessage, EventPayload};
pub use memory::MemoryTransport;
pub use transport::{transport_from_url, MessageStream, Transport, TransportSink};
