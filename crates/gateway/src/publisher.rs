//! Event ingestion helper.

use crate::channel::ChannelRouter;
use crate::error::Result;
use event_bus::EventBus;
use metrics::counter;
use serde_json::{Map, Value};
use tracing::debug;

/// Publishes domain events to every topic that may be watching them.
#[derive(Clone)]
pub struct EventPublisher {
    bus: EventBus,
    router: ChannelRouter,
}

impl EventPublisher {
    pub fn new(bus: EventBus, router: ChannelRouter) -> Self {
        Self { bus, router }
    }

    /// Publish `payload` for `event_name` to its global topic and, when an
    /// argument is given, to its specific topic. Returns the topics used.
    pub async fn publish_event(
        &self,
        event_name: &str,
        args: &Map<String, Value>,
        payload: &Value,
    ) -> Result<Vec<String>> {
        let topics = self.router.build_all(event_name, args)?;
        for topic in &topics {
            self.bus.publish(topic, payload).await?;
        }
        counter!("gateway_events_published_total").increment(1);
        debug!("Published {} to {:?}", event_name, topics);
        Ok(topics)
    }
}
