// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Forwarding
//!
//! Turns broker deliveries into `MESSAGE_RECEIVED` events on the internal event
//! bus. The outcome of [`DeliveryHandler::on_delivery`] decides whether the
//! consumer acknowledges the delivery.

use crate::{broker::Delivery, errors::ConnectorError};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{fmt, sync::Arc};
use tracing::debug;
use uuid::Uuid;

/// Kind of events published for forwarded deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    MessageReceived,
}

impl EventAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventAction::MessageReceived => "MESSAGE_RECEIVED",
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event handed to the internal pipeline for each delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEvent {
    pub action: EventAction,
    pub service_name: String,
    pub correlation_id: String,
    pub payload: Vec<u8>,
}

/// Internal bus receiving forwarded events.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, ctx: &Context, event: &OutboundEvent) -> Result<(), ConnectorError>;

    /// Releases the bus connection.
    async fn close(&self);
}

/// Receives each delivery of a consumer before it is acknowledged.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn on_delivery(&self, ctx: &Context, delivery: &Delivery) -> Result<(), ConnectorError>;
}

/// New opaque correlation id.
pub fn new_correlation_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Publishes deliveries of one channel generation as events of `service_name`.
pub struct Forwarder {
    service_name: String,
    event_bus: Arc<dyn EventBus>,
}

impl Forwarder {
    pub fn new(service_name: &str, event_bus: Arc<dyn EventBus>) -> Forwarder {
        Forwarder {
            service_name: service_name.to_owned(),
            event_bus,
        }
    }

    pub fn event(&self, delivery: &Delivery) -> OutboundEvent {
        OutboundEvent {
            action: EventAction::MessageReceived,
            service_name: self.service_name.clone(),
            correlation_id: new_correlation_id(),
            payload: delivery.body.clone(),
        }
    }
}

#[async_trait]
impl DeliveryHandler for Forwarder {
    async fn on_delivery(&self, ctx: &Context, delivery: &Delivery) -> Result<(), ConnectorError> {
        let event = self.event(delivery);

        self.event_bus.publish(ctx, &event).await?;

        debug!(
            service = self.service_name.as_str(),
            correlation_id = event.correlation_id.as_str(),
            delivery_tag = delivery.delivery_tag,
            "delivery forwarded"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::FieldTable;

    fn delivery(body: &[u8]) -> Delivery {
        Delivery {
            delivery_tag: 9,
            headers: FieldTable::default(),
            body: body.to_vec(),
            redelivered: false,
        }
    }

    #[tokio::test]
    async fn publishes_message_received_event() {
        let mut bus = MockEventBus::new();
        bus.expect_publish()
            .withf(|_, event| {
                event.action == EventAction::MessageReceived
                    && event.service_name == "svc.orders"
                    && event.payload == b"{\"id\":42}".to_vec()
                    && event.correlation_id.len() == 32
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let forwarder = Forwarder::new("svc.orders", Arc::new(bus));
        let result = forwarder
            .on_delivery(&Context::new(), &delivery(b"{\"id\":42}"))
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn propagates_publish_failure() {
        let mut bus = MockEventBus::new();
        bus.expect_publish()
            .times(1)
            .returning(|_, _| Err(ConnectorError::PublishingError));

        let forwarder = Forwarder::new("svc.orders", Arc::new(bus));
        let result = forwarder.on_delivery(&Context::new(), &delivery(b"x")).await;

        assert_eq!(result, Err(ConnectorError::PublishingError));
    }

    #[test]
    fn correlation_ids_differ_per_event() {
        let forwarder = Forwarder::new("svc", Arc::new(MockEventBus::new()));
        let d = delivery(b"x");
        assert_ne!(forwarder.event(&d).correlation_id, forwarder.event(&d).correlation_id);
    }
}
