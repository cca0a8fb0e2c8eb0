// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Event Bus
//!
//! Publishes forwarded events to an exchange of the internal bus. The payload
//! travels as the message body; action, service and correlation id travel as
//! message properties and headers, together with the trace context.

use crate::{
    channel::{close_amqp_channel, new_amqp_channel},
    errors::ConnectorError,
    forwarder::{EventBus, OutboundEvent},
    otel,
};
use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, ExchangeDeclareOptions},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ExchangeKind,
};
use opentelemetry::Context;
use tracing::{debug, error};
use uuid::Uuid;

/// Header naming the service an event is meant for.
pub const AMQP_HEADERS_SERVICE: &str = "service";
/// Content type of forwarded payloads, which are passed through untouched.
pub const OCTET_STREAM_CONTENT_TYPE: &str = "application/octet-stream";

/// [`EventBus`] publishing to a direct exchange keyed by service name.
pub struct AmqpEventBus {
    conn: Connection,
    channel: Channel,
    exchange: String,
}

impl AmqpEventBus {
    /// Connects to the bus broker and declares `exchange`.
    pub async fn connect(uri: &str, exchange: &str, connection_name: &str) -> Result<AmqpEventBus, ConnectorError> {
        let (conn, channel) = new_amqp_channel(uri, connection_name).await?;

        if let Err(err) = channel
            .exchange_declare(
                exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
        {
            error!(error = err.to_string(), name = exchange, "error to declare the exchange");
            close_amqp_channel(&conn, &channel).await;
            return Err(ConnectorError::PublishingError);
        }

        debug!(exchange, "event bus ready");

        Ok(AmqpEventBus {
            conn,
            channel,
            exchange: exchange.to_owned(),
        })
    }
}

/// Message properties describing `event`, carrying the trace context of `ctx`.
pub(crate) fn event_properties(ctx: &Context, event: &OutboundEvent) -> BasicProperties {
    let mut headers = otel::inject(ctx);
    headers.insert(
        ShortString::from(AMQP_HEADERS_SERVICE),
        AMQPValue::LongString(LongString::from(event.service_name.clone())),
    );

    BasicProperties::default()
        .with_content_type(ShortString::from(OCTET_STREAM_CONTENT_TYPE))
        .with_type(ShortString::from(event.action.as_str()))
        .with_correlation_id(ShortString::from(event.correlation_id.clone()))
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(FieldTable::from(headers))
}

#[async_trait]
impl EventBus for AmqpEventBus {
    async fn publish(&self, ctx: &Context, event: &OutboundEvent) -> Result<(), ConnectorError> {
        match self
            .channel
            .basic_publish(
                &self.exchange,
                &event.service_name,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &event.payload,
                event_properties(ctx, event),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    service = event.service_name.as_str(),
                    "error publishing message"
                );
                Err(ConnectorError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn close(&self) {
        close_amqp_channel(&self.conn, &self.channel).await;
        debug!(exchange = self.exchange.as_str(), "event bus closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::EventAction;

    #[test]
    fn properties_describe_event() {
        let event = OutboundEvent {
            action: EventAction::MessageReceived,
            service_name: "svc.orders".to_owned(),
            correlation_id: "abc123".to_owned(),
            payload: b"{}".to_vec(),
        };

        let props = event_properties(&Context::new(), &event);

        assert_eq!(props.kind().as_ref().map(|k| k.as_str()), Some("MESSAGE_RECEIVED"));
        assert_eq!(
            props.correlation_id().as_ref().map(|c| c.as_str()),
            Some("abc123")
        );
        let headers = props.headers().clone().unwrap_or_default();
        assert_eq!(
            headers.inner().get(AMQP_HEADERS_SERVICE),
            Some(&AMQPValue::LongString(LongString::from("svc.orders")))
        );
    }
}
