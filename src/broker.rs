// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstraction
//!
//! The consuming side of an AMQP broker expressed as two traits: [`Broker`]
//! opens channels, [`BrokerChannel`] subscribes, acknowledges and closes.
//! [`LapinBroker`] is the production implementation.

use crate::{
    channel::{close_amqp_channel, new_amqp_channel},
    config::ConnectionParams,
    errors::ConnectorError,
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions},
    types::FieldTable,
    Channel, Connection,
};
use tracing::error;

/// Unacknowledged messages the broker may push to one consumer.
pub const PREFETCH_COUNT: u16 = 1;

/// One message handed over by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub headers: FieldTable,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            headers: delivery.properties.headers().clone().unwrap_or_default(),
            body: delivery.data,
            redelivered: delivery.redelivered,
        }
    }
}

/// Deliveries of one subscription, in broker order.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, ConnectorError>>;

/// Opens broker channels.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Connects with `params` and opens a channel named after `channel_name`.
    async fn open(
        &self,
        params: &ConnectionParams,
        channel_name: &str,
    ) -> Result<Box<dyn BrokerChannel>, ConnectorError>;
}

/// An open channel able to run one subscription.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Subscribes to `queue` under `consumer_tag`.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, ConnectorError>;

    /// Acknowledges a single delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), ConnectorError>;

    /// Hands a single delivery back to the broker for redelivery.
    async fn nack(&self, delivery_tag: u64) -> Result<(), ConnectorError>;

    /// Whether the underlying connection is still usable.
    fn is_open(&self) -> bool;

    /// Closes the channel and its connection. Closing twice is a no-op.
    async fn close(&self);
}

/// [`Broker`] backed by lapin, one connection per channel.
#[derive(Debug, Default, Clone)]
pub struct LapinBroker;

#[async_trait]
impl Broker for LapinBroker {
    async fn open(
        &self,
        params: &ConnectionParams,
        channel_name: &str,
    ) -> Result<Box<dyn BrokerChannel>, ConnectorError> {
        let (conn, channel) = new_amqp_channel(&params.uri(), channel_name).await?;
        Ok(Box::new(LapinChannel { conn, channel }))
    }
}

pub struct LapinChannel {
    conn: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, ConnectorError> {
        if let Err(err) = self
            .channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions { global: false })
            .await
        {
            error!(error = err.to_string(), queue, "failure to configure qos");
            return Err(ConnectorError::QoSDeclarationError(queue.to_owned()));
        }

        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to create the consumer");
                Err(ConnectorError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| {
                result
                    .map(Delivery::from)
                    .map_err(|err| ConnectorError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), ConnectorError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                ConnectorError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64) -> Result<(), ConnectorError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue: true,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling nack msg");
                ConnectorError::NackMessageError
            })
    }

    fn is_open(&self) -> bool {
        self.conn.status().connected() && self.channel.status().connected()
    }

    async fn close(&self) {
        close_amqp_channel(&self.conn, &self.channel).await
    }
}
