// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Control Instructions
//!
//! Instructions reconfiguring or stopping connectors, and the bus they arrive
//! on. Every connector sees every message published on the control exchange;
//! deciding which ones concern it happens in the connector itself.

use crate::{
    channel::{close_amqp_channel, new_amqp_channel},
    config::ChannelConfig,
    errors::ConnectorError,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    Channel, Connection, ExchangeKind,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// What a control message asks a connector to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlInstruction {
    Create(ChannelConfig),
    Edit(ChannelConfig),
    Delete { id: i64 },
    Close,
}

impl ControlInstruction {
    /// Channel the instruction is about, when it names one.
    pub fn channel_id(&self) -> Option<i64> {
        match self {
            ControlInstruction::Create(config) | ControlInstruction::Edit(config) => Some(config.id),
            ControlInstruction::Delete { id } => Some(*id),
            ControlInstruction::Close => None,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            ControlInstruction::Create(_) => "CREATE",
            ControlInstruction::Edit(_) => "EDIT",
            ControlInstruction::Delete { .. } => "DELETE",
            ControlInstruction::Close => "CLOSE",
        }
    }
}

/// Envelope of an instruction on the control bus.
///
/// `recipient` addresses a connector process directly; without it the
/// instruction is addressed at channel level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    pub instruction: ControlInstruction,
}

impl ControlMessage {
    pub fn broadcast(instruction: ControlInstruction) -> ControlMessage {
        ControlMessage {
            recipient: None,
            instruction,
        }
    }

    pub fn to(recipient: &str, instruction: ControlInstruction) -> ControlMessage {
        ControlMessage {
            recipient: Some(recipient.to_owned()),
            instruction,
        }
    }

    /// Decodes a JSON control message.
    pub fn from_slice(data: &[u8]) -> Result<ControlMessage, ConnectorError> {
        serde_json::from_slice(data)
            .map_err(|err| ConnectorError::ParseInstructionError(err.to_string()))
    }
}

/// Source of control messages.
#[async_trait]
pub trait ControlBus: Send {
    /// Waits for the next message; `None` once the bus is gone.
    async fn receive(&mut self) -> Result<Option<ControlMessage>, ConnectorError>;
}

#[async_trait]
impl ControlBus for mpsc::Receiver<ControlMessage> {
    async fn receive(&mut self) -> Result<Option<ControlMessage>, ConnectorError> {
        Ok(self.recv().await)
    }
}

/// [`ControlBus`] fed by a fanout exchange through an exclusive queue.
pub struct AmqpControlBus {
    conn: Connection,
    channel: Channel,
    deliveries: lapin::Consumer,
}

impl AmqpControlBus {
    /// Connects to the bus broker and subscribes to `exchange`.
    pub async fn connect(
        uri: &str,
        exchange: &str,
        connection_name: &str,
    ) -> Result<AmqpControlBus, ConnectorError> {
        let (conn, channel) = new_amqp_channel(uri, connection_name).await?;

        match Self::subscribe(&channel, exchange, connection_name).await {
            Ok(deliveries) => Ok(AmqpControlBus {
                conn,
                channel,
                deliveries,
            }),
            Err(err) => {
                close_amqp_channel(&conn, &channel).await;
                Err(err)
            }
        }
    }

    async fn subscribe(
        channel: &Channel,
        exchange: &str,
        consumer_tag: &str,
    ) -> Result<lapin::Consumer, ConnectorError> {
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name = exchange, "error to declare the exchange");
                ConnectorError::ControlBusError(exchange.to_owned())
            })?;

        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to declare control queue");
                ConnectorError::ControlBusError(exchange.to_owned())
            })?;
        let queue_name = queue.name().as_str().to_owned();

        channel
            .queue_bind(
                &queue_name,
                exchange,
                "",
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                ConnectorError::ControlBusError(exchange.to_owned())
            })?;

        let deliveries = channel
            .basic_consume(
                &queue_name,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                ConnectorError::BindingConsumerError(queue_name.clone())
            })?;

        debug!(exchange, queue = queue_name.as_str(), "subscribed to control bus");

        Ok(deliveries)
    }

    /// Leaves the control exchange; the exclusive queue goes with the connection.
    pub async fn close(&self) {
        close_amqp_channel(&self.conn, &self.channel).await;
    }
}

#[async_trait]
impl ControlBus for AmqpControlBus {
    async fn receive(&mut self) -> Result<Option<ControlMessage>, ConnectorError> {
        loop {
            let delivery = match self.deliveries.next().await {
                None => return Ok(None),
                Some(Err(err)) => {
                    error!(error = err.to_string(), "control bus failure");
                    return Err(ConnectorError::ControlBusError(err.to_string()));
                }
                Some(Ok(delivery)) => delivery,
            };

            if let Err(err) = delivery.ack(BasicAckOptions { multiple: false }).await {
                error!(error = err.to_string(), "error whiling ack msg");
            }

            match ControlMessage::from_slice(&delivery.data) {
                Ok(message) => return Ok(Some(message)),
                Err(err) => warn!(error = err.to_string(), "dropping undecodable control message"),
            }
        }
    }
}
