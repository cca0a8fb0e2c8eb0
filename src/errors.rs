// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Consuming Connector
//!
//! `ConnectorError` covers every failure the connector can surface: loading its
//! configuration, talking to the broker, forwarding deliveries and reading the
//! control bus.

use thiserror::Error;

/// Represents errors that can occur while running a consuming connector.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConnectorError {
    /// The configuration store could not provide the requested item
    #[error("failure to load configuration `{0}`")]
    ConfigLoad(String),

    /// A required setting was not provided to the process
    #[error("missing configuration `{0}`")]
    MissingConfiguration(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error receiving or handling a delivery
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error publishing an event
    #[error("failure to publish")]
    PublishingError,

    /// A control message could not be decoded
    #[error("failure to parse control instruction `{0}`")]
    ParseInstructionError(String),

    /// The control bus failed while receiving
    #[error("control bus failure `{0}`")]
    ControlBusError(String),
}
