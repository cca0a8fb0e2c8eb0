// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! Establishes broker connections and opens channels on them. Used by the
//! consuming broker adapter as well as by the control and event buses.

use crate::errors::ConnectorError;
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use tracing::{debug, error};

/// Connects to `uri` and creates a channel on that connection.
///
/// # Parameters
/// * `uri` - AMQP URI of the broker
/// * `connection_name` - Name reported to the broker for this connection
///
/// # Returns
/// The connection and its channel, or an error when either step fails.
pub async fn new_amqp_channel(
    uri: &str,
    connection_name: &str,
) -> Result<(Connection, Channel), ConnectorError> {
    debug!(connection = connection_name, "creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(connection_name.to_owned()));

    let conn = match Connection::connect(uri, options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(ConnectorError::ConnectionError {})
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((conn, c))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            if let Err(err) = conn.close(200, "channel failure").await {
                debug!(error = err.to_string(), "ignoring close failure");
            }
            Err(ConnectorError::ChannelError {})
        }
    }
}

/// Closes `channel` and then `conn`, skipping whichever is already down.
///
/// Teardown failures are never surfaced.
pub async fn close_amqp_channel(conn: &Connection, channel: &Channel) {
    if channel.status().connected() {
        if let Err(err) = channel.close(200, "OK").await {
            debug!(error = err.to_string(), "ignoring channel close failure");
        }
    }

    if conn.status().connected() {
        if let Err(err) = conn.close(200, "OK").await {
            debug!(error = err.to_string(), "ignoring connection close failure");
        }
    }
}
