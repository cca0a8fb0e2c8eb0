// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consuming Connector
//!
//! The [`Connector`] owns the configuration of one channel and the consumer
//! built from it. Every reconfiguration takes the definition lock and then the
//! channel lock, always in that order, closes the running consumer and, if the
//! channel is active, opens a new one for the current configuration.
//!
//! Create and Edit instructions are the same operation
//! ([`Connector::apply_create_or_edit`]); so are Delete and Close
//! ([`Connector::terminate`]).

use crate::{
    broker::Broker,
    config::{ChannelConfig, ConfigStore, ConnectionParams, ConnectorEnv},
    consumer::Consumer,
    control::{ControlBus, ControlInstruction, ControlMessage},
    errors::ConnectorError,
    forwarder::{EventBus, Forwarder},
    tag::resolve_host,
};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, error, info, trace, warn};

/// Externally visible lifecycle of a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorStatus {
    Initializing,
    Active,
    Stopped,
}

/// The live subscription of an active connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub queue: String,
    pub consumer_tag: String,
    pub service_name: String,
}

/// State guarded by the channel lock.
///
/// When `consumer` is present it was opened from `config`, and `config` is
/// active.
struct ConnectorState {
    config: Arc<ChannelConfig>,
    consumer: Option<Consumer>,
}

pub struct Connector {
    identity: String,
    params: ConnectionParams,
    broker: Arc<dyn Broker>,
    event_bus: Arc<dyn EventBus>,
    store: Arc<dyn ConfigStore>,
    definition_lock: Arc<Mutex<()>>,
    state: Mutex<ConnectorState>,
    status: watch::Sender<ConnectorStatus>,
}

impl Connector {
    /// Loads the channel and its definition, then starts consuming.
    ///
    /// # Parameters
    /// * `env` - Identifiers the process was started with
    /// * `store` - Where the channel and definition are loaded from
    /// * `broker` - Broker consumers are opened on
    /// * `event_bus` - Bus forwarded deliveries are published to
    /// * `definition_lock` - Lock shared by connectors of the same definition
    ///
    /// # Returns
    /// The connector, `Active` even when the first consumer could not be
    /// opened. Failing to load configuration is fatal and returned as
    /// [`ConnectorError::ConfigLoad`].
    pub async fn init(
        env: &ConnectorEnv,
        store: Arc<dyn ConfigStore>,
        broker: Arc<dyn Broker>,
        event_bus: Arc<dyn EventBus>,
        definition_lock: Arc<Mutex<()>>,
    ) -> Result<Connector, ConnectorError> {
        let config = store.get_channel(env.channel_id).await.map_err(|err| {
            error!(error = err.to_string(), channel_id = env.channel_id, "failure to load channel");
            err
        })?;
        let params = store.get_definition(env.def_id).await.map_err(|err| {
            error!(error = err.to_string(), def_id = env.def_id, "failure to load definition");
            err
        })?;

        // DNS lookups for consumer tags stay off the runtime and outside the locks
        resolve_host().await;

        let (status, _) = watch::channel(ConnectorStatus::Initializing);

        let connector = Connector {
            identity: env.identity(),
            params,
            broker,
            event_bus,
            store,
            definition_lock,
            state: Mutex::new(ConnectorState {
                config: Arc::new(config),
                consumer: None,
            }),
            status,
        };

        connector.setup().await;

        Ok(connector)
    }

    async fn setup(&self) {
        let definition = self.definition_lock.lock().await;
        let mut state = self.state.lock().await;

        if let Err(err) = self.rebuild(&definition, &mut state).await {
            error!(
                error = err.to_string(),
                channel = state.config.name.as_str(),
                queue = state.config.queue.as_str(),
                "failure to start consumer, waiting for reconfiguration"
            );
        }

        self.status.send_replace(ConnectorStatus::Active);
        info!(
            identity = self.identity.as_str(),
            channel = state.config.name.as_str(),
            "connector started"
        );
    }

    /// Process-level address of this connector.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn status(&self) -> ConnectorStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectorStatus> {
        self.status.subscribe()
    }

    fn is_stopped(&self) -> bool {
        self.status() == ConnectorStatus::Stopped
    }

    /// Current channel configuration.
    pub async fn channel_config(&self) -> Arc<ChannelConfig> {
        self.state.lock().await.config.clone()
    }

    /// The running subscription, if any. A consumer whose delivery stream
    /// has ended is not reported.
    pub async fn subscription(&self) -> Option<Subscription> {
        let state = self.state.lock().await;
        state
            .consumer
            .as_ref()
            .filter(|consumer| consumer.is_running())
            .map(|consumer| Subscription {
            queue: consumer.queue().to_owned(),
            consumer_tag: consumer.consumer_tag().to_owned(),
            service_name: state.config.service_name.clone(),
        })
    }

    /// Closes the running consumer, then opens a new one if the current
    /// configuration is active.
    ///
    /// The guard and the `state` borrow prove both locks are held.
    async fn rebuild(
        &self,
        _definition: &MutexGuard<'_, ()>,
        state: &mut ConnectorState,
    ) -> Result<(), ConnectorError> {
        if let Some(mut consumer) = state.consumer.take() {
            consumer.close().await;
        }

        if !state.config.is_active {
            debug!(channel = state.config.name.as_str(), "channel is not active");
            return Ok(());
        }

        let forwarder = Arc::new(Forwarder::new(
            &state.config.service_name,
            self.event_bus.clone(),
        ));

        let consumer = Consumer::open(
            self.broker.as_ref(),
            &self.params,
            &state.config.name,
            &state.config.queue,
            &state.config.consumer_tag_prefix,
            forwarder,
        )
        .await?;

        state.consumer = Some(consumer);

        Ok(())
    }

    /// Replaces the channel configuration and rebuilds the consumer.
    pub async fn apply_create_or_edit(&self, config: ChannelConfig) -> Result<(), ConnectorError> {
        let definition = self.definition_lock.lock().await;
        let mut state = self.state.lock().await;

        if self.is_stopped() {
            debug!(channel = config.name.as_str(), "connector stopped, ignoring reconfiguration");
            return Ok(());
        }

        debug!(
            channel = config.name.as_str(),
            queue = config.queue.as_str(),
            is_active = config.is_active,
            "reconfiguring channel"
        );

        state.config = Arc::new(config);
        self.rebuild(&definition, &mut state).await
    }

    /// Stops the consumer, releases the bus and store, and marks the
    /// connector `Stopped`. Calling it again is a no-op.
    pub async fn terminate(&self) {
        let _definition = self.definition_lock.lock().await;
        let mut state = self.state.lock().await;

        if self.is_stopped() {
            return;
        }

        if let Some(mut consumer) = state.consumer.take() {
            consumer.close().await;
        }

        self.event_bus.close().await;
        self.store.close().await;

        self.status.send_replace(ConnectorStatus::Stopped);
        info!(
            identity = self.identity.as_str(),
            channel = state.config.name.as_str(),
            "connector stopped"
        );
    }

    /// Whether `message` concerns this connector.
    ///
    /// Messages addressed to this process are always accepted. Channel-level
    /// Edit and Delete instructions are accepted when they name this channel.
    pub async fn filter(&self, message: &ControlMessage) -> bool {
        if let Some(recipient) = &message.recipient {
            if *recipient == self.identity {
                return true;
            }
        } else if let ControlInstruction::Edit(_) | ControlInstruction::Delete { .. } =
            message.instruction
        {
            let channel_id = self.state.lock().await.config.id;
            if message.instruction.channel_id() == Some(channel_id) {
                return true;
            }
        }

        trace!(
            action = message.instruction.action(),
            recipient = ?message.recipient,
            target = ?message.instruction.channel_id(),
            "returning false for msg"
        );
        false
    }

    /// Executes an instruction that passed [`Connector::filter`].
    ///
    /// Instructions arriving after the connector stopped are ignored.
    pub async fn handle(&self, message: ControlMessage) -> Result<(), ConnectorError> {
        if self.is_stopped() {
            debug!(action = message.instruction.action(), "connector stopped, ignoring msg");
            return Ok(());
        }

        match message.instruction {
            ControlInstruction::Create(config) | ControlInstruction::Edit(config) => {
                self.apply_create_or_edit(config).await
            }
            ControlInstruction::Delete { .. } | ControlInstruction::Close => {
                self.terminate().await;
                Ok(())
            }
        }
    }

    /// Processes control messages until the connector stops.
    ///
    /// A failed reconfiguration is logged and the loop keeps going. When the
    /// control bus ends or fails the connector terminates.
    pub async fn run<B>(&self, control: &mut B) -> Result<(), ConnectorError>
    where
        B: ControlBus + ?Sized,
    {
        while !self.is_stopped() {
            let message = match control.receive().await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    warn!(identity = self.identity.as_str(), "control bus closed, stopping");
                    self.terminate().await;
                    break;
                }
                Err(err) => {
                    error!(error = err.to_string(), "failure to receive control msg, stopping");
                    self.terminate().await;
                    return Err(err);
                }
            };

            if !self.filter(&message).await {
                continue;
            }

            let action = message.instruction.action();
            if let Err(err) = self.handle(message).await {
                let config = self.channel_config().await;
                error!(
                    error = err.to_string(),
                    action,
                    channel = config.name.as_str(),
                    queue = config.queue.as_str(),
                    "failure to apply control msg"
                );
            }
        }

        Ok(())
    }
}
