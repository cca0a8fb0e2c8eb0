// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Entry point of one consuming connector process.
//!
//! The process is identified through the environment (see
//! [`amqp_connector::config::ConnectorEnv`]) and runs until its channel is
//! deleted or it is told to close.

use amqp_connector::{
    broker::LapinBroker,
    config::{ConnectorEnv, JsonConfigStore},
    connector::Connector,
    control::AmqpControlBus,
    publisher::AmqpEventBus,
};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let env = ConnectorEnv::from_env()?;
    info!(
        repo_location = %env.repo_location.display(),
        def_id = env.def_id,
        channel_id = env.channel_id,
        "starting amqp consuming connector"
    );

    let identity = env.identity();
    let store = Arc::new(JsonConfigStore::new(&env.repo_location));
    let event_bus =
        Arc::new(AmqpEventBus::connect(&env.bus_uri, &env.event_exchange, &identity).await?);
    let mut control =
        AmqpControlBus::connect(&env.bus_uri, &env.control_exchange, &identity).await?;

    let connector = Connector::init(
        &env,
        store,
        Arc::new(LapinBroker),
        event_bus,
        Arc::new(Mutex::new(())),
    )
    .await?;

    let result = connector.run(&mut control).await;
    control.close().await;
    result?;

    info!(identity = identity.as_str(), "connector exited");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
