// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Message Consumer
//!
//! A [`Consumer`] owns one broker subscription. A dedicated task pulls
//! deliveries one at a time, hands each to a [`DeliveryHandler`] and
//! acknowledges it only when the handler succeeds. Failed deliveries are
//! nacked with requeue for the broker to redeliver; nothing is retried here.

use crate::{
    broker::{Broker, BrokerChannel, Delivery, DeliveryStream},
    config::ConnectionParams,
    errors::ConnectorError,
    forwarder::DeliveryHandler,
    otel,
    tag::consumer_tag,
};
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, error, warn};

/// A running subscription to one queue.
pub struct Consumer {
    queue: String,
    consumer_tag: String,
    channel: Arc<dyn BrokerChannel>,
    shutdown: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Consumer {
    /// Opens a broker channel, subscribes to `queue` and starts the delivery loop.
    ///
    /// # Parameters
    /// * `broker` - Broker to open the channel on
    /// * `params` - Connection parameters of the AMQP definition
    /// * `channel_name` - Name of the logical channel, reported to the broker
    /// * `queue` - Queue to consume from
    /// * `tag_prefix` - Prefix of the generated consumer tag
    /// * `on_delivery` - Handler gating the acknowledgement of every delivery
    ///
    /// # Returns
    /// The running consumer, or the error of whichever step failed. When the
    /// subscription fails the freshly opened channel is closed again.
    pub async fn open(
        broker: &dyn Broker,
        params: &ConnectionParams,
        channel_name: &str,
        queue: &str,
        tag_prefix: &str,
        on_delivery: Arc<dyn DeliveryHandler>,
    ) -> Result<Consumer, ConnectorError> {
        let channel: Arc<dyn BrokerChannel> = Arc::from(broker.open(params, channel_name).await?);
        let consumer_tag = consumer_tag(tag_prefix);

        let deliveries = match channel.consume(queue, &consumer_tag).await {
            Ok(deliveries) => deliveries,
            Err(err) => {
                channel.close().await;
                return Err(err);
            }
        };

        debug!(
            conn = params.conn_info(),
            channel = channel_name,
            queue,
            consumer_tag = consumer_tag.as_str(),
            "started a consumer"
        );

        let (shutdown, stopped) = oneshot::channel();
        let worker = tokio::spawn(delivery_loop(
            channel.clone(),
            deliveries,
            on_delivery,
            queue.to_owned(),
            stopped,
        ));

        Ok(Consumer {
            queue: queue.to_owned(),
            consumer_tag,
            channel,
            shutdown: Some(shutdown),
            worker: Some(worker),
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Whether the delivery loop is still pulling from the broker.
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Stops the delivery loop and closes the broker channel.
    ///
    /// A delivery being handled when this is called is completed (and
    /// acknowledged if forwarded) first. Calling it again is a no-op.
    pub async fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }

        if let Some(worker) = self.worker.take() {
            if let Err(err) = worker.await {
                error!(error = err.to_string(), queue = self.queue.as_str(), "delivery loop failure");
            }
        }

        if self.channel.is_open() {
            self.channel.close().await;
            debug!(
                queue = self.queue.as_str(),
                consumer_tag = self.consumer_tag.as_str(),
                "consumer closed"
            );
        }
    }
}

async fn delivery_loop(
    channel: Arc<dyn BrokerChannel>,
    mut deliveries: DeliveryStream,
    handler: Arc<dyn DeliveryHandler>,
    queue: String,
    mut stopped: oneshot::Receiver<()>,
) {
    let tracer = global::tracer("amqp consumer");

    loop {
        let next = tokio::select! {
            biased;
            _ = &mut stopped => break,
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                if let Err(err) =
                    consume(&tracer, &delivery, handler.as_ref(), channel.as_ref(), &queue).await
                {
                    error!(error = err.to_string(), queue = queue.as_str(), "error consume msg");
                }
            }
            Some(Err(err)) => {
                error!(error = err.to_string(), queue = queue.as_str(), "errors consume msg");
                break;
            }
            None => {
                warn!(queue = queue.as_str(), "delivery stream ended");
                break;
            }
        }
    }

    debug!(queue = queue.as_str(), "delivery loop stopped");
}

/// Handles one delivery: forwards it, then acknowledges it on success.
/// A delivery the handler rejects is nacked with requeue so the broker can
/// hand it out again.
///
/// # Returns
/// Ok(()) once the delivery was forwarded and acknowledged; otherwise the
/// handler, ack or nack error.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    handler: &dyn DeliveryHandler,
    channel: &dyn BrokerChannel,
    queue: &str,
) -> Result<(), ConnectorError> {
    let (ctx, mut span) = otel::new_span(&delivery.headers, tracer, queue);

    debug!(
        queue,
        delivery_tag = delivery.delivery_tag,
        redelivered = delivery.redelivered,
        "received"
    );

    if let Err(err) = handler.on_delivery(&ctx, delivery).await {
        warn!(
            error = err.to_string(),
            delivery_tag = delivery.delivery_tag,
            "failure to forward msg, requeueing"
        );
        span.record_error(&err);
        span.set_status(Status::Error {
            description: Cow::from("failure to forward msg"),
        });

        // requeued, never retried locally
        if let Err(e) = channel.nack(delivery.delivery_tag).await {
            span.record_error(&e);
            return Err(e);
        }
        return Err(err);
    }

    match channel.ack(delivery.delivery_tag).await {
        Err(e) => {
            span.record_error(&e);
            span.set_status(Status::Error {
                description: Cow::from("error to ack msg"),
            });
            Err(ConnectorError::AckMessageError)
        }
        Ok(_) => {
            span.set_status(Status::Ok);
            Ok(())
        }
    }
}
