// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker and event bus used by the unit tests.

use crate::{
    broker::{Broker, BrokerChannel, Delivery, DeliveryStream},
    config::{ChannelConfig, ConnectionParams},
    errors::ConnectorError,
    forwarder::{EventBus, OutboundEvent},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::types::FieldTable;
use opentelemetry::Context;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::{mpsc, Semaphore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BrokerEvent {
    Opened(String),
    Consumed { queue: String, tag: String },
    Acked(u64),
    Nacked(u64),
    Closed(String),
}

#[derive(Default)]
struct BrokerState {
    events: Mutex<Vec<BrokerEvent>>,
    feeds: Mutex<Vec<mpsc::UnboundedSender<Result<Delivery, ConnectorError>>>>,
    fail_open: AtomicBool,
    fail_consume: AtomicBool,
}

/// Broker keeping every interaction in an ordered log.
#[derive(Clone, Default)]
pub(crate) struct FakeBroker {
    state: Arc<BrokerState>,
}

impl FakeBroker {
    pub(crate) fn events(&self) -> Vec<BrokerEvent> {
        self.state.events.lock().unwrap().clone()
    }

    pub(crate) fn acks(&self) -> Vec<u64> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                BrokerEvent::Acked(tag) => Some(tag),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn nacks(&self) -> Vec<u64> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                BrokerEvent::Nacked(tag) => Some(tag),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn fail_open(&self, fail: bool) {
        self.state.fail_open.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_consume(&self, fail: bool) {
        self.state.fail_consume.store(fail, Ordering::SeqCst);
    }

    /// Pushes a delivery to the most recent subscription.
    pub(crate) fn deliver(&self, delivery_tag: u64, body: &[u8]) {
        let feeds = self.state.feeds.lock().unwrap();
        let feed = feeds.last().expect("no subscription");
        let _ = feed.send(Ok(Delivery {
            delivery_tag,
            headers: FieldTable::default(),
            body: body.to_vec(),
            redelivered: false,
        }));
    }

    /// Ends the most recent subscription as if the broker cancelled it.
    pub(crate) fn end_subscription(&self) {
        self.state.feeds.lock().unwrap().pop();
    }

    fn record(&self, event: BrokerEvent) {
        self.state.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn open(
        &self,
        _params: &ConnectionParams,
        channel_name: &str,
    ) -> Result<Box<dyn BrokerChannel>, ConnectorError> {
        if self.state.fail_open.load(Ordering::SeqCst) {
            return Err(ConnectorError::ConnectionError);
        }

        self.record(BrokerEvent::Opened(channel_name.to_owned()));
        Ok(Box::new(FakeChannel {
            name: channel_name.to_owned(),
            broker: self.clone(),
            open: AtomicBool::new(true),
        }))
    }
}

struct FakeChannel {
    name: String,
    broker: FakeBroker,
    open: AtomicBool,
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, ConnectorError> {
        if self.broker.state.fail_consume.load(Ordering::SeqCst) {
            return Err(ConnectorError::BindingConsumerError(queue.to_owned()));
        }

        self.broker.record(BrokerEvent::Consumed {
            queue: queue.to_owned(),
            tag: consumer_tag.to_owned(),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        self.broker.state.feeds.lock().unwrap().push(tx);

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), ConnectorError> {
        self.broker.record(BrokerEvent::Acked(delivery_tag));
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64) -> Result<(), ConnectorError> {
        self.broker.record(BrokerEvent::Nacked(delivery_tag));
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.broker.record(BrokerEvent::Closed(self.name.clone()));
        }
    }
}

/// Event bus recording what it was asked to publish.
pub(crate) struct RecordingBus {
    published: Mutex<Vec<OutboundEvent>>,
    fail: AtomicBool,
    gate: Option<Semaphore>,
    pub(crate) entered: Semaphore,
    pub(crate) attempts: AtomicUsize,
    pub(crate) closed: AtomicUsize,
}

impl Default for RecordingBus {
    fn default() -> Self {
        RecordingBus {
            published: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            gate: None,
            entered: Semaphore::new(0),
            attempts: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        }
    }
}

impl RecordingBus {
    /// Bus whose publishes block until [`RecordingBus::release`] is called.
    pub(crate) fn gated() -> Self {
        RecordingBus {
            gate: Some(Semaphore::new(0)),
            ..Default::default()
        }
    }

    /// Lets one blocked publish through.
    pub(crate) fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    pub(crate) fn published(&self) -> Vec<OutboundEvent> {
        self.published.lock().unwrap().clone()
    }

    pub(crate) fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventBus for RecordingBus {
    async fn publish(&self, _ctx: &Context, event: &OutboundEvent) -> Result<(), ConnectorError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.entered.add_permits(1);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ConnectorError::PublishingError);
        }
        self.published.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) fn params() -> ConnectionParams {
    ConnectionParams {
        id: 3,
        name: "local".to_owned(),
        host: "localhost".to_owned(),
        port: 5672,
        vhost: "/".to_owned(),
        username: "guest".to_owned(),
        password: "guest".to_owned(),
        heartbeat: None,
        frame_max: None,
    }
}

pub(crate) fn orders_channel() -> ChannelConfig {
    ChannelConfig {
        id: 1,
        name: "orders".to_owned(),
        is_active: true,
        queue: "orders".to_owned(),
        consumer_tag_prefix: "zz".to_owned(),
        service_name: "svc.orders".to_owned(),
    }
}

/// Polls `check` until it holds, failing the test after a few seconds.
pub(crate) async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
