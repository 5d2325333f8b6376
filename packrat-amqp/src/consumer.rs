//! Consumer adapter: connection lifecycle plus the at-least-once delivery
//! loop with per-consumer prefetch and manual acks.
//!
//! Ladder mirrors the publisher minus publisher confirms. On reconnect the
//! previously-installed handler is resubscribed under the adapter lock so a
//! concurrent `close` can never race a resubscribe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    BasicRejectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use packrat::{
    AckError, BackoffSettings, BrokerSettings, ConsumeError, IncomingMessage, MessageConsumer,
    MessageHandler, Sleeper, TokioSleeper,
};

use crate::connection::{
    connect_with_backoff, queue_arguments, register_disconnect_hook, Disconnect, LinkState,
    StateCell,
};

/// One lapin delivery behind the transport-agnostic message facade.
///
/// Settlement is tracked so the poison-message wrapper can tell whether the
/// processing service already acked or nacked before it decides to reject.
pub struct AmqpDelivery {
    body: Vec<u8>,
    acker: lapin::acker::Acker,
    processed: AtomicBool,
}

impl AmqpDelivery {
    fn new(delivery: Delivery) -> Self {
        Self { body: delivery.data, acker: delivery.acker, processed: AtomicBool::new(false) }
    }

    fn claim(&self, op: &str) -> Result<(), AckError> {
        if self.processed.swap(true, Ordering::SeqCst) {
            return Err(AckError(format!("{op} on an already-settled delivery")));
        }
        Ok(())
    }
}

#[async_trait]
impl IncomingMessage for AmqpDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    async fn ack(&self) -> Result<(), AckError> {
        self.claim("ack")?;
        self.acker.ack(BasicAckOptions::default()).await.map_err(|err| AckError(err.to_string()))
    }

    async fn nack_requeue(&self) -> Result<(), AckError> {
        self.claim("nack")?;
        self.acker
            .nack(BasicNackOptions { requeue: true, ..BasicNackOptions::default() })
            .await
            .map_err(|err| AckError(err.to_string()))
    }

    async fn reject(&self) -> Result<(), AckError> {
        self.claim("reject")?;
        self.acker
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map_err(|err| AckError(err.to_string()))
    }

    fn processed(&self) -> bool {
        self.processed.load(Ordering::SeqCst)
    }
}

/// RabbitMQ-backed [`MessageConsumer`].
pub struct AmqpConsumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    broker: BrokerSettings,
    backoff: BackoffSettings,
    sleeper: Arc<dyn Sleeper>,
    state: StateCell,
    closing: watch::Sender<bool>,
    /// Adapter lock: subscribe, resubscribe, and teardown are serialized so
    /// close never races a reconnect's resubscribe.
    lifecycle: Mutex<()>,
    connection: Mutex<Option<Connection>>,
    channel: Mutex<Option<Channel>>,
    handler: std::sync::Mutex<Option<Arc<dyn MessageHandler>>>,
    consumer_tag: std::sync::Mutex<Option<String>>,
    delivery_loop: std::sync::Mutex<Option<JoinHandle<()>>>,
    events_tx: mpsc::UnboundedSender<Disconnect>,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Disconnect>>>,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl AmqpConsumer {
    pub fn new(broker: BrokerSettings, backoff: BackoffSettings) -> Self {
        Self::with_sleeper(broker, backoff, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(
        broker: BrokerSettings,
        backoff: BackoffSettings,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let (closing, _) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ConsumerInner {
                broker,
                backoff,
                sleeper,
                state: StateCell::new(LinkState::Disconnected),
                closing,
                lifecycle: Mutex::new(()),
                connection: Mutex::new(None),
                channel: Mutex::new(None),
                handler: std::sync::Mutex::new(None),
                consumer_tag: std::sync::Mutex::new(None),
                delivery_loop: std::sync::Mutex::new(None),
                events_tx,
                events_rx: std::sync::Mutex::new(Some(events_rx)),
                supervisor: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> LinkState {
        self.inner.state.get()
    }
}

#[async_trait]
impl MessageConsumer for AmqpConsumer {
    async fn connect(&self) -> Result<(), ConsumeError> {
        let inner = &self.inner;
        inner.state.set(LinkState::Connecting);
        info!(event = "rmq_connecting");

        let connection = connect_with_backoff(
            &inner.broker.amqp_uri(),
            &inner.backoff.schedule(),
            inner.sleeper.clone(),
            inner.closing.subscribe(),
        )
        .await
        .map_err(|dial| {
            inner.state.set(LinkState::Disconnected);
            ConsumeError::ConnectExhausted { attempts: dial.attempts, reason: dial.reason }
        })?;

        register_disconnect_hook(&connection, inner.events_tx.clone());
        *inner.connection.lock().await = Some(connection);
        inner.state.set(LinkState::Connected);

        inner
            .open_channel_and_declare()
            .await
            .map_err(|err| ConsumeError::Subscribe(err.to_string()))?;
        inner.clone().spawn_supervisor();
        Ok(())
    }

    async fn start_consuming(
        &self,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<String, ConsumeError> {
        let inner = &self.inner;
        let _guard = inner.lifecycle.lock().await;
        *inner.handler.lock().unwrap_or_else(|p| p.into_inner()) = Some(handler.clone());
        inner.subscribe(handler).await
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), ConsumeError> {
        let inner = &self.inner;
        let _guard = inner.lifecycle.lock().await;
        let channel = inner.channel.lock().await;
        if let Some(channel) = channel.as_ref() {
            channel
                .basic_cancel(consumer_tag, BasicCancelOptions::default())
                .await
                .map_err(|err| ConsumeError::Cancel(err.to_string()))?;
        }
        inner.consumer_tag.lock().unwrap_or_else(|p| p.into_inner()).take();
        Ok(())
    }

    async fn close(&self) {
        let inner = &self.inner;
        let _ = inner.closing.send(true);
        inner.state.set(LinkState::Closing);
        info!(event = "consumer_shutdown");

        if let Some(handle) = inner.supervisor.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }

        let _guard = inner.lifecycle.lock().await;
        if let Some(handle) = inner.delivery_loop.lock().unwrap_or_else(|p| p.into_inner()).take()
        {
            handle.abort();
        }
        inner.teardown().await;
        inner.state.set(LinkState::Closed);
    }
}

impl ConsumerInner {
    /// CHANNEL_OPEN → prefetch → QUEUE_DECLARED → READY on the current
    /// connection.
    async fn open_channel_and_declare(&self) -> Result<(), lapin::Error> {
        let channel = {
            let connection = self.connection.lock().await;
            let connection = connection
                .as_ref()
                .ok_or(lapin::Error::InvalidConnectionState(lapin::ConnectionState::Closed))?;
            self.state.set(LinkState::ChannelOpen);
            let channel = connection.create_channel().await?;
            channel.basic_qos(self.broker.prefetch_count, BasicQosOptions::default()).await?;
            channel
                .queue_declare(
                    &self.broker.queue_name,
                    QueueDeclareOptions { durable: true, ..QueueDeclareOptions::default() },
                    queue_arguments(self.broker.queue_max_length),
                )
                .await?;
            channel
        };
        *self.channel.lock().await = Some(channel);
        self.state.set(LinkState::QueueDeclared);
        self.state.set(LinkState::Ready);
        Ok(())
    }

    /// Subscribe with manual acks and spawn the delivery loop. Caller holds
    /// the lifecycle lock.
    async fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> Result<String, ConsumeError> {
        let channel = self.channel.lock().await;
        let channel = channel.as_ref().ok_or(ConsumeError::NotConnected)?;
        let consumer = channel
            .basic_consume(
                &self.broker.queue_name,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| ConsumeError::Subscribe(err.to_string()))?;
        let tag = consumer.tag().as_str().to_owned();
        *self.consumer_tag.lock().unwrap_or_else(|p| p.into_inner()) = Some(tag.clone());

        let loop_handle = tokio::spawn(async move {
            let mut consumer = consumer;
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        handler.handle(Box::new(AmqpDelivery::new(delivery))).await;
                    }
                    Err(err) => {
                        warn!(event = "delivery_stream_error", error = %err);
                        break;
                    }
                }
            }
        });
        if let Some(previous) =
            self.delivery_loop.lock().unwrap_or_else(|p| p.into_inner()).replace(loop_handle)
        {
            previous.abort();
        }
        info!(event = "consumer_subscribed", consumer_tag = %tag);
        Ok(tag)
    }

    async fn teardown(&self) {
        self.consumer_tag.lock().unwrap_or_else(|p| p.into_inner()).take();
        let mut channel = self.channel.lock().await;
        if let Some(channel) = channel.take() {
            if let Err(err) = channel.close(0, "shutdown").await {
                warn!(event = "channel_close_failed", error = %err);
            }
        }
        drop(channel);
        let mut connection = self.connection.lock().await;
        if let Some(connection) = connection.take() {
            if let Err(err) = connection.close(0, "shutdown").await {
                warn!(event = "connection_close_failed", error = %err);
            }
        }
    }

    fn spawn_supervisor(self: Arc<Self>) {
        let mut slot = self.supervisor.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            return;
        }
        let Some(mut events) = self.events_rx.lock().unwrap_or_else(|p| p.into_inner()).take()
        else {
            return;
        };
        let inner = self.clone();
        *slot = Some(tokio::spawn(async move {
            while let Some(Disconnect(reason)) = events.recv().await {
                while events.try_recv().is_ok() {}
                if *inner.closing.borrow() {
                    break;
                }
                inner.state.set(LinkState::Reconnecting);
                warn!(event = "broker_disconnect_detected", reason = %reason);
                inner.reconnect_loop().await;
            }
        }));
    }

    async fn reconnect_loop(&self) {
        let mut sequence = self
            .backoff
            .schedule()
            .sequence(self.sleeper.clone())
            .with_cancel(self.closing.subscribe());
        let mut attempt = 0u32;

        while sequence.next().await.is_some() {
            if *self.closing.borrow() {
                return;
            }
            attempt += 1;
            info!(event = "rmq_reconnect_attempt", attempt);
            match self.try_reestablish().await {
                Ok(()) => {
                    info!(event = "rmq_reconnected", attempt);
                    return;
                }
                Err(err) => {
                    warn!(event = "rmq_reconnect_attempt_failed", attempt, error = %err);
                }
            }
        }
        warn!(
            event = "rmq_reconnect_exhausted",
            max_attempts = self.backoff.max_connection_attempts,
        );
        self.state.set(LinkState::Disconnected);
    }

    async fn try_reestablish(&self) -> Result<(), ConsumeError> {
        {
            let _guard = self.lifecycle.lock().await;
            self.teardown().await;
        }
        let connection = lapin::Connection::connect(
            &self.broker.amqp_uri(),
            lapin::ConnectionProperties::default(),
        )
        .await
        .map_err(|err| ConsumeError::Subscribe(err.to_string()))?;
        register_disconnect_hook(&connection, self.events_tx.clone());
        *self.connection.lock().await = Some(connection);
        self.state.set(LinkState::Connected);
        self.open_channel_and_declare()
            .await
            .map_err(|err| ConsumeError::Subscribe(err.to_string()))?;

        // Re-check closing under the lifecycle lock before resubscribing the
        // stored handler; a concurrent close must win this race.
        let _guard = self.lifecycle.lock().await;
        if *self.closing.borrow() {
            return Ok(());
        }
        let handler = self.handler.lock().unwrap_or_else(|p| p.into_inner()).clone();
        if let Some(handler) = handler {
            self.subscribe(handler).await?;
        }
        Ok(())
    }
}
