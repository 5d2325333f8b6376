//! Publisher adapter: connection lifecycle plus publish-with-confirm to the
//! bounded durable queue.
//!
//! Ladder: DISCONNECTED → CONNECTING → CONNECTED → CHANNEL_OPEN →
//! CONFIRM_ENABLED → QUEUE_DECLARED → READY. A broker or channel fault moves
//! READY → RECONNECTING and the supervisor task re-climbs the ladder with
//! backoff; `close` moves any state through CLOSING to CLOSED.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions};
use lapin::{BasicProperties, Channel, Connection};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use packrat::{
    BackoffSettings, BrokerSettings, FetchRequest, MessagePublisher, PublishError, Sleeper,
    TokioSleeper,
};

use crate::connection::{
    connect_with_backoff, queue_arguments, register_disconnect_hook, Disconnect, LinkState,
    StateCell,
};

const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// RabbitMQ-backed [`MessagePublisher`] with publisher confirms.
pub struct AmqpPublisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    broker: BrokerSettings,
    backoff: BackoffSettings,
    publish_timeout: Duration,
    sleeper: Arc<dyn Sleeper>,
    state: StateCell,
    closing: watch::Sender<bool>,
    /// Publish mutex: at most one caller talks to the channel at a time, and
    /// close() drains in-flight publishes by acquiring it.
    channel: Mutex<Option<Channel>>,
    connection: Mutex<Option<Connection>>,
    events_tx: mpsc::UnboundedSender<Disconnect>,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Disconnect>>>,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl AmqpPublisher {
    pub fn new(
        broker: BrokerSettings,
        backoff: BackoffSettings,
        publish_timeout: Duration,
    ) -> Self {
        Self::with_sleeper(broker, backoff, publish_timeout, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(
        broker: BrokerSettings,
        backoff: BackoffSettings,
        publish_timeout: Duration,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let (closing, _) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(PublisherInner {
                broker,
                backoff,
                publish_timeout,
                sleeper,
                state: StateCell::new(LinkState::Disconnected),
                closing,
                channel: Mutex::new(None),
                connection: Mutex::new(None),
                events_tx,
                events_rx: std::sync::Mutex::new(Some(events_rx)),
                supervisor: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Current lifecycle state, for probes and logs.
    pub fn state(&self) -> LinkState {
        self.inner.state.get()
    }
}

#[async_trait]
impl MessagePublisher for AmqpPublisher {
    async fn connect(&self) -> Result<(), PublishError> {
        let inner = &self.inner;
        inner.state.set(LinkState::Connecting);

        let connection = connect_with_backoff(
            &inner.broker.amqp_uri(),
            &inner.backoff.schedule(),
            inner.sleeper.clone(),
            inner.closing.subscribe(),
        )
        .await
        .map_err(|dial| {
            inner.state.set(LinkState::Disconnected);
            PublishError::ConnectExhausted { attempts: dial.attempts, reason: dial.reason }
        })?;

        register_disconnect_hook(&connection, inner.events_tx.clone());
        *inner.connection.lock().await = Some(connection);
        inner.state.set(LinkState::Connected);

        inner.open_channel_and_declare().await?;
        inner.clone().spawn_supervisor();
        Ok(())
    }

    async fn publish(&self, request: &FetchRequest) -> Result<(), PublishError> {
        let inner = &self.inner;
        if inner.state.get() != LinkState::Ready {
            warn!(event = "publish_rejected", reason = "publisher_not_ready");
            return Err(PublishError::NotReady);
        }

        let started = Instant::now();
        let guard = inner.channel.lock().await;
        let channel = guard.as_ref().ok_or_else(|| {
            warn!(event = "publish_failed", reason = "connection_lost");
            PublishError::ConnectionLost("channel is gone".into())
        })?;

        let body = request.to_bytes().map_err(|err| PublishError::Serialize(err.to_string()))?;
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE);

        let confirm = tokio::time::timeout(inner.publish_timeout, async {
            channel
                .basic_publish(
                    "",
                    &inner.broker.queue_name,
                    BasicPublishOptions::default(),
                    &body,
                    properties,
                )
                .await?
                .await
        })
        .await;

        match confirm {
            Err(_elapsed) => {
                warn!(event = "publish_failed", reason = "publish_timeout");
                inner.fault(format!("publish confirm not received within {:?}", inner.publish_timeout));
                Err(PublishError::Timeout(inner.publish_timeout))
            }
            Ok(Err(err)) => {
                let reason = err.to_string();
                if reason.contains("queue_rejected") || reason.contains("queue_overflow") {
                    warn!(event = "publish_failed", reason = "queue_rejected");
                    return Err(PublishError::QueueRejected(reason));
                }
                warn!(event = "publish_failed", reason = "connection_lost", error = %reason);
                inner.fault(reason.clone());
                Err(PublishError::ConnectionLost(reason))
            }
            Ok(Ok(confirmation)) => {
                // A nack means the bounded queue refused the publish
                // (x-overflow = reject-publish); a returned message means it
                // never reached the queue at all.
                use lapin::publisher_confirm::Confirmation;
                match confirmation {
                    Confirmation::Nack(_) | Confirmation::Ack(Some(_)) => {
                        warn!(event = "publish_failed", reason = "queue_rejected");
                        return Err(PublishError::QueueRejected(
                            "broker refused the message (nack or return)".into(),
                        ));
                    }
                    Confirmation::Ack(None) | Confirmation::NotRequested => {}
                }
                info!(
                    event = "publish_success",
                    request_id = %request.request_id,
                    url = %request.url,
                    latency_ms = started.elapsed().as_millis() as u64,
                );
                Ok(())
            }
        }
    }

    async fn close(&self) {
        let inner = &self.inner;
        let _ = inner.closing.send(true);
        inner.state.set(LinkState::Closing);
        info!(event = "publisher_shutdown");

        if let Some(handle) = inner.supervisor.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }

        // Acquiring the publish mutex drains any in-flight publish first.
        let mut channel = inner.channel.lock().await;
        if let Some(channel) = channel.take() {
            if let Err(err) = channel.close(0, "shutdown").await {
                warn!(event = "channel_close_failed", error = %err);
            }
        }
        drop(channel);

        let mut connection = inner.connection.lock().await;
        if let Some(connection) = connection.take() {
            if let Err(err) = connection.close(0, "shutdown").await {
                warn!(event = "connection_close_failed", error = %err);
            }
        }
        inner.state.set(LinkState::Closed);
    }

    fn ready(&self) -> bool {
        self.inner.state.get() == LinkState::Ready
    }
}

impl PublisherInner {
    /// Climb CHANNEL_OPEN → CONFIRM_ENABLED → QUEUE_DECLARED → READY on the
    /// current connection. Any failure tears the link down for a re-dial.
    async fn open_channel_and_declare(&self) -> Result<(), PublishError> {
        let result: Result<Channel, lapin::Error> = async {
            let connection = self.connection.lock().await;
            let connection = connection.as_ref().ok_or(lapin::Error::InvalidConnectionState(
                lapin::ConnectionState::Closed,
            ))?;
            self.state.set(LinkState::ChannelOpen);
            let channel = connection.create_channel().await?;
            channel.confirm_select(ConfirmSelectOptions::default()).await?;
            self.state.set(LinkState::ConfirmEnabled);
            channel
                .queue_declare(
                    &self.broker.queue_name,
                    QueueDeclareOptions { durable: true, ..QueueDeclareOptions::default() },
                    queue_arguments(self.broker.queue_max_length),
                )
                .await?;
            self.state.set(LinkState::QueueDeclared);
            Ok(channel)
        }
        .await;

        match result {
            Ok(channel) => {
                *self.channel.lock().await = Some(channel);
                self.state.set(LinkState::Ready);
                Ok(())
            }
            Err(err) => {
                self.state.set(LinkState::Reconnecting);
                self.teardown().await;
                Err(PublishError::ConnectionLost(err.to_string()))
            }
        }
    }

    async fn teardown(&self) {
        let mut channel = self.channel.lock().await;
        if let Some(channel) = channel.take() {
            let _ = channel.close(0, "teardown").await;
        }
        drop(channel);
        let mut connection = self.connection.lock().await;
        if let Some(connection) = connection.take() {
            let _ = connection.close(0, "teardown").await;
        }
    }

    /// Record a broker fault and wake the supervisor.
    fn fault(&self, reason: String) {
        self.state.set(LinkState::Reconnecting);
        let _ = self.events_tx.send(Disconnect(reason));
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
                // Coalesce a burst of fault events into one recovery pass.
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

    async fn try_reestablish(&self) -> Result<(), PublishError> {
        self.teardown().await;
        let connection =
            lapin::Connection::connect(&self.broker.amqp_uri(), lapin::ConnectionProperties::default())
                .await
                .map_err(|err| PublishError::ConnectionLost(err.to_string()))?;
        register_disconnect_hook(&connection, self.events_tx.clone());
        *self.connection.lock().await = Some(connection);
        self.state.set(LinkState::Connected);
        self.open_channel_and_declare().await
    }
}
