use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use lapin::{
    Channel, Connection, ConnectionProperties,
    message::BasicGetMessage,
    options::*,
    types::{AMQPValue, FieldTable},
};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use super::{DeliveryToken, JobQueue, QueueMessage};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// AMQP has no visibility timeout. The queue is declared with
/// `x-consumer-timeout`, so the broker closes a channel that holds an
/// unacknowledged delivery past that window and requeues the message.
/// The next receive notices the dead channel and reconnects.
#[derive(Clone)]
pub struct RabbitMqQueue {
    url: String,
    queue: String,
    wait: Duration,
    visibility_timeout: Duration,
    conn: Arc<Mutex<Connection>>,
    channel: Arc<Mutex<Channel>>,
    /// Bumped on every reconnect. Delivery tags are channel scoped, so a
    /// token from an older generation can no longer be acknowledged.
    generation: Arc<AtomicU64>,
}

impl RabbitMqQueue {
    async fn connect(url: &str, queue: &str, visibility_timeout: Duration) -> Result<(Connection, Channel)> {
        info!("Connecting to RabbitMQ");
        let conn = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| anyhow!("Failed to connect to RabbitMQ: {}", e))?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| anyhow!("Failed to create channel: {}", e))?;

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                queue_arguments(visibility_timeout),
            )
            .await
            .map_err(|e| anyhow!("Failed to declare queue '{}': {}", queue, e))?;

        info!(queue, "Connected to RabbitMQ");
        Ok((conn, channel))
    }

    pub async fn new(url: &str, queue: &str, wait: Duration, visibility_timeout: Duration) -> Result<Self> {
        let (conn, channel) = Self::connect(url, queue, visibility_timeout).await?;

        Ok(Self {
            url: url.to_string(),
            queue: queue.to_string(),
            wait,
            visibility_timeout,
            conn: Arc::new(Mutex::new(conn)),
            channel: Arc::new(Mutex::new(channel)),
            generation: Arc::new(AtomicU64::new(0)),
        })
    }

    async fn reconnect(&self) -> Result<()> {
        warn!("RabbitMQ connection dropped, reconnecting...");
        let (conn, channel) = Self::connect(&self.url, &self.queue, self.visibility_timeout).await?;
        *self.conn.lock().await = conn;
        *self.channel.lock().await = channel;
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_internal(&self) -> Result<Option<BasicGetMessage>> {
        let channel = self.channel.lock().await;
        channel
            .basic_get(&self.queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(|e| anyhow!("Failed to get message: {}", e))
    }

    async fn get_once(&self) -> Result<Option<BasicGetMessage>> {
        match self.get_internal().await {
            Ok(message) => Ok(message),
            Err(e) => {
                warn!("RabbitMQ get failed: {}. Retrying after reconnect.", e);
                self.reconnect().await?;
                self.get_internal().await
            }
        }
    }
}

fn queue_arguments(visibility_timeout: Duration) -> FieldTable {
    let mut args = FieldTable::default();
    let millis = i64::try_from(visibility_timeout.as_millis()).unwrap_or(i64::MAX);
    args.insert("x-consumer-timeout".into(), AMQPValue::LongLongInt(millis));
    args
}

fn encode_token(generation: u64, delivery_tag: u64) -> DeliveryToken {
    DeliveryToken::new(format!("{generation}:{delivery_tag}"))
}

fn decode_token(token: &DeliveryToken) -> Result<(u64, u64)> {
    let (generation, tag) = token
        .as_str()
        .split_once(':')
        .ok_or_else(|| anyhow!("Malformed RabbitMQ delivery token"))?;
    Ok((generation.parse()?, tag.parse()?))
}

#[async_trait]
impl JobQueue for RabbitMqQueue {
    async fn receive_next(&self) -> Result<Option<QueueMessage>> {
        let deadline = Instant::now() + self.wait;

        loop {
            if let Some(message) = self.get_once().await? {
                let delivery = message.delivery;
                let generation = self.generation.load(Ordering::SeqCst);
                debug!(
                    delivery_tag = delivery.delivery_tag,
                    redelivered = delivery.redelivered,
                    "Received RabbitMQ message"
                );
                return Ok(Some(QueueMessage {
                    body: delivery.data,
                    token: encode_token(generation, delivery.delivery_tag),
                    receive_count: None,
                }));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn acknowledge(&self, token: &DeliveryToken) -> Result<()> {
        let (generation, delivery_tag) = decode_token(token)?;
        if generation != self.generation.load(Ordering::SeqCst) {
            return Err(anyhow!(
                "Delivery {} belongs to a closed channel; the broker already requeued it",
                delivery_tag
            ));
        }

        let channel = self.channel.lock().await;
        channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to ack message: {}", e))?;
        Ok(())
    }
}
