use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties,
    options::*,
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use tokio::sync::Mutex;
use tracing::{info, warn};

const PERSISTENT: u8 = 2;

#[derive(Clone)]
pub struct RabbitMqService {
    url: String,
    conn: Arc<Mutex<Connection>>,
    channel: Arc<Mutex<Channel>>,
}

/// Arguments for a delay queue: expired messages go back to `target` through
/// the default exchange.
pub fn dead_letter_arguments(target: &str) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        ShortString::from("x-dead-letter-exchange"),
        AMQPValue::LongString(LongString::from("")),
    );
    args.insert(
        ShortString::from("x-dead-letter-routing-key"),
        AMQPValue::LongString(LongString::from(target)),
    );
    args
}

fn persistent() -> BasicProperties {
    BasicProperties::default()
        .with_delivery_mode(PERSISTENT)
        .with_content_type(ShortString::from("application/json"))
}

impl RabbitMqService {
    async fn connect(url: &str) -> Result<(Connection, Channel)> {
        info!("Connecting to RabbitMQ");
        let conn = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| anyhow!("Failed to connect to RabbitMQ: {}", e))?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| anyhow!("Failed to create channel: {}", e))?;

        info!("✅ Connected to RabbitMQ");
        Ok((conn, channel))
    }

    pub async fn new(url: &str) -> Result<Self> {
        let (conn, channel) = Self::connect(url).await?;

        Ok(Self {
            url: url.to_string(),
            conn: Arc::new(Mutex::new(conn)),
            channel: Arc::new(Mutex::new(channel)),
        })
    }

    async fn reconnect(&self) -> Result<()> {
        warn!("RabbitMQ connection dropped, reconnecting...");
        let (conn, channel) = Self::connect(&self.url).await?;
        *self.conn.lock().await = conn;
        *self.channel.lock().await = channel;
        Ok(())
    }

    /// Declare the work queue and its retry queue. Messages published to the
    /// retry queue dead-letter back to the work queue once their expiration
    /// passes.
    pub async fn declare_topology(&self, queue: &str, retry_queue: &str) -> Result<()> {
        let channel = self.channel.lock().await;
        let durable = QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        };

        channel
            .queue_declare(queue, durable, FieldTable::default())
            .await
            .map_err(|e| anyhow!("Failed to declare queue {}: {}", queue, e))?;

        channel
            .queue_declare(retry_queue, durable, dead_letter_arguments(queue))
            .await
            .map_err(|e| anyhow!("Failed to declare queue {}: {}", retry_queue, e))?;

        info!("📮 Declared queues '{}' and '{}'", queue, retry_queue);
        Ok(())
    }

    async fn publish_internal(
        &self,
        queue: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<()> {
        let channel = self.channel.lock().await;

        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| anyhow!("Failed to publish message: {}", e))?
            .await
            .map_err(|e| anyhow!("Failed to confirm publication: {}", e))?;

        Ok(())
    }

    async fn publish_with(&self, queue: &str, payload: &[u8], properties: BasicProperties) -> Result<()> {
        if let Err(e) = self.publish_internal(queue, payload, properties.clone()).await {
            warn!("RabbitMQ publish failed: {}. Retrying after reconnect.", e);
            self.reconnect().await?;
            self.publish_internal(queue, payload, properties).await?;
        }

        Ok(())
    }

    pub async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()> {
        self.publish_with(queue, payload, persistent()).await
    }

    /// Publish to a dead-lettering delay queue; the message becomes visible
    /// on the target queue after `delay`.
    pub async fn publish_delayed(&self, queue: &str, payload: &[u8], delay: Duration) -> Result<()> {
        let expiration = ShortString::from(delay.as_millis().to_string());
        self.publish_with(queue, payload, persistent().with_expiration(expiration))
            .await
    }

    pub async fn get_channel(&self) -> Arc<Mutex<Channel>> {
        self.channel.clone()
    }
}
