use anyhow::{Result, anyhow};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, options::*, types::FieldTable,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::topology::{self, TopologySettings};

#[derive(Clone)]
pub struct RabbitMqService {
    url: String,
    topology: TopologySettings,
    conn: Arc<Mutex<Connection>>,
    channel: Arc<Mutex<Channel>>,
}

impl RabbitMqService {
    async fn connect(url: &str, settings: &TopologySettings) -> Result<(Connection, Channel)> {
        info!("Connecting to RabbitMQ at {}", url);
        let conn = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| anyhow!("Failed to connect to RabbitMQ: {}", e))?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| anyhow!("Failed to create channel: {}", e))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to enable publisher confirms: {}", e))?;

        topology::declare(&channel, settings).await?;

        info!("Connected to RabbitMQ");
        Ok((conn, channel))
    }

    pub async fn new(url: &str, settings: TopologySettings) -> Result<Self> {
        let (conn, channel) = Self::connect(url, &settings).await?;

        Ok(Self {
            url: url.to_string(),
            topology: settings,
            conn: Arc::new(Mutex::new(conn)),
            channel: Arc::new(Mutex::new(channel)),
        })
    }

    async fn reconnect(&self) -> Result<()> {
        warn!("RabbitMQ connection dropped, reconnecting...");
        let (conn, channel) = Self::connect(&self.url, &self.topology).await?;
        *self.conn.lock().await = conn;
        *self.channel.lock().await = channel;
        Ok(())
    }

    async fn publish_internal(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<()> {
        let channel = self.channel.lock().await;

        let confirm = channel
            .basic_publish(
                exchange.into(),
                routing_key.into(),
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| anyhow!("Failed to publish message: {}", e))?
            .await
            .map_err(|e| anyhow!("Failed to confirm publication: {}", e))?;

        if confirm.is_nack() {
            return Err(anyhow!(
                "Broker refused message for {}/{}",
                exchange,
                routing_key
            ));
        }

        Ok(())
    }

    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<()> {
        if let Err(e) = self
            .publish_internal(exchange, routing_key, payload, properties.clone())
            .await
        {
            warn!("RabbitMQ publish failed: {}. Retrying after reconnect.", e);
            self.reconnect().await?;
            self.publish_internal(exchange, routing_key, payload, properties)
                .await?;
        }

        Ok(())
    }

    /// Dedicated channel for one consumer, with prefetch 1 so unacked work
    /// never piles up behind a long encode.
    pub async fn consumer_channel(&self) -> Result<Channel> {
        let channel = {
            let conn = self.conn.lock().await;
            conn.create_channel().await
        };

        let channel = match channel {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Failed to open consumer channel: {}", e);
                self.reconnect().await?;
                self.conn
                    .lock()
                    .await
                    .create_channel()
                    .await
                    .map_err(|e| anyhow!("Failed to create channel: {}", e))?
            }
        };

        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to set prefetch: {}", e))?;
        Ok(channel)
    }

    pub async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<lapin::Consumer> {
        let channel = self.consumer_channel().await?;
        channel
            .basic_consume(
                queue.into(),
                consumer_tag.into(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to consume {}: {}", queue, e))
    }
}
