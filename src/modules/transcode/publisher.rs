use anyhow::{Context, Result};
use async_trait::async_trait;
use lapin::BasicProperties;
use serde::Serialize;

use super::events::{CleanupTask, SubtitleTranscodeTask, TranscodeTask};
use super::model::JobType;
use crate::infrastructure::queue::rabbitmq::RabbitMqService;
use crate::infrastructure::queue::topology::{
    EXCHANGE_DELAY, EXCHANGE_TRANSCODE, IMMEDIATE_PRIORITY, ROUTING_DELAY, ROUTING_DELAY_SUBTITLE,
    ROUTING_NORMAL, ROUTING_PRIORITY, ROUTING_SUBTITLE,
};

/// Where a work item is routed inside the `transcode` exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Normal,
    Priority,
    Subtitle,
}

impl Lane {
    pub fn for_video(immediate: bool) -> Self {
        if immediate { Lane::Priority } else { Lane::Normal }
    }

    pub fn routing_key(&self) -> &'static str {
        match self {
            Lane::Normal => ROUTING_NORMAL,
            Lane::Priority => ROUTING_PRIORITY,
            Lane::Subtitle => ROUTING_SUBTITLE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub exchange: &'static str,
    pub routing_key: &'static str,
    pub payload: Vec<u8>,
    pub priority: Option<u8>,
}

impl OutboundMessage {
    pub fn json<T: Serialize>(
        exchange: &'static str,
        routing_key: &'static str,
        body: &T,
    ) -> Result<Self> {
        Ok(Self {
            exchange,
            routing_key,
            payload: serde_json::to_vec(body).context("Failed to encode message")?,
            priority: None,
        })
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn transcode(task: &TranscodeTask) -> Result<Self> {
        let lane = Lane::for_video(task.immediate);
        let message = Self::json(EXCHANGE_TRANSCODE, lane.routing_key(), task)?;
        Ok(match lane {
            Lane::Priority => message.with_priority(IMMEDIATE_PRIORITY),
            _ => message,
        })
    }

    pub fn subtitle(task: &SubtitleTranscodeTask) -> Result<Self> {
        Self::json(EXCHANGE_TRANSCODE, Lane::Subtitle.routing_key(), task)
    }

    /// Cleanup scheduled through the delay exchange; the delay queue's TTL
    /// is the retention window of the job type.
    pub fn delayed_cleanup(task: &CleanupTask, job_type: JobType) -> Result<Self> {
        let routing_key = match job_type {
            JobType::Video => ROUTING_DELAY,
            JobType::Subtitle => ROUTING_DELAY_SUBTITLE,
        };
        Self::json(EXCHANGE_DELAY, routing_key, task)
    }
}

#[async_trait]
pub trait TaskPublisher: Send + Sync {
    async fn publish(&self, message: &OutboundMessage) -> Result<()>;
}

#[async_trait]
impl TaskPublisher for RabbitMqService {
    async fn publish(&self, message: &OutboundMessage) -> Result<()> {
        let mut properties = BasicProperties::default()
            .with_delivery_mode(2) // Persistent
            .with_content_type("application/json".into());
        if let Some(priority) = message.priority {
            properties = properties.with_priority(priority);
        }

        RabbitMqService::publish(
            self,
            message.exchange,
            message.routing_key,
            &message.payload,
            properties,
        )
        .await
    }
}
