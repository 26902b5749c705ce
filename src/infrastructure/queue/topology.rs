//! Exchange / queue layout of the transcode pipeline.
//!
//! ```text
//! transcode ──task.normal──▶ transcode.normal   ─┐ (reject / ttl)
//!           ──task.priority─▶ transcode.priority ─┼──▶ transcode.dlx ──task.failed──▶ transcode.dlq
//!           ──task.subtitle─▶ transcode.subtitle ─┘
//!           ──task.cleanup──▶ task.cleanup
//! cleanup.delay ──task.delay──────────▶ cleanup.delay          ─┐ (ttl expiry)
//!               ──task.delay.subtitle─▶ cleanup.delay.subtitle ─┴──▶ transcode / task.cleanup
//! ```
//!
//! Queue arguments are fixed at first declaration; changing a TTL later
//! requires deleting the queue on the broker.

use anyhow::{Context, Result};
use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, ExchangeKind};
use std::time::Duration;
use tracing::info;

pub const EXCHANGE_TRANSCODE: &str = "transcode";
pub const EXCHANGE_DLX: &str = "transcode.dlx";
pub const EXCHANGE_DELAY: &str = "cleanup.delay";

pub const QUEUE_NORMAL: &str = "transcode.normal";
pub const QUEUE_PRIORITY: &str = "transcode.priority";
pub const QUEUE_SUBTITLE: &str = "transcode.subtitle";
pub const QUEUE_DLQ: &str = "transcode.dlq";
pub const QUEUE_DELAY: &str = "cleanup.delay";
pub const QUEUE_DELAY_SUBTITLE: &str = "cleanup.delay.subtitle";
pub const QUEUE_CLEANUP: &str = "task.cleanup";

pub const ROUTING_NORMAL: &str = "task.normal";
pub const ROUTING_PRIORITY: &str = "task.priority";
pub const ROUTING_SUBTITLE: &str = "task.subtitle";
pub const ROUTING_FAILED: &str = "task.failed";
pub const ROUTING_DELAY: &str = "task.delay";
pub const ROUTING_DELAY_SUBTITLE: &str = "task.delay.subtitle";
pub const ROUTING_CLEANUP: &str = "task.cleanup";

/// Stale queued work on the normal lane expires instead of running late.
pub const NORMAL_QUEUE_TTL: Duration = Duration::from_secs(60 * 60);
pub const MAX_PRIORITY: u8 = 10;
pub const IMMEDIATE_PRIORITY: u8 = 9;

#[derive(Debug, Clone, Copy)]
pub struct TopologySettings {
    pub video_retention: Duration,
    pub subtitle_retention: Duration,
}

fn ttl_millis(ttl: Duration) -> AMQPValue {
    AMQPValue::LongInt(i32::try_from(ttl.as_millis()).unwrap_or(i32::MAX))
}

fn dead_letter_args(exchange: &str, routing_key: &str) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(exchange.into()),
    );
    args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(routing_key.into()),
    );
    args
}

/// Argument tables for every queue, in declaration order.
pub fn queue_arguments(settings: &TopologySettings) -> Vec<(&'static str, FieldTable)> {
    let mut normal = dead_letter_args(EXCHANGE_DLX, ROUTING_FAILED);
    normal.insert("x-message-ttl".into(), ttl_millis(NORMAL_QUEUE_TTL));

    let mut priority = dead_letter_args(EXCHANGE_DLX, ROUTING_FAILED);
    priority.insert(
        "x-max-priority".into(),
        AMQPValue::LongInt(i32::from(MAX_PRIORITY)),
    );

    let subtitle = dead_letter_args(EXCHANGE_DLX, ROUTING_FAILED);

    let mut delay = dead_letter_args(EXCHANGE_TRANSCODE, ROUTING_CLEANUP);
    delay.insert("x-message-ttl".into(), ttl_millis(settings.video_retention));

    let mut delay_subtitle = dead_letter_args(EXCHANGE_TRANSCODE, ROUTING_CLEANUP);
    delay_subtitle.insert(
        "x-message-ttl".into(),
        ttl_millis(settings.subtitle_retention),
    );

    vec![
        (QUEUE_NORMAL, normal),
        (QUEUE_PRIORITY, priority),
        (QUEUE_SUBTITLE, subtitle),
        (QUEUE_DLQ, FieldTable::default()),
        (QUEUE_DELAY, delay),
        (QUEUE_DELAY_SUBTITLE, delay_subtitle),
        (QUEUE_CLEANUP, FieldTable::default()),
    ]
}

/// (queue, exchange, routing key)
pub const BINDINGS: [(&str, &str, &str); 7] = [
    (QUEUE_NORMAL, EXCHANGE_TRANSCODE, ROUTING_NORMAL),
    (QUEUE_PRIORITY, EXCHANGE_TRANSCODE, ROUTING_PRIORITY),
    (QUEUE_SUBTITLE, EXCHANGE_TRANSCODE, ROUTING_SUBTITLE),
    (QUEUE_CLEANUP, EXCHANGE_TRANSCODE, ROUTING_CLEANUP),
    (QUEUE_DLQ, EXCHANGE_DLX, ROUTING_FAILED),
    (QUEUE_DELAY, EXCHANGE_DELAY, ROUTING_DELAY),
    (QUEUE_DELAY_SUBTITLE, EXCHANGE_DELAY, ROUTING_DELAY_SUBTITLE),
];

pub async fn declare(channel: &Channel, settings: &TopologySettings) -> Result<()> {
    for exchange in [EXCHANGE_TRANSCODE, EXCHANGE_DLX, EXCHANGE_DELAY] {
        channel
            .exchange_declare(
                exchange.into(),
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("Failed to declare exchange {}", exchange))?;
    }

    for (queue, args) in queue_arguments(settings) {
        channel
            .queue_declare(
                queue.into(),
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                args,
            )
            .await
            .with_context(|| format!("Failed to declare queue {}", queue))?;
    }

    for (queue, exchange, routing_key) in BINDINGS {
        channel
            .queue_bind(
                queue.into(),
                exchange.into(),
                routing_key.into(),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("Failed to bind {} to {}", queue, exchange))?;
    }

    info!("Transcode queue topology declared");
    Ok(())
}
