//! Ingestion → router → output → pool.
//!
//! Inbound events drain concurrently through the router; every outbound event it yields
//! lands on the sequential output queue, which is the only path that delivers through the
//! channel pool. Failures stop at the item that caused them and are logged; nothing is
//! retried and nothing is reported back into the conversation.

use crate::channels::ChannelPool;
use crate::events::{InboundEvent, OutboundEvent, Payload};
use crate::queue::{QueueOutcome, TaskQueue};
use crate::router::CommandRouter;
use std::sync::Arc;

pub type IngestionQueue = TaskQueue<InboundEvent, Vec<OutboundEvent>>;
pub type OutputQueue = TaskQueue<OutboundEvent, ()>;

#[derive(Clone)]
pub struct Pipeline {
    router: Arc<CommandRouter>,
    pool: Arc<ChannelPool>,
    ingestion: IngestionQueue,
    output: OutputQueue,
}

impl Pipeline {
    pub fn new(router: Arc<CommandRouter>, pool: Arc<ChannelPool>) -> Self {
        let output = {
            let pool = pool.clone();
            OutputQueue::sequential(move |event: OutboundEvent| {
                let pool = pool.clone();
                async move {
                    deliver(&pool, event).await?;
                    Ok(None)
                }
            })
        };
        output.on_result(|outcome| {
            if let QueueOutcome::Failed(e) = outcome {
                log::warn!("output: delivery failed, dropping item: {:#}", e);
            }
        });

        let ingestion = {
            let router = router.clone();
            IngestionQueue::concurrent(move |event: InboundEvent| {
                let router = router.clone();
                async move {
                    let outbound = router.dispatch(event).await;
                    Ok((!outbound.is_empty()).then_some(outbound))
                }
            })
        };
        {
            let output = output.clone();
            ingestion.on_result(move |outcome| match outcome {
                QueueOutcome::Completed(events) => {
                    for event in events {
                        output.enqueue(event.clone());
                    }
                }
                QueueOutcome::Failed(e) => log::error!("ingestion: dispatch failed: {:#}", e),
            });
        }

        Self {
            router,
            pool,
            ingestion,
            output,
        }
    }

    /// Queue an inbound event for routing.
    pub fn ingest(&self, event: InboundEvent) {
        log::debug!(
            "ingestion: {} in {}",
            event.kind(),
            event.conversation_id()
        );
        self.ingestion.enqueue(event);
    }

    /// Queue an outbound event directly, bypassing the router.
    pub fn push_outbound(&self, event: OutboundEvent) {
        self.output.enqueue(event);
    }

    pub fn router(&self) -> &Arc<CommandRouter> {
        &self.router
    }

    pub fn pool(&self) -> &Arc<ChannelPool> {
        &self.pool
    }

    pub fn ingestion(&self) -> &IngestionQueue {
        &self.ingestion
    }

    pub fn output(&self) -> &OutputQueue {
        &self.output
    }

    /// Wait until both queues are idle.
    pub async fn wait_idle(&self) {
        loop {
            self.ingestion.wait_idle().await;
            self.output.wait_idle().await;
            if self.ingestion.is_idle() && self.output.is_idle() {
                return;
            }
        }
    }
}

/// Deliver one event, then remove its temporary files whether or not delivery succeeded.
async fn deliver(pool: &ChannelPool, event: OutboundEvent) -> anyhow::Result<()> {
    log::debug!("output: delivering to {}", event.target_conversation_id);
    let result = pool.deliver(&event).await;
    cleanup_attachments(&event.payload).await;
    result.map_err(anyhow::Error::from)
}

async fn cleanup_attachments(payload: &Payload) {
    for file in payload.attachments() {
        if !file.delete_after_use {
            continue;
        }
        if let Err(e) = tokio::fs::remove_file(&file.path).await {
            log::debug!("output: removing {} failed: {}", file.path.display(), e);
        }
    }
}
