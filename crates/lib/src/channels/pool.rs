//! Bounded pool of delivery channels keyed by conversation id.
//!
//! A hit refreshes the channel's last-used time. A miss opens a new channel while the
//! pool is below capacity; at capacity the channel with the globally oldest last-used
//! time is taken from its conversation and repointed at the new one. A background
//! reclaimer closes channels idle for longer than the idle timeout, independent of
//! pool pressure.
//!
//! The pool map sits behind an async mutex held across channel initialization and send,
//! so the reclaimer can never close a channel mid-delivery. The output path is the only
//! other writer.

use crate::channels::capability::{ChannelCapability, DeliveryChannel, DeliveryError};
use crate::config::PoolConfig;
use crate::events::OutboundEvent;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("opening channel for {conversation_id}: {source}")]
    Open {
        conversation_id: String,
        #[source]
        source: DeliveryError,
    },
    #[error("repointing channel from {from} to {to}: {source}")]
    Repoint {
        from: String,
        to: String,
        #[source]
        source: DeliveryError,
    },
    #[error("delivering to {conversation_id}: {source}")]
    Delivery {
        conversation_id: String,
        #[source]
        source: DeliveryError,
    },
    #[error("channel for {0} missing from pool")]
    Missing(String),
}

struct PooledChannel {
    channel: Box<dyn DeliveryChannel>,
    last_used_at: Instant,
}

pub struct ChannelPool {
    capability: Arc<dyn ChannelCapability>,
    max_channels: usize,
    idle_timeout: Option<Duration>,
    channels: Mutex<HashMap<String, PooledChannel>>,
}

impl ChannelPool {
    /// `max_channels` below 1 is treated as 1.
    pub fn new(capability: Arc<dyn ChannelCapability>, config: &PoolConfig) -> Self {
        Self {
            capability,
            max_channels: config.max_channels.max(1),
            idle_timeout: config.idle_timeout(),
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn capability(&self) -> Arc<dyn ChannelCapability> {
        self.capability.clone()
    }

    pub fn max_channels(&self) -> usize {
        self.max_channels
    }

    pub async fn len(&self) -> usize {
        self.channels.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Conversation ids with a live channel, sorted.
    pub async fn conversations(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.channels.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Get or create the channel for a conversation. The returned guard holds the pool
    /// lock; drop it before acquiring another channel. Not `Send` across awaits, so
    /// spawned delivery goes through [`ChannelPool::deliver`].
    pub async fn acquire(
        &self,
        conversation_id: &str,
    ) -> Result<MappedMutexGuard<'_, dyn DeliveryChannel>, PoolError> {
        let mut channels = self.channels.lock().await;
        self.get_or_create(&mut channels, conversation_id).await?;
        MutexGuard::try_map(channels, |c| {
            c.get_mut(conversation_id).map(|p| &mut *p.channel)
        })
        .map_err(|_| PoolError::Missing(conversation_id.to_string()))
    }

    /// Acquire the target's channel and send the payload. On send failure the channel stays pooled.
    pub async fn deliver(&self, event: &OutboundEvent) -> Result<(), PoolError> {
        let target = event.target_conversation_id.as_str();
        let mut channels = self.channels.lock().await;
        self.get_or_create(&mut channels, target).await?;
        let pooled = channels
            .get_mut(target)
            .ok_or_else(|| PoolError::Missing(target.to_string()))?;
        pooled
            .channel
            .send(&event.payload)
            .await
            .map_err(|source| PoolError::Delivery {
                conversation_id: target.to_string(),
                source,
            })
    }

    async fn get_or_create(
        &self,
        channels: &mut HashMap<String, PooledChannel>,
        conversation_id: &str,
    ) -> Result<(), PoolError> {
        if let Some(pooled) = channels.get_mut(conversation_id) {
            pooled.last_used_at = Instant::now();
            return Ok(());
        }

        if channels.len() < self.max_channels {
            let channel = self
                .capability
                .open(conversation_id)
                .await
                .map_err(|source| PoolError::Open {
                    conversation_id: conversation_id.to_string(),
                    source,
                })?;
            log::debug!("pool: opened channel for {}", conversation_id);
            channels.insert(
                conversation_id.to_string(),
                PooledChannel {
                    channel,
                    last_used_at: Instant::now(),
                },
            );
            return Ok(());
        }

        let oldest = channels
            .iter()
            .min_by_key(|(_, p)| p.last_used_at)
            .map(|(id, _)| id.clone());
        let Some(mut pooled) = oldest.and_then(|id| channels.remove(&id)) else {
            return Err(PoolError::Missing(conversation_id.to_string()));
        };
        let from = pooled.channel.conversation_id().to_string();
        log::info!(
            "pool: full ({} channels), moving least recently used channel from {} to {}",
            self.max_channels,
            from,
            conversation_id
        );
        if let Err(source) = pooled.channel.repoint(conversation_id).await {
            pooled.channel.close().await;
            return Err(PoolError::Repoint {
                from,
                to: conversation_id.to_string(),
                source,
            });
        }
        pooled.last_used_at = Instant::now();
        channels.insert(conversation_id.to_string(), pooled);
        Ok(())
    }

    /// Close and remove every channel idle for longer than the idle timeout. Returns how many were closed.
    pub async fn reclaim_idle(&self) -> usize {
        let Some(timeout) = self.idle_timeout else {
            return 0;
        };
        let mut channels = self.channels.lock().await;
        let now = Instant::now();
        let expired: Vec<String> = channels
            .iter()
            .filter(|(_, p)| now.duration_since(p.last_used_at) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(mut pooled) = channels.remove(id) {
                pooled.channel.close().await;
                log::info!("pool: closed idle channel for {}", id);
            }
        }
        expired.len()
    }

    /// Start the idle reclaimer, ticking every third of the idle timeout. None when idle
    /// reclamation is disabled. The task ends once the pool is dropped.
    pub fn spawn_reclaimer(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let period = self.idle_timeout? / 3;
        let pool = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                let closed = pool.reclaim_idle().await;
                if closed > 0 {
                    log::debug!("pool: reclaimed {} idle channel(s)", closed);
                }
            }
        }))
    }

    /// Close every channel (shutdown).
    pub async fn close_all(&self) {
        let mut channels = self.channels.lock().await;
        for (_, mut pooled) in channels.drain() {
            pooled.channel.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Payload;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    type Journal = Arc<StdMutex<Vec<String>>>;

    struct RecordingTransport {
        journal: Journal,
        fail_sends_to: Option<String>,
    }

    struct RecordingChannel {
        conversation_id: String,
        journal: Journal,
        fail_sends_to: Option<String>,
    }

    #[async_trait]
    impl ChannelCapability for RecordingTransport {
        fn id(&self) -> &str {
            "recording"
        }

        async fn open(
            &self,
            conversation_id: &str,
        ) -> Result<Box<dyn DeliveryChannel>, DeliveryError> {
            self.journal
                .lock()
                .unwrap()
                .push(format!("open {}", conversation_id));
            Ok(Box::new(RecordingChannel {
                conversation_id: conversation_id.to_string(),
                journal: self.journal.clone(),
                fail_sends_to: self.fail_sends_to.clone(),
            }))
        }
    }

    #[async_trait]
    impl DeliveryChannel for RecordingChannel {
        fn conversation_id(&self) -> &str {
            &self.conversation_id
        }

        async fn repoint(&mut self, conversation_id: &str) -> Result<(), DeliveryError> {
            self.journal
                .lock()
                .unwrap()
                .push(format!("repoint {} -> {}", self.conversation_id, conversation_id));
            self.conversation_id = conversation_id.to_string();
            Ok(())
        }

        async fn send(&mut self, payload: &Payload) -> Result<(), DeliveryError> {
            if self.fail_sends_to.as_deref() == Some(self.conversation_id.as_str()) {
                return Err(DeliveryError::Api("rejected".into()));
            }
            self.journal
                .lock()
                .unwrap()
                .push(format!("send {} {}", self.conversation_id, payload.text()));
            Ok(())
        }

        async fn close(&mut self) {
            self.journal
                .lock()
                .unwrap()
                .push(format!("close {}", self.conversation_id));
        }
    }

    fn pool(max_channels: usize, idle_timeout_secs: u64) -> (Arc<ChannelPool>, Journal) {
        pool_failing(max_channels, idle_timeout_secs, None)
    }

    fn pool_failing(
        max_channels: usize,
        idle_timeout_secs: u64,
        fail_sends_to: Option<&str>,
    ) -> (Arc<ChannelPool>, Journal) {
        let journal: Journal = Arc::default();
        let transport = Arc::new(RecordingTransport {
            journal: journal.clone(),
            fail_sends_to: fail_sends_to.map(str::to_string),
        });
        let config = PoolConfig {
            max_channels,
            idle_timeout_secs,
        };
        (Arc::new(ChannelPool::new(transport, &config)), journal)
    }

    async fn deliver(pool: &ChannelPool, to: &str) {
        pool.deliver(&OutboundEvent::text(to, "hi")).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reuses_channel_for_same_conversation() {
        let (pool, journal) = pool(2, 0);
        deliver(&pool, "a").await;
        deliver(&pool, "a").await;
        assert_eq!(pool.len().await, 1);
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["open a", "send a hi", "send a hi"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn full_pool_evicts_globally_oldest() {
        let (pool, journal) = pool(2, 0);
        deliver(&pool, "a").await;
        tokio::time::advance(Duration::from_secs(1)).await;
        deliver(&pool, "b").await;
        assert_eq!(pool.conversations().await, vec!["a", "b"]);

        tokio::time::advance(Duration::from_secs(1)).await;
        deliver(&pool, "c").await;
        assert_eq!(pool.conversations().await, vec!["b", "c"]);
        assert!(journal
            .lock()
            .unwrap()
            .contains(&"repoint a -> c".to_string()));
        assert_eq!(
            journal
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.starts_with("open"))
                .count(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn refreshed_channel_survives_eviction() {
        let (pool, journal) = pool(2, 0);
        deliver(&pool, "a").await;
        tokio::time::advance(Duration::from_secs(1)).await;
        deliver(&pool, "b").await;
        tokio::time::advance(Duration::from_secs(1)).await;
        deliver(&pool, "a").await;
        tokio::time::advance(Duration::from_secs(1)).await;
        deliver(&pool, "c").await;
        assert_eq!(pool.conversations().await, vec!["a", "c"]);
        assert!(journal
            .lock()
            .unwrap()
            .contains(&"repoint b -> c".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn pool_never_exceeds_capacity() {
        let (pool, _) = pool(3, 0);
        for n in 0..10 {
            deliver(&pool, &format!("conv-{}", n)).await;
            tokio::time::advance(Duration::from_millis(10)).await;
            assert!(pool.len().await <= 3);
        }
        assert_eq!(
            pool.conversations().await,
            vec!["conv-7", "conv-8", "conv-9"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_keeps_channel_pooled() {
        let (pool, _) = pool_failing(2, 0, Some("bad"));
        let err = pool
            .deliver(&OutboundEvent::text("bad", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Delivery { .. }));
        assert_eq!(pool.conversations().await, vec!["bad"]);
    }

    #[tokio::test]
    async fn deliver_runs_on_spawned_tasks() {
        let (pool, journal) = pool(1, 0);
        let tasks: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|to| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.deliver(&OutboundEvent::text(to, "hi")).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(pool.len().await, 1);
        let sends = journal
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with("send"))
            .count();
        assert_eq!(sends, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reclaimer_closes_idle_channels_without_pressure() {
        let (pool, journal) = pool(5, 3);
        let reclaimer = pool.spawn_reclaimer().unwrap();
        deliver(&pool, "quiet").await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        deliver(&pool, "busy").await;
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        // quiet: idle 4.5s > 3s, removed by the tick at 4s; busy: idle 2.5s, kept.
        assert_eq!(pool.conversations().await, vec!["busy"]);
        assert!(journal.lock().unwrap().contains(&"close quiet".to_string()));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(pool.is_empty().await);
        reclaimer.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn zero_idle_timeout_disables_reclaimer() {
        let (pool, _) = pool(1, 0);
        assert!(pool.spawn_reclaimer().is_none());
        deliver(&pool, "a").await;
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(pool.reclaim_idle().await, 0);
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn acquire_returns_channel_bound_to_conversation() {
        let (pool, journal) = pool(1, 0);
        {
            let channel = pool.acquire("x").await.unwrap();
            assert_eq!(channel.conversation_id(), "x");
        }
        let channel = pool.acquire("y").await.unwrap();
        assert_eq!(channel.conversation_id(), "y");
        drop(channel);
        pool.close_all().await;
        assert!(pool.is_empty().await);
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["open x", "repoint x -> y", "close y"]
        );
    }
}
