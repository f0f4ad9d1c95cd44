//! Publish/subscribe SPI for invalidation messages.

use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Receives messages published on a channel.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Handles one message.
    async fn on_message(&self, channel: &str, payload: Bytes);
}

/// A message bus shared by every process.
#[async_trait]
pub trait PubSub: Send + Sync + fmt::Debug {
    /// Registers `subscriber` on `channel` under `id`, replacing any previous one.
    async fn subscribe(
        &self,
        channel: &str,
        id: &str,
        subscriber: Arc<dyn Subscriber>,
    ) -> CacheResult<()>;

    /// Removes the subscriber registered under `id`.
    async fn unsubscribe(&self, channel: &str, id: &str) -> CacheResult<()>;

    /// Delivers `payload` to every subscriber of `channel`, the publisher included.
    async fn publish(&self, channel: &str, payload: Bytes) -> CacheResult<()>;
}

type Channels = HashMap<String, Vec<(String, Arc<dyn Subscriber>)>>;

/// In-process [`PubSub`] that delivers synchronously inside `publish`.
///
/// Delivery completes before `publish` returns, which makes cross-process
/// invalidation deterministic in tests.
pub struct MemoryPubSub {
    channels: Mutex<Channels>,
    available: AtomicBool,
    published: AtomicU64,
}

impl MemoryPubSub {
    /// Creates a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            published: AtomicU64::new(0),
        }
    }

    /// Makes `publish` fail (or succeed again).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of messages published so far.
    #[must_use]
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// Number of subscribers on `channel`.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.lock().get(channel).map_or(0, Vec::len)
    }
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryPubSub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let channels = self.channels.lock();
        f.debug_struct("MemoryPubSub")
            .field("channels", &channels.keys().collect::<Vec<_>>())
            .field("published", &self.published())
            .finish()
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn subscribe(
        &self,
        channel: &str,
        id: &str,
        subscriber: Arc<dyn Subscriber>,
    ) -> CacheResult<()> {
        let mut channels = self.channels.lock();
        let subs = channels.entry(channel.to_string()).or_default();
        subs.retain(|(existing, _)| existing != id);
        subs.push((id.to_string(), subscriber));
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str, id: &str) -> CacheResult<()> {
        let mut channels = self.channels.lock();
        if let Some(subs) = channels.get_mut(channel) {
            subs.retain(|(existing, _)| existing != id);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> CacheResult<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(CacheError::unavailable("pub/sub unreachable"));
        }
        let subscribers: Vec<_> = self
            .channels
            .lock()
            .get(channel)
            .map(|subs| subs.iter().map(|(_, s)| Arc::clone(s)).collect())
            .unwrap_or_default();
        self.published.fetch_add(1, Ordering::SeqCst);
        for subscriber in subscribers {
            subscriber.on_message(channel, payload.clone()).await;
        }
        Ok(())
    }
}
