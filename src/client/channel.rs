// Notary channels - opaque request/reply byte exchange with a notary

use crate::notary::Notary;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Message dropped in transit")]
    Dropped,

    #[error("Channel closed: {0}")]
    Closed(String),
}

// ============================================================================
// NOTARY CHANNEL TRAIT
// ============================================================================

/// Transport seam between a session and its notary
#[async_trait]
pub trait NotaryChannel: Send + Sync {
    /// Send one encoded request and wait for the encoded reply
    async fn exchange(&self, request: Vec<u8>) -> Result<Vec<u8>, ChannelError>;
}

#[async_trait]
impl<C: NotaryChannel + ?Sized> NotaryChannel for Arc<C> {
    async fn exchange(&self, request: Vec<u8>) -> Result<Vec<u8>, ChannelError> {
        (**self).exchange(request).await
    }
}

// ============================================================================
// LOCAL CHANNEL
// ============================================================================

/// In-process channel straight into a notary
pub struct LocalChannel {
    notary: Arc<Notary>,
    call_count: AtomicUsize,
}

impl LocalChannel {
    pub fn new(notary: Arc<Notary>) -> Self {
        Self {
            notary,
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn notary(&self) -> &Arc<Notary> {
        &self.notary
    }

    /// Requests carried so far
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotaryChannel for LocalChannel {
    async fn exchange(&self, request: Vec<u8>) -> Result<Vec<u8>, ChannelError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let reply = self.notary.handle_bytes(&request).await;
        if reply.is_empty() {
            return Err(ChannelError::Closed("notary could not decode the request".to_string()));
        }
        Ok(reply)
    }
}

// ============================================================================
// FLAKY CHANNEL
// ============================================================================

/// Fault-injecting wrapper for testing delivery retries
pub struct FlakyChannel<C> {
    inner: C,
    delay_ms: u64,
    /// Requests lost before reaching the notary
    dropped_requests: AtomicUsize,
    /// Requests the notary handled whose replies are lost
    lost_replies: AtomicUsize,
    call_count: AtomicUsize,
}

impl<C: NotaryChannel> FlakyChannel<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            delay_ms: 0,
            dropped_requests: AtomicUsize::new(0),
            lost_replies: AtomicUsize::new(0),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Drop the next `count` requests before they are delivered
    pub fn with_dropped_requests(self, count: usize) -> Self {
        self.dropped_requests.store(count, Ordering::SeqCst);
        self
    }

    /// Deliver the next `count` requests but lose their replies
    pub fn with_lost_replies(self, count: usize) -> Self {
        self.lost_replies.store(count, Ordering::SeqCst);
        self
    }

    /// Add a delay before every reply
    pub fn with_delay_ms(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    /// Drop the next `count` requests from now on
    pub fn drop_next(&self, count: usize) {
        self.dropped_requests.store(count, Ordering::SeqCst);
    }

    /// Lose the replies to the next `count` delivered requests
    pub fn lose_next(&self, count: usize) {
        self.lost_replies.store(count, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl<C: NotaryChannel> NotaryChannel for FlakyChannel<C> {
    async fn exchange(&self, request: Vec<u8>) -> Result<Vec<u8>, ChannelError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        if Self::take(&self.dropped_requests) {
            return Err(ChannelError::Dropped);
        }

        let reply = self.inner.exchange(request).await?;
        if Self::take(&self.lost_replies) {
            return Err(ChannelError::Dropped);
        }
        Ok(reply)
    }
}
