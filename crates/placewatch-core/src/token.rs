//! Operation tokens
//!
//! Every reconciliation cycle runs under a token. Navigating to a new place
//! invalidates all live tokens and mints a fresh one in a single atomic
//! update; in-flight cycles notice at their next liveness poll and stop.
//! Nothing is ever forcibly killed.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Identity of one reconciliation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpToken(Uuid);

impl OpToken {
    pub fn id(&self) -> Uuid {
        self.0
    }
}

/// Live-token registry. At most one token is live at any instant.
#[derive(Clone)]
pub struct TokenManager {
    live: Arc<RwLock<HashSet<Uuid>>>,
}

impl TokenManager {
    pub fn new() -> Self {
        Self { live: Arc::new(RwLock::new(HashSet::new())) }
    }

    /// Invalidate everything live and mint the successor under one write
    /// lock: no instant with two live tokens, no instant where the old
    /// token survives the mint.
    pub async fn mint(&self) -> OpToken {
        let token = OpToken(Uuid::new_v4());
        let mut live = self.live.write().await;
        live.clear();
        live.insert(token.0);
        debug!(token = %token.0, "minted operation token");
        token
    }

    pub async fn is_live(&self, token: &OpToken) -> bool {
        self.live.read().await.contains(&token.0)
    }

    /// Retire one token after completion or abandonment.
    pub async fn retire(&self, token: &OpToken) {
        self.live.write().await.remove(&token.0);
    }

    /// Invalidate every live token without minting a successor. Used when
    /// leaving the entity view and on shutdown.
    pub async fn invalidate_all(&self) {
        self.live.write().await.clear();
    }

    pub async fn live_count(&self) -> usize {
        self.live.read().await.len()
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Attempt bookkeeping for one token's bounded retry.
///
/// The ceiling counts total attempts, not re-attempts: a ceiling of 3 means
/// the cycle runs at most three times before silent abandonment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    attempt: u32,
    ceiling: u32,
}

impl RetryState {
    pub fn new(ceiling: u32) -> Self {
        Self { attempt: 0, ceiling }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    /// True while another attempt is allowed.
    pub fn can_attempt(&self) -> bool {
        self.attempt < self.ceiling
    }

    pub fn record_attempt(&mut self) {
        self.attempt += 1;
    }
}
