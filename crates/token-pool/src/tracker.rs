//! Per-provider token exhaustion tracking and selection
//!
//! `TokenTracker` is the single handle through which the status store is read
//! and mutated. The token lists themselves belong to the caller and are passed
//! to every call; the tracker only owns the flags keyed by their members.

use std::sync::Arc;

use provider::ProviderId;
use serde::Serialize;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::store::{self, MemoryBackend, StatusBackend, TokenStatusStore};

/// Token counts for one provider's configured list.
///
/// `active + exhausted == total` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TokenStats {
    pub total: usize,
    pub active: usize,
    pub exhausted: usize,
}

/// Handle over the persisted exhaustion state.
///
/// Cheap to clone; clones share the same backend and clock.
#[derive(Clone)]
pub struct TokenTracker {
    backend: Arc<dyn StatusBackend>,
    clock: Arc<dyn Clock>,
}

impl TokenTracker {
    pub fn new(backend: Arc<dyn StatusBackend>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    /// Tracker with an in-process store and the wall clock.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), Arc::new(SystemClock))
    }

    /// Current state, after the daily reset is applied.
    pub async fn snapshot(&self) -> TokenStatusStore {
        store::read_current(self.backend.as_ref(), self.clock.today()).await
    }

    /// Flag `token` as exhausted under `provider` until the next UTC day.
    ///
    /// Calling it again for an already-flagged token does nothing.
    pub async fn mark_exhausted(&self, provider: ProviderId, token: &str) -> Result<()> {
        let mut current = self.snapshot().await;
        if !current.mark(provider, token) {
            return Ok(());
        }
        store::persist(self.backend.as_ref(), &current).await?;

        let flagged = current
            .exhausted
            .get(provider.as_str())
            .map_or(0, |tokens| tokens.values().filter(|f| **f).count());
        info!(
            provider = provider.as_str(),
            exhausted_today = flagged,
            "token marked exhausted until next UTC day"
        );
        metrics::counter!("token_rotations_total", "provider" => provider.as_str())
            .increment(1);
        Ok(())
    }

    pub async fn is_exhausted(&self, provider: ProviderId, token: &str) -> bool {
        self.snapshot().await.is_exhausted(provider, token)
    }

    /// Clear every flag for one provider. Other providers are untouched.
    pub async fn reset_provider(&self, provider: ProviderId) -> Result<()> {
        let mut current = self.snapshot().await;
        current.clear_provider(provider);
        store::persist(self.backend.as_ref(), &current).await?;
        info!(provider = provider.as_str(), "token exhaustion reset");
        Ok(())
    }

    /// Clear every flag for every provider and re-date the store to today.
    pub async fn reset_all(&self) -> Result<()> {
        let fresh = TokenStatusStore::empty(self.clock.today());
        store::persist(self.backend.as_ref(), &fresh).await?;
        info!("token exhaustion reset for all providers");
        Ok(())
    }

    /// First token in list order that is not exhausted for `provider`.
    ///
    /// Deterministic: as long as the first token stays unflagged it is always
    /// the one returned.
    pub async fn next_available(&self, provider: ProviderId, tokens: &[String]) -> Option<String> {
        if tokens.is_empty() {
            return None;
        }
        let current = self.snapshot().await;
        tokens
            .iter()
            .find(|token| !current.is_exhausted(provider, token))
            .cloned()
    }

    pub async fn stats(&self, provider: ProviderId, tokens: &[String]) -> TokenStats {
        let current = self.snapshot().await;
        let exhausted = tokens
            .iter()
            .filter(|token| current.is_exhausted(provider, token))
            .count();
        TokenStats {
            total: tokens.len(),
            active: tokens.len() - exhausted,
            exhausted,
        }
    }
}
