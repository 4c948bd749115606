//! Nonce management for the signing account
//!
//! All allocation and resync happens inside one async mutex, so at most one
//! allocation is in flight at a time. Nonces handed out and not yet released
//! are tracked; a resync never reissues one of them.

use ethers::types::Address;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::LedgerResult;
use crate::rpc::LedgerRpc;

#[derive(Debug, Default)]
struct NonceState {
    /// Next nonce to hand out; `None` until first synced
    next: Option<u64>,
    /// Allocated, not yet released
    outstanding: BTreeSet<u64>,
    /// A gap was left behind; resync before the next allocation
    needs_resync: bool,
    resyncs: u64,
}

/// Single source of truth for the submitting account's nonce
pub struct NonceManager {
    rpc: Arc<dyn LedgerRpc>,
    address: Address,
    state: Mutex<NonceState>,
}

impl NonceManager {
    pub fn new(rpc: Arc<dyn LedgerRpc>, address: Address) -> Self {
        Self {
            rpc,
            address,
            state: Mutex::new(NonceState::default()),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Hand out the next nonce
    pub async fn allocate(&self) -> LedgerResult<u64> {
        let mut state = self.state.lock().await;
        if state.next.is_none() || state.needs_resync {
            self.resync_locked(&mut state).await?;
        }
        let nonce = state.next.unwrap_or_default();
        state.next = Some(nonce + 1);
        state.outstanding.insert(nonce);
        debug!("Allocated nonce {} for {:?}", nonce, self.address);
        Ok(nonce)
    }

    /// Re-read the pending nonce from the ledger
    pub async fn resync(&self) -> LedgerResult<u64> {
        let mut state = self.state.lock().await;
        self.resync_locked(&mut state).await
    }

    async fn resync_locked(&self, state: &mut NonceState) -> LedgerResult<u64> {
        let chain = self.rpc.pending_nonce(self.address).await?;
        let above_outstanding = state.outstanding.iter().next_back().map(|n| n + 1);
        let next = above_outstanding.map_or(chain, |n| n.max(chain));
        info!(
            "Nonce resync for {:?}: chain={} local={:?} -> {}",
            self.address, chain, state.next, next
        );
        state.next = Some(next);
        state.needs_resync = false;
        state.resyncs += 1;
        Ok(next)
    }

    /// Return a nonce. `consumed` means the ledger accepted a transaction
    /// with it. An unconsumed nonce that was the latest allocation is rolled
    /// back; an older one leaves a gap and forces a resync.
    pub async fn release(&self, nonce: u64, consumed: bool) {
        let mut state = self.state.lock().await;
        if !state.outstanding.remove(&nonce) {
            debug!("Release of untracked nonce {}", nonce);
            return;
        }
        if consumed {
            return;
        }
        if state.next == Some(nonce + 1) {
            state.next = Some(nonce);
            debug!("Rolled back unused nonce {}", nonce);
        } else if state.next.map_or(false, |next| nonce < next) {
            warn!("Unused nonce {} left a gap, resync scheduled", nonce);
            state.needs_resync = true;
        }
    }

    /// Next nonce that would be handed out, if known
    pub async fn peek(&self) -> Option<u64> {
        self.state.lock().await.next
    }

    pub async fn resync_count(&self) -> u64 {
        self.state.lock().await.resyncs
    }
}
