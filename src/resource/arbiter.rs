//! Blocking, cancellable access to a shared resource pool
//!
//! Callers that cannot be served immediately are queued in request order. A
//! later, smaller request may overtake a blocked earlier one, but only a bounded
//! number of times per waiter.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::pool::{AllocationRequest, ResourceGrant, ResourcePool};
use super::snapshot::PoolSnapshot;
use crate::error::{ConfigurationError, ResourceError};
use crate::models::ResourceDemand;

/// How many times a queued request may be overtaken before it blocks the queue
pub const DEFAULT_MAX_BYPASS: usize = 8;

/// Point-in-time usage of the pool
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolUsage {
    pub capacity: BTreeMap<String, u32>,
    pub held: BTreeMap<String, u32>,
    pub grants: usize,
    pub waiters: usize,
}

struct Waiter {
    ticket: u64,
    request: AllocationRequest,
    bypassed: usize,
    tx: oneshot::Sender<Result<ResourceGrant, ResourceError>>,
}

struct ArbiterState {
    pool: ResourcePool,
    waiters: VecDeque<Waiter>,
    next_ticket: u64,
}

impl ArbiterState {
    /// A queued waiter has used up its bypass allowance
    fn starving(&self, max_bypass: usize) -> bool {
        self.waiters.iter().any(|w| w.bypassed >= max_bypass)
    }

    /// Hand out grants to queued waiters in order
    fn serve(&mut self, max_bypass: usize) {
        let mut index = 0;
        while index < self.waiters.len() {
            if self.waiters[index].tx.is_closed() {
                self.waiters.remove(index);
                continue;
            }

            let outcome = match self.pool.try_allocate(&self.waiters[index].request) {
                Ok(Some(grant)) => Some(Ok(grant)),
                Ok(None) => None,
                Err(e) => Some(Err(e)),
            };

            match outcome {
                Some(result) => {
                    for earlier in self.waiters.iter_mut().take(index) {
                        earlier.bypassed += 1;
                    }
                    if let Some(waiter) = self.waiters.remove(index) {
                        trace!(ticket = waiter.ticket, "Serving queued allocation");
                        if let Err(Ok(grant)) = waiter.tx.send(result) {
                            // receiver went away between the check and the send
                            let _ = self.pool.release(grant.id);
                        }
                    }
                }
                None => {
                    if self.waiters[index].bypassed >= max_bypass {
                        break;
                    }
                    index += 1;
                }
            }
        }
    }
}

/// Single point of arbitration over a [`ResourcePool`]
pub struct ResourceArbiter {
    state: Mutex<ArbiterState>,
    max_bypass: usize,
}

impl ResourceArbiter {
    pub fn new(pool: ResourcePool) -> Self {
        Self {
            state: Mutex::new(ArbiterState {
                pool,
                waiters: VecDeque::new(),
                next_ticket: 1,
            }),
            max_bypass: DEFAULT_MAX_BYPASS,
        }
    }

    pub fn from_snapshot(snapshot: &PoolSnapshot) -> Result<Self, ConfigurationError> {
        Ok(Self::new(ResourcePool::from_snapshot(snapshot)?))
    }

    pub fn with_max_bypass(mut self, max_bypass: usize) -> Self {
        self.max_bypass = max_bypass;
        self
    }

    pub async fn satisfiable(&self, demands: &[ResourceDemand]) -> Result<bool, ConfigurationError> {
        self.state.lock().await.pool.satisfiable(demands)
    }

    /// Reserve slots, waiting until they are free or `cancel` fires
    pub async fn allocate(
        &self,
        request: AllocationRequest,
        cancel: &CancellationToken,
    ) -> Result<ResourceGrant, ResourceError> {
        let (ticket, mut rx) = {
            let mut state = self.state.lock().await;
            state.pool.check_fits(&request)?;

            if !state.starving(self.max_bypass) {
                if let Some(grant) = state.pool.try_allocate(&request)? {
                    for waiter in state.waiters.iter_mut() {
                        waiter.bypassed += 1;
                    }
                    return Ok(grant);
                }
            }

            let (tx, rx) = oneshot::channel();
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            debug!(ticket, %request, queued = state.waiters.len(), "Waiting for resources");
            state.waiters.push_back(Waiter {
                ticket,
                request,
                bypassed: 0,
                tx,
            });
            (ticket, rx)
        };

        tokio::select! {
            result = &mut rx => result.unwrap_or(Err(ResourceError::Cancelled)),
            _ = cancel.cancelled() => {
                self.withdraw(ticket, rx).await;
                Err(ResourceError::Cancelled)
            }
        }
    }

    /// Remove a cancelled waiter, returning anything it was granted meanwhile
    async fn withdraw(
        &self,
        ticket: u64,
        mut rx: oneshot::Receiver<Result<ResourceGrant, ResourceError>>,
    ) {
        let mut state = self.state.lock().await;
        if let Some(pos) = state.waiters.iter().position(|w| w.ticket == ticket) {
            state.waiters.remove(pos);
            debug!(ticket, "Allocation cancelled while queued");
        } else if let Ok(Ok(grant)) = rx.try_recv() {
            debug!(ticket, grant = grant.id, "Allocation cancelled after grant; releasing");
            if let Err(e) = state.pool.release(grant.id) {
                warn!(grant = grant.id, error = %e, "Failed to return cancelled grant");
            }
        }
        // the departed waiter may have been holding others back
        state.serve(self.max_bypass);
    }

    /// Return a grant and wake whoever can now be served
    pub async fn release(&self, grant_id: u64) -> Result<(), ResourceError> {
        let mut state = self.state.lock().await;
        state.pool.release(grant_id)?;
        state.serve(self.max_bypass);
        Ok(())
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        self.state.lock().await.pool.snapshot()
    }

    pub async fn usage(&self) -> PoolUsage {
        let state = self.state.lock().await;
        let pool = &state.pool;
        let capacity = pool
            .types()
            .map(|t| (t.clone(), pool.capacity(t).unwrap_or(0)))
            .collect();
        let held = pool.types().map(|t| (t.clone(), pool.held(t))).collect();
        PoolUsage {
            capacity,
            held,
            grants: pool.outstanding_grants(),
            waiters: state.waiters.len(),
        }
    }
}
