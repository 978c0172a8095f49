//! Cross-process resource broker
//!
//! A long-lived process owns the [`ResourceArbiter`] and serves it over TCP so
//! that independent batch jobs share one view of the pool. Each connection owns
//! the grants it received; when it drops, its queued allocations are cancelled
//! and its grants returned.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::arbiter::{PoolUsage, ResourceArbiter};
use super::codec::BincodeCodec;
use super::pool::{AllocationRequest, ResourceGrant};
use super::snapshot::PoolSnapshot;
use crate::error::ResourceError;
use crate::models::ResourceDemand;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BrokerRequest {
    Allocate {
        request_id: u64,
        request: AllocationRequest,
    },
    Cancel {
        request_id: u64,
    },
    Release {
        request_id: u64,
        grant_id: u64,
    },
    Satisfiable {
        request_id: u64,
        demands: Vec<ResourceDemand>,
    },
    Snapshot {
        request_id: u64,
    },
    Usage {
        request_id: u64,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BrokerResponse {
    Granted {
        request_id: u64,
        grant: ResourceGrant,
    },
    Released {
        request_id: u64,
    },
    Satisfiable {
        request_id: u64,
        satisfiable: bool,
    },
    Snapshot {
        request_id: u64,
        snapshot: PoolSnapshot,
    },
    Usage {
        request_id: u64,
        usage: PoolUsage,
    },
    Failed {
        request_id: u64,
        error: ResourceError,
    },
}

impl BrokerResponse {
    pub fn request_id(&self) -> u64 {
        match self {
            BrokerResponse::Granted { request_id, .. }
            | BrokerResponse::Released { request_id }
            | BrokerResponse::Satisfiable { request_id, .. }
            | BrokerResponse::Snapshot { request_id, .. }
            | BrokerResponse::Usage { request_id, .. }
            | BrokerResponse::Failed { request_id, .. } => *request_id,
        }
    }
}

type ServerCodec = BincodeCodec<BrokerResponse, BrokerRequest>;
type ClientCodec = BincodeCodec<BrokerRequest, BrokerResponse>;

/// Where a running broker can be reached
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rendezvous {
    pub addr: SocketAddr,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

impl Rendezvous {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            pid: std::process::id(),
            started_at: Utc::now(),
        }
    }

    /// Publish atomically; readers never see a half-written file
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }
        let tmp = path.with_extension("tmp");
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write rendezvous file: {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to publish rendezvous file: {}", path.display()))
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read rendezvous file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse rendezvous file: {}", path.display()))
    }
}

/// Serves one arbiter to any number of client connections
pub struct ResourceBroker {
    arbiter: Arc<ResourceArbiter>,
    shutdown: CancellationToken,
}

impl ResourceBroker {
    pub fn new(arbiter: Arc<ResourceArbiter>) -> Self {
        Self {
            arbiter,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the accept loop and every connection when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        info!(addr = %local, "Resource broker listening");

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = accepted.context("Failed to accept connection")?;
                    debug!(%peer, "Client connected");
                    connections.spawn(handle_connection(
                        self.arbiter.clone(),
                        stream,
                        self.shutdown.child_token(),
                    ));
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        while connections.join_next().await.is_some() {}
        info!("Resource broker stopped");
        Ok(())
    }
}

async fn handle_connection(
    arbiter: Arc<ResourceArbiter>,
    stream: TcpStream,
    shutdown: CancellationToken,
) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".into());
    let (mut sink, mut frames) = Framed::new(stream, ServerCodec::new()).split();

    let (tx, mut rx) = mpsc::unbounded_channel::<BrokerResponse>();
    let writer = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            if sink.send(response).await.is_err() {
                break;
            }
        }
    });

    let mut allocations: JoinSet<(u64, Result<ResourceGrant, ResourceError>)> = JoinSet::new();
    let mut pending: HashMap<u64, CancellationToken> = HashMap::new();
    let mut owned: HashSet<u64> = HashSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(joined) = allocations.join_next(), if !allocations.is_empty() => {
                let Ok((request_id, result)) = joined else {
                    warn!(%peer, "Allocation task aborted");
                    continue;
                };
                pending.remove(&request_id);
                let response = match result {
                    Ok(grant) => {
                        owned.insert(grant.id);
                        BrokerResponse::Granted { request_id, grant }
                    }
                    Err(error) => BrokerResponse::Failed { request_id, error },
                };
                let _ = tx.send(response);
            }
            frame = frames.next() => {
                let request = match frame {
                    Some(Ok(request)) => request,
                    Some(Err(e)) => {
                        warn!(%peer, error = %e, "Dropping connection on bad frame");
                        break;
                    }
                    None => break,
                };

                match request {
                    BrokerRequest::Allocate { request_id, request } => {
                        let token = CancellationToken::new();
                        pending.insert(request_id, token.clone());
                        let arbiter = arbiter.clone();
                        allocations.spawn(async move {
                            (request_id, arbiter.allocate(request, &token).await)
                        });
                    }
                    BrokerRequest::Cancel { request_id } => {
                        if let Some(token) = pending.get(&request_id) {
                            token.cancel();
                        }
                    }
                    BrokerRequest::Release { request_id, grant_id } => {
                        let response = if owned.remove(&grant_id) {
                            match arbiter.release(grant_id).await {
                                Ok(()) => BrokerResponse::Released { request_id },
                                Err(error) => BrokerResponse::Failed { request_id, error },
                            }
                        } else {
                            BrokerResponse::Failed {
                                request_id,
                                error: ResourceError::UnknownGrant(grant_id),
                            }
                        };
                        let _ = tx.send(response);
                    }
                    BrokerRequest::Satisfiable { request_id, demands } => {
                        let response = match arbiter.satisfiable(&demands).await {
                            Ok(satisfiable) => BrokerResponse::Satisfiable { request_id, satisfiable },
                            Err(e) => BrokerResponse::Failed { request_id, error: e.into() },
                        };
                        let _ = tx.send(response);
                    }
                    BrokerRequest::Snapshot { request_id } => {
                        let snapshot = arbiter.snapshot().await;
                        let _ = tx.send(BrokerResponse::Snapshot { request_id, snapshot });
                    }
                    BrokerRequest::Usage { request_id } => {
                        let usage = arbiter.usage().await;
                        let _ = tx.send(BrokerResponse::Usage { request_id, usage });
                    }
                }
            }
        }
    }

    for token in pending.values() {
        token.cancel();
    }
    while let Some(joined) = allocations.join_next().await {
        if let Ok((_, Ok(grant))) = joined {
            owned.insert(grant.id);
        }
    }
    if !owned.is_empty() {
        info!(%peer, grants = owned.len(), "Releasing grants of closed connection");
    }
    for grant_id in owned {
        if let Err(e) = arbiter.release(grant_id).await {
            warn!(%peer, grant = grant_id, error = %e, "Failed to release orphaned grant");
        }
    }

    drop(tx);
    let _ = writer.await;
    debug!(%peer, "Client disconnected");
}

/// Client side of the broker connection
pub struct BrokerClient {
    tx: mpsc::UnboundedSender<BrokerRequest>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<BrokerResponse>>>>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl BrokerClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to resource broker at {addr}"))?;
        let (mut sink, mut frames) = Framed::new(stream, ClientCodec::new()).split();

        let (tx, mut rx) = mpsc::unbounded_channel::<BrokerRequest>();
        let writer = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                if sink.send(request).await.is_err() {
                    break;
                }
            }
        });

        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<BrokerResponse>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = pending.clone();
        let reader_tx = tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(Ok(response)) = frames.next().await {
                let waiter = reader_pending.lock().await.remove(&response.request_id());
                match (waiter, response) {
                    (Some(waiter), response) => {
                        if let Err(BrokerResponse::Granted { grant, .. }) = waiter.send(response) {
                            let _ = reader_tx.send(BrokerRequest::Release {
                                request_id: 0,
                                grant_id: grant.id,
                            });
                        }
                    }
                    (None, BrokerResponse::Granted { grant, .. }) => {
                        // nobody is waiting for this grant any more
                        let _ = reader_tx.send(BrokerRequest::Release {
                            request_id: 0,
                            grant_id: grant.id,
                        });
                    }
                    (None, _) => {}
                }
            }
            // dropping the senders fails every outstanding call
            reader_pending.lock().await.clear();
        });

        info!(%addr, "Connected to resource broker");
        Ok(Self {
            tx,
            pending,
            next_id: AtomicU64::new(1),
            reader,
            writer,
        })
    }

    /// Connect to the broker published in a rendezvous file
    pub async fn connect_rendezvous(path: impl AsRef<Path>) -> Result<Self> {
        let rendezvous = Rendezvous::read(path)?;
        Self::connect(rendezvous.addr).await
    }

    fn closed() -> ResourceError {
        ResourceError::Broker("connection closed".into())
    }

    async fn register(&self) -> (u64, oneshot::Receiver<BrokerResponse>) {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);
        (request_id, rx)
    }

    async fn call(
        &self,
        build: impl FnOnce(u64) -> BrokerRequest,
    ) -> Result<BrokerResponse, ResourceError> {
        let (request_id, rx) = self.register().await;
        self.tx.send(build(request_id)).map_err(|_| Self::closed())?;
        match rx.await.map_err(|_| Self::closed())? {
            BrokerResponse::Failed { error, .. } => Err(error),
            response => Ok(response),
        }
    }

    fn unexpected(response: BrokerResponse) -> ResourceError {
        ResourceError::Broker(format!("unexpected response: {response:?}"))
    }

    pub async fn satisfiable(&self, demands: &[ResourceDemand]) -> Result<bool, ResourceError> {
        let demands = demands.to_vec();
        match self
            .call(|request_id| BrokerRequest::Satisfiable { request_id, demands })
            .await?
        {
            BrokerResponse::Satisfiable { satisfiable, .. } => Ok(satisfiable),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn allocate(
        &self,
        request: AllocationRequest,
        cancel: &CancellationToken,
    ) -> Result<ResourceGrant, ResourceError> {
        let (request_id, mut rx) = self.register().await;
        self.tx
            .send(BrokerRequest::Allocate {
                request_id,
                request,
            })
            .map_err(|_| Self::closed())?;

        tokio::select! {
            response = &mut rx => match response.map_err(|_| Self::closed())? {
                BrokerResponse::Granted { grant, .. } => Ok(grant),
                BrokerResponse::Failed { error, .. } => Err(error),
                other => Err(Self::unexpected(other)),
            },
            _ = cancel.cancelled() => {
                let _ = self.tx.send(BrokerRequest::Cancel { request_id });
                // the broker may have granted before it saw the cancel
                if let Ok(BrokerResponse::Granted { grant, .. }) = rx.await {
                    self.release(grant.id).await?;
                }
                Err(ResourceError::Cancelled)
            }
        }
    }

    pub async fn release(&self, grant_id: u64) -> Result<(), ResourceError> {
        match self
            .call(|request_id| BrokerRequest::Release {
                request_id,
                grant_id,
            })
            .await?
        {
            BrokerResponse::Released { .. } => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn snapshot(&self) -> Result<PoolSnapshot, ResourceError> {
        match self
            .call(|request_id| BrokerRequest::Snapshot { request_id })
            .await?
        {
            BrokerResponse::Snapshot { snapshot, .. } => Ok(snapshot),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn usage(&self) -> Result<PoolUsage, ResourceError> {
        match self
            .call(|request_id| BrokerRequest::Usage { request_id })
            .await?
        {
            BrokerResponse::Usage { usage, .. } => Ok(usage),
            other => Err(Self::unexpected(other)),
        }
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NodeAffinity;
    use std::collections::BTreeMap;
    use std::time::Duration;

    async fn start_broker(cpus: u32) -> (SocketAddr, Arc<ResourceArbiter>, CancellationToken) {
        let per_node = BTreeMap::from([("cpus".to_string(), cpus)]);
        let arbiter =
            Arc::new(ResourceArbiter::from_snapshot(&PoolSnapshot::uniform(1, &per_node)).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let broker = ResourceBroker::new(arbiter.clone());
        let shutdown = broker.shutdown_token();
        tokio::spawn(broker.serve(listener));
        (addr, arbiter, shutdown)
    }

    fn cpus(n: u32) -> AllocationRequest {
        AllocationRequest::new(vec![ResourceDemand::cpus(n)], NodeAffinity::Any)
    }

    #[tokio::test]
    async fn test_allocate_and_release_over_tcp() {
        let (addr, _arbiter, shutdown) = start_broker(4).await;
        let client = BrokerClient::connect(addr).await.unwrap();
        let token = CancellationToken::new();

        assert!(client.satisfiable(&[ResourceDemand::cpus(4)]).await.unwrap());
        assert!(!client.satisfiable(&[ResourceDemand::cpus(5)]).await.unwrap());
        assert!(matches!(
            client.satisfiable(&[ResourceDemand::gpus(1)]).await,
            Err(ResourceError::Configuration(_))
        ));

        let grant = client.allocate(cpus(3), &token).await.unwrap();
        assert_eq!(grant.slots("cpus"), 3);
        assert_eq!(client.usage().await.unwrap().held.get("cpus"), Some(&3));

        client.release(grant.id).await.unwrap();
        assert_eq!(
            client.release(grant.id).await,
            Err(ResourceError::UnknownGrant(grant.id))
        );
        assert_eq!(client.snapshot().await.unwrap().capacity("cpus"), Some(4));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_cancel_over_tcp() {
        let (addr, arbiter, shutdown) = start_broker(2).await;
        let client = BrokerClient::connect(addr).await.unwrap();
        let token = CancellationToken::new();
        let _held = client.allocate(cpus(2), &token).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let result = client.allocate(cpus(1), &cancel).await;
        assert_eq!(result, Err(ResourceError::Cancelled));
        assert_eq!(arbiter.usage().await.held.get("cpus"), Some(&2));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_releases_grants() {
        let (addr, arbiter, shutdown) = start_broker(2).await;
        let token = CancellationToken::new();

        let first = BrokerClient::connect(addr).await.unwrap();
        first.allocate(cpus(2), &token).await.unwrap();
        assert_eq!(arbiter.usage().await.held.get("cpus"), Some(&2));

        let second = BrokerClient::connect(addr).await.unwrap();
        let waiting = tokio::spawn(async move {
            let token = CancellationToken::new();
            second.allocate(cpus(2), &token).await
        });

        drop(first);
        let grant = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(grant.slots("cpus"), 2);
        shutdown.cancel();
    }

    #[test]
    fn test_rendezvous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.json");
        let rendezvous = Rendezvous::new("127.0.0.1:4100".parse().unwrap());

        rendezvous.write(&path).unwrap();
        assert_eq!(Rendezvous::read(&path).unwrap(), rendezvous);
        assert!(!path.with_extension("tmp").exists());
    }
}
