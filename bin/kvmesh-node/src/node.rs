//! Node composition and command dispatch

use async_trait::async_trait;
use kvmesh_cluster::{MessageHandler, RoutingTable, TaskGroup, Transport};
use kvmesh_common::{Config, Error, Member, PartitionId, PartitionKind, Result, RoutingTableView, hash_key};
use kvmesh_dmap::{Balancer, DMapService};
use kvmesh_placement::HrwPlacement;
use kvmesh_proto::messages::{decode_message, partition_kind};
use kvmesh_proto::{
    DataRequest, DataResponse, Kind, LengthOfPartRequest, LengthOfPartResponse, Operation,
    ScanRequest, ScanResponse, SystemMessage,
};
use kvmesh_storage::Entry;
use kvmesh_storage::entry::{now_millis, now_nanos};
use prost::Message;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Keys returned by a scan page when the caller does not say
pub const DEFAULT_SCAN_COUNT: usize = 100;

/// One cluster member
pub struct Node {
    config: Config,
    routing: Arc<RoutingTable>,
    dmap: Arc<DMapService>,
    balancer: Arc<Balancer>,
    transport: Arc<dyn Transport>,
    tasks: TaskGroup,
    server_stop: CancellationToken,
    started_at: Instant,
}

impl Node {
    /// Build a node with the default placement, engine and comparator
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let routing = Arc::new(RoutingTable::new(
            Member::new(config.advertise_name()),
            config.cluster.clone(),
            Arc::new(HrwPlacement::new()),
            Arc::clone(&transport),
        ));
        let dmap = Arc::new(DMapService::with_defaults(
            Arc::clone(&routing),
            Arc::clone(&transport),
            &config,
        ));
        let balancer = Arc::new(Balancer::new(Arc::clone(&dmap), config.balancer.interval()));
        Ok(Self::from_parts(config, routing, dmap, balancer, transport))
    }

    /// Assemble a node from already built components
    #[must_use]
    pub fn from_parts(
        config: Config,
        routing: Arc<RoutingTable>,
        dmap: Arc<DMapService>,
        balancer: Arc<Balancer>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config,
            routing,
            dmap,
            balancer,
            transport,
            tasks: TaskGroup::new(),
            server_stop: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn this(&self) -> &Member {
        self.routing.this()
    }

    #[must_use]
    pub const fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    #[must_use]
    pub const fn dmap(&self) -> &Arc<DMapService> {
        &self.dmap
    }

    #[must_use]
    pub const fn balancer(&self) -> &Arc<Balancer> {
        &self.balancer
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Cancelled once the node has shut down; the HTTP server drains on it
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.server_stop.clone()
    }

    /// Check whether data operations are currently accepted
    #[must_use]
    pub fn is_operable(&self) -> bool {
        self.dmap.check_operable().is_ok()
    }

    /// Externally visible routing table, one row per partition
    #[must_use]
    pub fn routing_table(&self) -> RoutingTableView {
        self.routing.routes()
    }

    /// Bootstrap the routing table and start the background loops
    pub async fn start(&self) {
        self.routing.bootstrap().await;

        let routing = Arc::clone(&self.routing);
        self.tasks.spawn("routing", move |_| routing.run());
        let balancer = Arc::clone(&self.balancer);
        self.tasks.spawn("balancer", move |_| balancer.run());

        info!(
            "Node {} started (routing table version {}, {} members)",
            self.this(),
            self.routing.version(),
            self.routing.members().len()
        );
    }

    /// Stop every component.
    ///
    /// Order: dmap service, balancer, routing table, HTTP server. Every step
    /// runs even if an earlier one failed; the last error is returned.
    pub async fn shutdown(&self) -> Result<()> {
        let mut last_err = None;
        if let Err(e) = self.dmap.shutdown().await {
            warn!("Failed to stop dmap service: {}", e);
            last_err = Some(e);
        }
        if let Err(e) = self.balancer.shutdown() {
            warn!("Failed to stop balancer: {}", e);
            last_err = Some(e);
        }
        if let Err(e) = self.routing.shutdown() {
            warn!("Failed to stop routing table: {}", e);
            last_err = Some(e);
        }
        if self.server_stop.is_cancelled() {
            last_err = Some(Error::ServerGone);
        } else {
            self.server_stop.cancel();
        }
        self.tasks.shutdown().await;

        match last_err {
            Some(e) => Err(e),
            None => {
                info!("Node {} stopped", self.this());
                Ok(())
            }
        }
    }

    /// Serve one system message
    pub async fn dispatch(&self, message: SystemMessage) -> Result<Vec<u8>> {
        let op = message.operation()?;
        if op.touches_data() {
            self.dmap.check_operable()?;
        }
        match op {
            Operation::MoveFragment => {
                self.dmap.import_fragment(&message.value).await?;
                Ok(Vec::new())
            }
            Operation::UpdateRouting => self.routing.handle_update(&message.value),
            Operation::Ping => self.routing.handle_ping(&message.value),
            Operation::ClusterRoutingTable => {
                Ok(self.routing.routing_table_response().encode_to_vec())
            }
            Operation::LengthOfPartition => {
                let request: LengthOfPartRequest = decode_message(&message.value)?;
                let kind = partition_kind(request.kind)?;
                let length = self.dmap.length_of_partition(request.part_id, kind);
                Ok(LengthOfPartResponse { length }.encode_to_vec())
            }
            Operation::Put => self.serve_put(decode_message(&message.value)?).await,
            Operation::Get => self.serve_get(decode_message(&message.value)?).await,
            Operation::Delete => self.serve_delete(decode_message(&message.value)?).await,
            Operation::Scan => self.serve_scan(decode_message(&message.value)?).await,
        }
    }

    /// Primary owner of `request`'s key when that is another member
    fn redirect_target(&self, request: &DataRequest, kind: PartitionKind) -> Result<Option<Member>> {
        if request.key.is_empty() {
            return Err(Error::invalid_argument("key must not be empty"));
        }
        if request.forwarded || kind == PartitionKind::Backup {
            return Ok(None);
        }
        let part_id = self.routing.partition_id(hash_key(&request.key));
        let owner = self
            .routing
            .partition(part_id, PartitionKind::Primary)
            .owner()
            .ok_or_else(|| Error::ServiceUnavailable(format!("partition {part_id} has no owner")))?;
        if owner.compare_by_id(self.this()) {
            return Ok(None);
        }
        Ok(Some(owner))
    }

    async fn forward(&self, target: &Member, op: Operation, mut request: DataRequest) -> Result<Vec<u8>> {
        debug!("Forwarding {} on {}/{} to {}", op, request.dmap, request.key, target);
        request.forwarded = true;
        self.transport
            .request(target, SystemMessage::new(op, request.encode_to_vec()))
            .await
    }

    /// Apply a primary write to the partition's backup owners
    async fn replicate(&self, op: Operation, mut request: DataRequest) {
        let part_id = self.routing.partition_id(hash_key(&request.key));
        let backups = self.routing.partition(part_id, PartitionKind::Backup).owners();
        request.kind = Kind::Backup as i32;
        request.forwarded = true;
        let payload = request.encode_to_vec();

        let this = self.this();
        let writes = backups
            .iter()
            .filter(|member| !member.compare_by_id(this))
            .map(|member| {
                let message = SystemMessage::new(op, payload.clone());
                async move { (member, self.transport.request(member, message).await) }
            });
        for (member, result) in futures::future::join_all(writes).await {
            if let Err(e) = result {
                warn!(
                    "Failed to replicate {} on {}/{} to {}: {}",
                    op, request.dmap, request.key, member, e
                );
            }
        }
    }

    async fn serve_put(&self, mut request: DataRequest) -> Result<Vec<u8>> {
        let kind = partition_kind(request.kind)?;
        if let Some(owner) = self.redirect_target(&request, kind)? {
            return self.forward(&owner, Operation::Put, request).await;
        }
        if request.timestamp == 0 {
            request.timestamp = now_nanos();
        }
        let entry = Entry::with_version(
            request.key.clone(),
            request.value.clone(),
            request.timestamp,
            request.ttl,
        );
        self.dmap.put(&request.dmap, kind, entry).await?;
        if kind == PartitionKind::Primary {
            self.replicate(Operation::Put, request).await;
        }
        Ok(Vec::new())
    }

    async fn serve_get(&self, request: DataRequest) -> Result<Vec<u8>> {
        let kind = partition_kind(request.kind)?;
        if let Some(owner) = self.redirect_target(&request, kind)? {
            return self.forward(&owner, Operation::Get, request).await;
        }
        let entry = self.dmap.get(&request.dmap, kind, &request.key).await?;
        Ok(DataResponse {
            value: entry.value,
            timestamp: entry.timestamp,
            ttl: entry.ttl,
        }
        .encode_to_vec())
    }

    async fn serve_delete(&self, request: DataRequest) -> Result<Vec<u8>> {
        let kind = partition_kind(request.kind)?;
        if let Some(owner) = self.redirect_target(&request, kind)? {
            return self.forward(&owner, Operation::Delete, request).await;
        }
        self.dmap.delete(&request.dmap, kind, &request.key).await?;
        if kind == PartitionKind::Primary {
            self.replicate(Operation::Delete, request).await;
        }
        Ok(Vec::new())
    }

    async fn serve_scan(&self, request: ScanRequest) -> Result<Vec<u8>> {
        let kind = partition_kind(request.kind)?;
        let count = match request.count {
            0 => DEFAULT_SCAN_COUNT,
            n => n as usize,
        };
        let (cursor, keys) = self
            .dmap
            .scan(&request.dmap, request.part_id, kind, request.cursor, count)
            .await?;
        Ok(ScanResponse { cursor, keys }.encode_to_vec())
    }

    /// Store `value` under `key`, routed to the key's primary owner
    pub async fn put(&self, dmap: &str, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let expires = ttl.map_or(0, |ttl| {
            now_millis().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
        });
        let request = DataRequest {
            dmap: dmap.to_string(),
            key: key.to_string(),
            value,
            ttl: expires,
            ..DataRequest::default()
        };
        self.dispatch(SystemMessage::new(Operation::Put, request.encode_to_vec()))
            .await
            .map(|_| ())
    }

    /// Fetch the live value of `key`
    pub async fn get(&self, dmap: &str, key: &str) -> Result<DataResponse> {
        let request = DataRequest {
            dmap: dmap.to_string(),
            key: key.to_string(),
            ..DataRequest::default()
        };
        let response = self
            .dispatch(SystemMessage::new(Operation::Get, request.encode_to_vec()))
            .await?;
        decode_message(&response)
    }

    /// Delete `key`; a missing key is not an error
    pub async fn delete(&self, dmap: &str, key: &str) -> Result<()> {
        let request = DataRequest {
            dmap: dmap.to_string(),
            key: key.to_string(),
            ..DataRequest::default()
        };
        self.dispatch(SystemMessage::new(Operation::Delete, request.encode_to_vec()))
            .await
            .map(|_| ())
    }

    /// One page of the keys this member holds in a partition
    pub async fn scan(
        &self,
        dmap: &str,
        part_id: PartitionId,
        kind: PartitionKind,
        cursor: u64,
        count: u32,
    ) -> Result<ScanResponse> {
        let request = ScanRequest {
            dmap: dmap.to_string(),
            part_id,
            kind: Kind::from(kind) as i32,
            cursor,
            count,
        };
        let response = self
            .dispatch(SystemMessage::new(Operation::Scan, request.encode_to_vec()))
            .await?;
        decode_message(&response)
    }
}

#[async_trait]
impl MessageHandler for Node {
    async fn handle(&self, message: SystemMessage) -> Result<Vec<u8>> {
        self.dispatch(message).await
    }
}
