//! Helpers shared by the crate's tests

use crate::service::DMapService;
use async_trait::async_trait;
use kvmesh_cluster::{LocalTransport, MessageHandler, RoutingTable, Transport};
use kvmesh_common::{Config, Error, Member, Result};
use kvmesh_placement::HrwPlacement;
use kvmesh_proto::{Operation, SystemMessage};
use std::sync::Arc;

/// Serves the internal operations a dmap service answers
pub struct ServiceHandler(pub Arc<DMapService>);

#[async_trait]
impl MessageHandler for ServiceHandler {
    async fn handle(&self, message: SystemMessage) -> Result<Vec<u8>> {
        match message.operation()? {
            Operation::MoveFragment => {
                self.0.check_operable()?;
                self.0.import_fragment(&message.value).await?;
                Ok(Vec::new())
            }
            Operation::Ping => self.0.routing().handle_ping(&message.value),
            Operation::UpdateRouting => self.0.routing().handle_update(&message.value),
            op => Err(Error::NotImplemented(op.to_string())),
        }
    }
}

/// Service registered on `transport` whose routing table is not bootstrapped
pub fn member(name: &str, config: &Config, transport: &Arc<LocalTransport>) -> Arc<DMapService> {
    let routing = Arc::new(RoutingTable::new(
        Member::new(name),
        config.cluster.clone(),
        Arc::new(HrwPlacement::new()),
        Arc::clone(transport) as Arc<dyn Transport>,
    ));
    let service = Arc::new(DMapService::with_defaults(
        routing,
        Arc::clone(transport) as Arc<dyn Transport>,
        config,
    ));
    transport.register(name, Arc::new(ServiceHandler(Arc::clone(&service))));
    service
}

/// Bootstrapped single-member service
pub async fn standalone(
    name: &str,
    partition_count: u64,
    customize: impl FnOnce(&mut Config),
) -> Arc<DMapService> {
    let mut config = Config::default();
    config.cluster.partition_count = partition_count;
    customize(&mut config);

    let transport = Arc::new(LocalTransport::new());
    let service = member(name, &config, &transport);
    service.routing().bootstrap().await;
    service
}
