//! Block outbound: refuses every flow.

use super::{Outbound, OutboundAdapter, OutboundDatagram, OutboundType, ProxyStream};
use crate::common::metadata::{Destination, FlowMetadata, Network};
use crate::{Error, Result};
use async_trait::async_trait;
use tracing::debug;

pub struct Block {
    adapter: OutboundAdapter,
}

impl Block {
    pub fn new(tag: &str) -> Self {
        Block {
            adapter: OutboundAdapter::new(tag, OutboundType::Block, vec![Network::Tcp, Network::Udp]),
        }
    }
}

#[async_trait]
impl Outbound for Block {
    fn tag(&self) -> &str {
        &self.adapter.tag
    }

    fn outbound_type(&self) -> OutboundType {
        self.adapter.outbound_type
    }

    fn networks(&self) -> Vec<Network> {
        self.adapter.networks.clone()
    }

    async fn connect(
        &self,
        _network: Network,
        destination: &Destination,
    ) -> Result<Box<dyn ProxyStream>> {
        Err(Error::connection(format!("blocked: {}", destination)))
    }

    async fn listen_packet(&self, destination: &Destination) -> Result<Box<dyn OutboundDatagram>> {
        Err(Error::connection(format!("blocked: {}", destination)))
    }

    async fn handle_connection(
        &self,
        conn: Box<dyn ProxyStream>,
        metadata: &FlowMetadata,
    ) -> Result<()> {
        if let Some(destination) = &metadata.destination {
            debug!("blocked connection to {}", destination);
        }
        drop(conn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_block_refuses() {
        let block = Block::new("block-out");
        let destination = Destination::new_fqdn("example.com", 443);
        assert!(block.connect(Network::Tcp, &destination).await.is_err());
        assert!(block.listen_packet(&destination).await.is_err());
        assert_eq!(block.tag(), "block-out");
    }
}
