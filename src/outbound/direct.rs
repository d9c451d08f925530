//! Direct outbound: hands flows straight to the dialing core.

use super::{Outbound, OutboundAdapter, OutboundDatagram, OutboundType, ProxyStream};
use crate::common::metadata::{Destination, Network};
use crate::config::DialerOptions;
use crate::dialer::{new_direct_dialer, Dialer};
use crate::router::Router;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub struct Direct {
    adapter: OutboundAdapter,
    dialer: Arc<dyn Dialer>,
}

impl Direct {
    pub fn new(router: &Arc<Router>, tag: &str, options: DialerOptions) -> Result<Self> {
        let dialer = new_direct_dialer(router, &options)?;
        Ok(Direct {
            adapter: OutboundAdapter::new(tag, OutboundType::Direct, vec![Network::Tcp, Network::Udp]),
            dialer,
        })
    }
}

#[async_trait]
impl Outbound for Direct {
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
        network: Network,
        destination: &Destination,
    ) -> Result<Box<dyn ProxyStream>> {
        self.dialer.connect(network, destination).await
    }

    async fn listen_packet(&self, destination: &Destination) -> Result<Box<dyn OutboundDatagram>> {
        self.dialer.listen_packet(destination).await
    }
}
