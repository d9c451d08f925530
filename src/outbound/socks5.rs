//! SOCKS5 outbound (CONNECT command).

use super::{Outbound, OutboundAdapter, OutboundDatagram, OutboundType, ProxyStream};
use crate::common::metadata::{Destination, Host, Network};
use crate::config::OutboundOptions;
use crate::dialer::{new_dialer, Dialer};
use crate::router::Router;
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const VERSION: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const CMD_CONNECT: u8 = 0x01;

pub struct Socks5Outbound {
    adapter: OutboundAdapter,
    dialer: Arc<dyn Dialer>,
    server: Destination,
    username: Option<String>,
    password: Option<String>,
}

impl Socks5Outbound {
    pub fn new(router: &Arc<Router>, tag: &str, options: &OutboundOptions) -> Result<Self> {
        if options.server.is_empty() || options.server_port == 0 {
            return Err(Error::config(format!(
                "socks outbound [{}] missing server address",
                tag
            )));
        }
        Ok(Socks5Outbound {
            adapter: OutboundAdapter::new(tag, OutboundType::Socks, vec![Network::Tcp])
                .with_port(options.server_port),
            dialer: new_dialer(router, &options.dialer)?,
            server: Destination::new_fqdn(&options.server, options.server_port),
            username: options.get_str("username").map(str::to_string),
            password: options.get_str("password").map(str::to_string),
        })
    }

    fn encode_address(destination: &Destination, buf: &mut Vec<u8>) -> Result<()> {
        match &destination.host {
            Host::Ip(IpAddr::V4(ip)) => {
                buf.push(0x01);
                buf.extend_from_slice(&ip.octets());
            }
            Host::Ip(IpAddr::V6(ip)) => {
                buf.push(0x04);
                buf.extend_from_slice(&ip.octets());
            }
            Host::Fqdn(domain) => {
                if domain.len() > 255 {
                    return Err(Error::address("domain name too long"));
                }
                buf.push(0x03);
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
            }
        }
        buf.extend_from_slice(&destination.port.to_be_bytes());
        Ok(())
    }

    async fn handshake(&self, stream: &mut Box<dyn ProxyStream>) -> Result<()> {
        let method = if self.username.is_some() {
            METHOD_USER_PASS
        } else {
            METHOD_NONE
        };
        stream.write_all(&[VERSION, 1, method]).await?;
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply[0] != VERSION || reply[1] != method {
            return Err(Error::protocol(format!(
                "socks5 method rejected: {:#x}",
                reply[1]
            )));
        }
        if method == METHOD_USER_PASS {
            let username = self.username.as_deref().unwrap_or_default();
            let password = self.password.as_deref().unwrap_or_default();
            let mut auth = vec![0x01, username.len() as u8];
            auth.extend_from_slice(username.as_bytes());
            auth.push(password.len() as u8);
            auth.extend_from_slice(password.as_bytes());
            stream.write_all(&auth).await?;
            let mut reply = [0u8; 2];
            stream.read_exact(&mut reply).await?;
            if reply[1] != 0x00 {
                return Err(Error::protocol("socks5 authentication failed"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Outbound for Socks5Outbound {
    fn tag(&self) -> &str {
        &self.adapter.tag
    }

    fn outbound_type(&self) -> OutboundType {
        self.adapter.outbound_type
    }

    fn networks(&self) -> Vec<Network> {
        self.adapter.networks.clone()
    }

    fn port(&self) -> u16 {
        self.adapter.port
    }

    async fn connect(
        &self,
        network: Network,
        destination: &Destination,
    ) -> Result<Box<dyn ProxyStream>> {
        if network != Network::Tcp {
            return Err(Error::unsupported("socks outbound is TCP only"));
        }
        let mut stream = self.dialer.connect(Network::Tcp, &self.server).await?;
        self.handshake(&mut stream).await?;

        let mut request = vec![VERSION, CMD_CONNECT, 0x00];
        Self::encode_address(destination, &mut request)?;
        stream.write_all(&request).await?;

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[1] != 0x00 {
            return Err(Error::connection(format!(
                "socks5 connect rejected: {:#x}",
                head[1]
            )));
        }
        // Drain the bound address.
        match head[3] {
            0x01 => {
                let mut skip = [0u8; 6];
                stream.read_exact(&mut skip).await?;
            }
            0x04 => {
                let mut skip = [0u8; 18];
                stream.read_exact(&mut skip).await?;
            }
            0x03 => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut skip = vec![0u8; usize::from(len[0]) + 2];
                stream.read_exact(&mut skip).await?;
            }
            other => {
                return Err(Error::protocol(format!(
                    "socks5 bad address type: {:#x}",
                    other
                )))
            }
        }
        Ok(stream)
    }

    async fn listen_packet(&self, _destination: &Destination) -> Result<Box<dyn OutboundDatagram>> {
        Err(Error::unsupported("socks outbound is TCP only"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;

    #[tokio::test]
    async fn test_socks5_connect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            conn.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            conn.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 4];
            conn.read_exact(&mut head).await.unwrap();
            assert_eq!(&head, &[0x05, 0x01, 0x00, 0x03]);
            let mut len = [0u8; 1];
            conn.read_exact(&mut len).await.unwrap();
            let mut rest = vec![0u8; usize::from(len[0]) + 2];
            conn.read_exact(&mut rest).await.unwrap();

            conn.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            conn.write_all(b"tunnel").await.unwrap();
        });

        let router = crate::router::Router::new(&Options::default()).unwrap();
        let options: OutboundOptions = serde_json::from_str(&format!(
            r#"{{"type": "socks", "tag": "s5", "server": "{}", "server_port": {}}}"#,
            addr.ip(),
            addr.port()
        ))
        .unwrap();
        let outbound = Socks5Outbound::new(&router, "s5", &options).unwrap();

        let destination = Destination::new_fqdn("example.com", 80);
        let mut stream = outbound.connect(Network::Tcp, &destination).await.unwrap();
        let mut buf = [0u8; 6];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"tunnel");
    }
}
