//! HTTP CONNECT outbound.

use super::{Outbound, OutboundAdapter, OutboundDatagram, OutboundType, ProxyStream};
use crate::common::metadata::{Destination, Network};
use crate::config::OutboundOptions;
use crate::dialer::{new_dialer, Dialer};
use crate::router::Router;
use crate::{Error, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::TlsConnector;

pub struct HttpOutbound {
    adapter: OutboundAdapter,
    dialer: Arc<dyn Dialer>,
    server: Destination,
    authorization: Option<String>,
    tls: bool,
}

impl HttpOutbound {
    pub fn new(router: &Arc<Router>, tag: &str, options: &OutboundOptions) -> Result<Self> {
        if options.server.is_empty() || options.server_port == 0 {
            return Err(Error::config(format!(
                "http outbound [{}] missing server address",
                tag
            )));
        }
        let authorization = match (options.get_str("username"), options.get_str("password")) {
            (Some(username), password) => Some(format!(
                "Basic {}",
                STANDARD.encode(format!("{}:{}", username, password.unwrap_or_default()))
            )),
            _ => None,
        };
        Ok(HttpOutbound {
            adapter: OutboundAdapter::new(tag, OutboundType::Http, vec![Network::Tcp])
                .with_port(options.server_port),
            dialer: new_dialer(router, &options.dialer)?,
            server: Destination::new_fqdn(&options.server, options.server_port),
            authorization,
            tls: options.get_bool("tls").unwrap_or(false),
        })
    }
}

#[async_trait]
impl Outbound for HttpOutbound {
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
            return Err(Error::unsupported("http outbound is TCP only"));
        }
        let stream = self.dialer.connect(Network::Tcp, &self.server).await?;
        let mut stream: Box<dyn ProxyStream> = if self.tls {
            let host = self
                .server
                .fqdn()
                .map(str::to_string)
                .unwrap_or_else(|| self.server.ip().map(|ip| ip.to_string()).unwrap_or_default());
            let server_name = ServerName::try_from(host.clone())
                .map_err(|e| Error::config(format!("invalid server name {:?}: {}", host, e)))?;
            let connector = TlsConnector::from(crate::common::http::client_tls_config());
            Box::new(connector.connect(server_name, stream).await?)
        } else {
            stream
        };

        let mut request = format!(
            "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Connection: Keep-Alive\r\n",
            target = destination
        );
        if let Some(authorization) = &self.authorization {
            request.push_str(&format!("Proxy-Authorization: {}\r\n", authorization));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        // Read the response head only; tunneled bytes follow immediately.
        let mut head = Vec::with_capacity(256);
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if head.len() > 8192 {
                return Err(Error::protocol("oversized CONNECT response"));
            }
            let n = stream.read(&mut byte).await?;
            if n == 0 {
                return Err(Error::connection("proxy closed during CONNECT"));
            }
            head.push(byte[0]);
        }
        let mut headers = [httparse::EMPTY_HEADER; 16];
        let mut response = httparse::Response::new(&mut headers);
        response
            .parse(&head)
            .map_err(|e| Error::protocol(format!("bad CONNECT response: {}", e)))?;
        match response.code {
            Some(200) => Ok(stream),
            Some(code) => Err(Error::connection(format!("CONNECT rejected: {}", code))),
            None => Err(Error::protocol("bad CONNECT response")),
        }
    }

    async fn listen_packet(&self, _destination: &Destination) -> Result<Box<dyn OutboundDatagram>> {
        Err(Error::unsupported("http outbound is TCP only"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;

    fn outbound_options(json: &str) -> OutboundOptions {
        serde_json::from_str(json).unwrap()
    }

    #[tokio::test]
    async fn test_connect_handshake() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = conn.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
            conn.write_all(b"HTTP/1.1 200 Connection established\r\n\r\npayload")
                .await
                .unwrap();
        });

        let router = crate::router::Router::new(&Options::default()).unwrap();
        let options = outbound_options(&format!(
            r#"{{"type": "http", "tag": "corp", "server": "{}", "server_port": {}}}"#,
            addr.ip(),
            addr.port()
        ));
        let outbound = HttpOutbound::new(&router, "corp", &options).unwrap();
        assert_eq!(outbound.port(), addr.port());

        let destination = Destination::new_fqdn("example.com", 443);
        let mut stream = outbound.connect(Network::Tcp, &destination).await.unwrap();
        let mut buf = [0u8; 7];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[tokio::test]
    async fn test_connect_rejected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = conn.read(&mut buf).await.unwrap();
            conn.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n").await.unwrap();
        });

        let router = crate::router::Router::new(&Options::default()).unwrap();
        let options = outbound_options(&format!(
            r#"{{"type": "http", "tag": "corp", "server": "{}", "server_port": {}}}"#,
            addr.ip(),
            addr.port()
        ));
        let outbound = HttpOutbound::new(&router, "corp", &options).unwrap();
        let destination = Destination::new_fqdn("example.com", 443);
        assert!(outbound.connect(Network::Tcp, &destination).await.is_err());
    }
}
