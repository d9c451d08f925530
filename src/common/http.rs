//! Minimal HTTP/1.1 client over a dialed stream.
//!
//! Health-check probes and subscription downloads must go through an
//! arbitrary outbound, so this client speaks HTTP directly on whatever
//! stream the outbound hands back, with TLS layered on for `https`.

use crate::common::metadata::{Destination, Network};
use crate::outbound::{Outbound, ProxyStream};
use crate::{Error, Result};
use rustls::pki_types::ServerName;
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::TlsConnector;
use url::Url;

/// Hard cap on a response we are willing to buffer.
const MAX_BODY_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: Url,
    pub user_agent: String,
    pub etag: Option<String>,
}

impl FetchRequest {
    pub fn new(url: &str, user_agent: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| Error::config(format!("invalid url {:?}: {}", url, e)))?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(Error::config(format!("invalid url scheme: {}", other))),
        }
        Ok(FetchRequest {
            url,
            user_agent: user_agent.to_string(),
            etag: None,
        })
    }
}

#[derive(Debug)]
pub struct FetchResponse {
    pub status: u16,
    pub etag: Option<String>,
    pub subscription_userinfo: Option<String>,
    pub body: Vec<u8>,
}

/// Shared TLS client configuration with the bundled web PKI roots.
pub fn client_tls_config() -> Arc<rustls::ClientConfig> {
    static CONFIG: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Arc::new(
                rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth(),
            )
        })
        .clone()
}

fn destination_of(url: &Url) -> Result<Destination> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::config(format!("url missing host: {}", url)))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::config(format!("url missing port: {}", url)))?;
    Ok(Destination::new_fqdn(host, port))
}

/// Issue a GET through `detour` and buffer the whole response.
pub async fn fetch(detour: &dyn Outbound, request: &FetchRequest) -> Result<FetchResponse> {
    let destination = destination_of(&request.url)?;
    let host = request.url.host_str().expect("checked by destination_of");
    let stream = detour.connect(Network::Tcp, &destination).await?;

    let mut stream: Box<dyn ProxyStream> = if request.url.scheme() == "https" {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| Error::config(format!("invalid server name {:?}: {}", host, e)))?;
        let connector = TlsConnector::from(client_tls_config());
        Box::new(connector.connect(server_name, stream).await?)
    } else {
        stream
    };

    let mut target = request.url.path().to_string();
    if let Some(query) = request.url.query() {
        target.push('?');
        target.push_str(query);
    }
    let mut head = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nAccept: */*\r\nConnection: close\r\n",
        target, host, request.user_agent
    );
    if let Some(etag) = &request.etag {
        head.push_str(&format!("If-None-Match: {}\r\n", etag));
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes()).await?;
    stream.flush().await?;

    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&buf[..n]);
        if raw.len() > MAX_BODY_SIZE {
            return Err(Error::protocol("response too large"));
        }
    }
    parse_response(&raw)
}

fn parse_response(raw: &[u8]) -> Result<FetchResponse> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut headers);
    let header_len = match response
        .parse(raw)
        .map_err(|e| Error::protocol(format!("bad response: {}", e)))?
    {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Err(Error::protocol("truncated response")),
    };
    let status = response
        .code
        .ok_or_else(|| Error::protocol("missing status"))?;

    let mut etag = None;
    let mut subscription_userinfo = None;
    let mut content_length: Option<usize> = None;
    let mut chunked = false;
    for header in response.headers.iter() {
        let value = String::from_utf8_lossy(header.value).trim().to_string();
        if header.name.eq_ignore_ascii_case("etag") {
            etag = Some(value);
        } else if header.name.eq_ignore_ascii_case("subscription-userinfo") {
            subscription_userinfo = Some(value);
        } else if header.name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse().ok();
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = value.eq_ignore_ascii_case("chunked");
        }
    }

    let rest = &raw[header_len..];
    let body = if chunked {
        dechunk(rest)?
    } else if let Some(len) = content_length {
        if rest.len() < len {
            return Err(Error::protocol("truncated body"));
        }
        rest[..len].to_vec()
    } else {
        rest.to_vec()
    };

    Ok(FetchResponse {
        status,
        etag,
        subscription_userinfo,
        body,
    })
}

fn dechunk(mut rest: &[u8]) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let line_end = rest
            .windows(2)
            .position(|window| window == b"\r\n")
            .ok_or_else(|| Error::protocol("bad chunk header"))?;
        let size_str = std::str::from_utf8(&rest[..line_end])
            .map_err(|_| Error::protocol("bad chunk header"))?;
        let size = usize::from_str_radix(size_str.trim(), 16)
            .map_err(|_| Error::protocol("bad chunk size"))?;
        rest = &rest[line_end + 2..];
        if size == 0 {
            break;
        }
        if rest.len() < size + 2 {
            return Err(Error::protocol("truncated chunk"));
        }
        body.extend_from_slice(&rest[..size]);
        rest = &rest[size + 2..];
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nETag: \"v1\"\r\nContent-Length: 5\r\n\r\nhello";
        let response = parse_response(raw).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.etag.as_deref(), Some("\"v1\""));
        assert_eq!(response.body, b"hello");
    }

    #[test]
    fn test_parse_response_chunked() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let response = parse_response(raw).unwrap();
        assert_eq!(response.body, b"hello world");
    }

    #[test]
    fn test_parse_response_subscription_header() {
        let raw =
            b"HTTP/1.1 304 Not Modified\r\nsubscription-userinfo: upload=1; download=2; total=3; expire=4\r\n\r\n";
        let response = parse_response(raw).unwrap();
        assert_eq!(response.status, 304);
        assert_eq!(
            response.subscription_userinfo.as_deref(),
            Some("upload=1; download=2; total=3; expire=4")
        );
        assert!(response.body.is_empty());
    }

    #[test]
    fn test_request_scheme_validation() {
        assert!(FetchRequest::new("ftp://example.com/list", "ua").is_err());
        assert!(FetchRequest::new("http://example.com/list", "ua").is_ok());
    }
}
