//! Forward proxy dialing for the agent
//!
//! `http://[user:pass@]host:port` issues an HTTP CONNECT,
//! `socks5://[user:pass@]host:port` a SOCKS5 CONNECT. The returned stream is
//! already connected through to the target.

use anyhow::{anyhow, bail, Context, Result};
use tokio::net::TcpStream;
use url::{Host, Url};

const DEFAULT_SOCKS5_PORT: u16 = 1080;

/// Connect to `host:port` through the proxy described by `proxy`
pub async fn connect_via(proxy: &Url, host: &str, port: u16) -> Result<TcpStream> {
    let proxy_host = match proxy.host() {
        Some(Host::Domain(domain)) => domain.to_string(),
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => ip.to_string(),
        None => bail!("Proxy URL has no host: {}", proxy),
    };
    let proxy_port = match proxy.scheme() {
        "socks5" => proxy.port().unwrap_or(DEFAULT_SOCKS5_PORT),
        _ => proxy
            .port_or_known_default()
            .ok_or_else(|| anyhow!("Proxy URL has no port: {}", proxy))?,
    };

    let mut stream = TcpStream::connect((proxy_host.as_str(), proxy_port))
        .await
        .with_context(|| format!("Failed to connect to proxy {}:{}", proxy_host, proxy_port))?;

    let credentials = match proxy.username() {
        "" => None,
        user => Some((user, proxy.password().unwrap_or(""))),
    };

    match proxy.scheme() {
        "http" => {
            let result = match credentials {
                Some((user, pass)) => {
                    async_http_proxy::http_connect_tokio_with_basic_auth(
                        &mut stream,
                        host,
                        port,
                        user,
                        pass,
                    )
                    .await
                }
                None => async_http_proxy::http_connect_tokio(&mut stream, host, port).await,
            };
            result.map_err(|e| anyhow!("HTTP proxy CONNECT to {}:{} failed: {}", host, port, e))?;
        }
        "socks5" => {
            let auth = credentials.map(|(user, pass)| async_socks5::Auth::new(user, pass));
            async_socks5::connect(&mut stream, (host.to_string(), port), auth)
                .await
                .map_err(|e| anyhow!("SOCKS5 proxy CONNECT to {}:{} failed: {}", host, port, e))?;
        }
        other => bail!("Unsupported proxy scheme: {}", other),
    }

    tracing::debug!("Connected to {}:{} via proxy {}", host, port, proxy_host);

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_http_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = Url::parse(&format!("http://{}", listener.local_addr().unwrap())).unwrap();

        let proxy_task = tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(conn);
            let mut request_line = String::new();
            reader.read_line(&mut request_line).await.unwrap();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            let mut conn = reader.into_inner();
            conn.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            (request_line, buf)
        });

        let mut stream = connect_via(&proxy, "server.example", 10443).await.unwrap();
        stream.write_all(b"hello").await.unwrap();

        let (request_line, payload) = proxy_task.await.unwrap();
        assert!(request_line.starts_with("CONNECT server.example:10443"));
        assert_eq!(&payload, b"hello");
    }

    #[tokio::test]
    async fn test_unreachable_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let proxy = Url::parse(&format!("socks5://{}", addr)).unwrap();
        assert!(connect_via(&proxy, "example.com", 80).await.is_err());
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = Url::parse(&format!("ftp://{}", listener.local_addr().unwrap())).unwrap();
        let err = connect_via(&proxy, "example.com", 80).await.unwrap_err();
        assert!(err.to_string().contains("Unsupported proxy scheme"));
    }
}
