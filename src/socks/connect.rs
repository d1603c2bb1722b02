//! SOCKS5 CONNECT service run by the agent on every accepted stream
//!
//! Method negotiation already happened between the server and the client,
//! so the first bytes on the stream are the client's request.

use crate::config::SocksConfig;
use crate::error::{Socks5Error, Socks5ReplyCode};
use crate::helper::duration_from_secs;
use crate::pool::BufferPool;
use crate::socks::command::{parse_command, send_reply};
use crate::socks::types::{SocksCommand, TargetAddr};
use crate::tunnel::relay;
use anyhow::{anyhow, Context, Result};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Serve one SOCKS5 request arriving on `stream`
///
/// Parses the request, dials the target within the request timeout, answers
/// with the reply code matching the outcome and relays until both
/// directions are done. BIND and UDP ASSOCIATE are refused.
pub async fn serve_connect<S>(mut stream: S, config: &SocksConfig, pool: &BufferPool) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let timeout = duration_from_secs(config.request_timeout);

    let parsed = tokio::time::timeout(timeout, parse_command(&mut stream))
        .await
        .map_err(|_| anyhow!("Timed out reading SOCKS5 request"))
        .and_then(|parsed| parsed);
    let (command, target) = match parsed {
        Ok(request) => request,
        Err(e) => {
            let _ = refuse(&mut stream, reply_code_for(&e), timeout).await;
            return Err(e.context("Failed to parse SOCKS5 request"));
        }
    };

    if command != SocksCommand::Connect {
        warn!("SOCKS5 {} to {} not supported", command, target);
        refuse(&mut stream, Socks5ReplyCode::CommandNotSupported, timeout).await?;
        return Ok(());
    }

    if matches!(target, TargetAddr::Domain(..)) && !config.dns_resolve {
        warn!("Refusing domain target {} with DNS resolution disabled", target);
        refuse(&mut stream, Socks5ReplyCode::AddressTypeNotSupported, timeout).await?;
        return Ok(());
    }

    debug!("Connecting to target: {}", target);

    let target_stream = match tokio::time::timeout(timeout, dial(&target)).await {
        Ok(Ok(target_stream)) => target_stream,
        Ok(Err(e)) => {
            refuse(&mut stream, Socks5ReplyCode::from(&e), timeout).await?;
            return Err(e).with_context(|| format!("Failed to connect to {}", target));
        }
        Err(_) => {
            refuse(&mut stream, Socks5ReplyCode::HostUnreachable, timeout).await?;
            return Err(anyhow!("Connection to {} timed out", target));
        }
    };

    let _ = target_stream.set_nodelay(true);
    let local_addr = target_stream.local_addr().ok();
    send_reply(&mut stream, Socks5ReplyCode::Succeeded, local_addr).await?;

    info!("SOCKS5 tunnel established to {}", target);

    let (sent, received) = relay(stream, target_stream, pool)
        .await
        .with_context(|| format!("Relay to {} failed", target))?;
    debug!("Relay to {} finished: {} bytes out, {} bytes in", target, sent, received);

    Ok(())
}

/// Answer with a failure reply and close the write side, then wait up to
/// `linger` for the peer to close. Dropping a stream right away would reset
/// it, and a reset discards the reply on the receiving end.
async fn refuse<S>(stream: &mut S, code: Socks5ReplyCode, linger: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_reply(stream, code, None).await?;
    stream.shutdown().await?;

    let mut sink = [0u8; 512];
    let drain = async {
        while let Ok(n) = stream.read(&mut sink).await {
            if n == 0 {
                break;
            }
        }
    };
    let _ = tokio::time::timeout(linger, drain).await;
    Ok(())
}

async fn dial(target: &TargetAddr) -> io::Result<TcpStream> {
    match target {
        TargetAddr::Ip(addr) => TcpStream::connect(addr).await,
        TargetAddr::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await,
    }
}

fn reply_code_for(err: &anyhow::Error) -> Socks5ReplyCode {
    match err.downcast_ref::<Socks5Error>() {
        Some(Socks5Error::CommandNotSupported(_)) => Socks5ReplyCode::CommandNotSupported,
        Some(Socks5Error::AddressTypeNotSupported(_)) => Socks5ReplyCode::AddressTypeNotSupported,
        _ => Socks5ReplyCode::GeneralFailure,
    }
}
