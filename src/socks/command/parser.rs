//! SOCKS5 command parser

use crate::error::Socks5Error;
use crate::socks::consts::*;
use crate::socks::types::{SocksCommand, TargetAddr};
use anyhow::{bail, Context, Result};
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Parse a SOCKS5 request from the stream
///
/// # SOCKS5 Request Format
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
///
/// Unknown commands and address types fail with the matching
/// [`Socks5Error`] so the caller can pick the reply code.
pub async fn parse_command<S>(stream: &mut S) -> Result<(SocksCommand, TargetAddr)>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .await
        .context("Failed to read command header")?;

    let [version, cmd_byte, _reserved, addr_type] = header;

    if version != SOCKS5_VERSION {
        bail!(Socks5Error::UnsupportedVersion(version));
    }

    let command =
        SocksCommand::from_byte(cmd_byte).ok_or(Socks5Error::CommandNotSupported(cmd_byte))?;

    let target_addr = parse_address(stream, addr_type).await?;

    tracing::debug!("Parsed SOCKS5 command: {} to {}", command, target_addr);

    Ok((command, target_addr))
}

async fn parse_address<S>(stream: &mut S, addr_type: u8) -> Result<TargetAddr>
where
    S: AsyncRead + Unpin,
{
    let addr = match addr_type {
        SOCKS5_ADDR_TYPE_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            TargetAddr::ipv4(Ipv4Addr::from(addr), read_port(stream).await?)
        }

        SOCKS5_ADDR_TYPE_DOMAIN => {
            let domain_len = stream.read_u8().await? as usize;
            if domain_len == 0 || domain_len > MAX_DOMAIN_LEN {
                bail!(Socks5Error::InvalidDomain(format!("length {}", domain_len)));
            }

            let mut domain_buf = vec![0u8; domain_len];
            stream.read_exact(&mut domain_buf).await?;
            let domain = String::from_utf8(domain_buf)
                .map_err(|e| Socks5Error::InvalidDomain(e.to_string()))?;

            TargetAddr::domain(domain, read_port(stream).await?)
        }

        SOCKS5_ADDR_TYPE_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            TargetAddr::ipv6(Ipv6Addr::from(addr), read_port(stream).await?)
        }

        _ => bail!(Socks5Error::AddressTypeNotSupported(addr_type)),
    };

    Ok(addr)
}

async fn read_port<S: AsyncRead + Unpin>(stream: &mut S) -> Result<u16> {
    Ok(stream.read_u16().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn request(cmd: u8, addr: &[u8]) -> Vec<u8> {
        let mut request = vec![SOCKS5_VERSION, cmd, SOCKS5_RESERVED];
        request.extend_from_slice(addr);
        request
    }

    #[tokio::test]
    async fn test_parse_command_ipv4() {
        let addr = TargetAddr::ipv4(Ipv4Addr::new(192, 168, 1, 1), 8080);
        let mut cursor = Cursor::new(request(SOCKS5_CMD_TCP_CONNECT, &addr.to_bytes()));

        let (cmd, parsed) = parse_command(&mut cursor).await.unwrap();
        assert_eq!(cmd, SocksCommand::Connect);
        assert_eq!(parsed, addr);
    }

    #[tokio::test]
    async fn test_parse_command_domain() {
        let addr = TargetAddr::domain("example.com", 443);
        let mut cursor = Cursor::new(request(SOCKS5_CMD_TCP_CONNECT, &addr.to_bytes()));

        let (_, parsed) = parse_command(&mut cursor).await.unwrap();
        assert_eq!(parsed, addr);
    }

    #[tokio::test]
    async fn test_parse_command_ipv6() {
        let addr = TargetAddr::ipv6(Ipv6Addr::LOCALHOST, 80);
        let mut cursor = Cursor::new(request(SOCKS5_CMD_UDP_ASSOCIATE, &addr.to_bytes()));

        let (cmd, parsed) = parse_command(&mut cursor).await.unwrap();
        assert_eq!(cmd, SocksCommand::UdpAssociate);
        assert_eq!(parsed, addr);
    }

    #[tokio::test]
    async fn test_parse_command_invalid_version() {
        let mut req = request(SOCKS5_CMD_TCP_CONNECT, &[SOCKS5_ADDR_TYPE_IPV4, 127, 0, 0, 1, 0, 80]);
        req[0] = 4;

        let err = parse_command(&mut Cursor::new(req)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Socks5Error>(),
            Some(Socks5Error::UnsupportedVersion(4))
        ));
    }

    #[tokio::test]
    async fn test_parse_command_unknown_command() {
        let req = request(0x99, &[SOCKS5_ADDR_TYPE_IPV4, 127, 0, 0, 1, 0, 80]);
        let err = parse_command(&mut Cursor::new(req)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Socks5Error>(),
            Some(Socks5Error::CommandNotSupported(0x99))
        ));
    }

    #[tokio::test]
    async fn test_parse_command_unknown_address_type() {
        let req = request(SOCKS5_CMD_TCP_CONNECT, &[0x09, 0, 0]);
        let err = parse_command(&mut Cursor::new(req)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Socks5Error>(),
            Some(Socks5Error::AddressTypeNotSupported(0x09))
        ));
    }

    #[tokio::test]
    async fn test_parse_command_empty_domain() {
        let req = request(SOCKS5_CMD_TCP_CONNECT, &[SOCKS5_ADDR_TYPE_DOMAIN, 0, 0, 80]);
        assert!(parse_command(&mut Cursor::new(req)).await.is_err());
    }

    #[tokio::test]
    async fn test_parse_command_truncated() {
        let req = request(SOCKS5_CMD_TCP_CONNECT, &[SOCKS5_ADDR_TYPE_IPV4, 127, 0]);
        assert!(parse_command(&mut Cursor::new(req)).await.is_err());
    }
}
