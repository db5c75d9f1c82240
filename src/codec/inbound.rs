//! socksrotor-core/src/codec/inbound.rs
//! Parses the client's SOCKS4 / SOCKS4A / SOCKS5 greeting and CONNECT
//! request (§4.3 "Inbound"). Each function assumes the version byte has
//! already been consumed by `peek_version`, mirroring the teacher's
//! `parse_handshake`/`parse_login_start` split in `protocol.rs`.

use std::net::Ipv4Addr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{rep, socks4_code, socks4_reply_bytes, socks5_reply_bytes};
use crate::error::EngineError;
use crate::types::{AddrType, Target};

/// Inbound SOCKS protocol version, detected from the greeting's first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundVersion {
    V4,
    V5,
}

/// Reads the single version byte that distinguishes SOCKS4 from SOCKS5.
pub async fn peek_version<S>(stream: &mut S) -> Result<InboundVersion, EngineError>
where
    S: AsyncReadExt + Unpin,
{
    let ver = stream
        .read_u8()
        .await
        .map_err(|e| EngineError::ClientProtocol(format!("failed to read version byte: {e}")))?;
    match ver {
        0x04 => Ok(InboundVersion::V4),
        0x05 => Ok(InboundVersion::V5),
        other => Err(EngineError::ClientProtocol(format!(
            "unsupported SOCKS version {other:#04x}"
        ))),
    }
}

/// Reads the SOCKS5 method-selection message (`NMETHODS, METHODS[...]`) and
/// always replies `05 00` (no-auth), ignoring whatever methods were offered.
pub async fn finish_socks5_greeting<S>(stream: &mut S) -> Result<(), EngineError>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    let nmethods = stream
        .read_u8()
        .await
        .map_err(|e| EngineError::ClientProtocol(format!("bad greeting: {e}")))?;
    let mut methods = vec![0u8; nmethods as usize];
    stream
        .read_exact(&mut methods)
        .await
        .map_err(|e| EngineError::ClientProtocol(format!("truncated method list: {e}")))?;

    stream
        .write_all(&[0x05, 0x00])
        .await
        .map_err(|e| EngineError::ClientProtocol(format!("failed to write greeting reply: {e}")))?;
    Ok(())
}

/// Reads the SOCKS5 CONNECT request (version byte already consumed).
pub async fn read_socks5_request<S>(stream: &mut S) -> Result<Target, EngineError>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    let mut head = [0u8; 3];
    stream
        .read_exact(&mut head)
        .await
        .map_err(|e| EngineError::ClientProtocol(format!("truncated request: {e}")))?;
    let [cmd, _rsv, atyp] = head;

    if cmd != 0x01 {
        let _ = stream.write_all(&socks5_reply_bytes(rep::COMMAND_NOT_SUPPORTED)).await;
        return Err(EngineError::ClientProtocol(format!("unsupported CMD {cmd:#04x}")));
    }

    let (host, addr_type) = match atyp {
        1 => {
            let mut buf = [0u8; 4];
            stream
                .read_exact(&mut buf)
                .await
                .map_err(|e| EngineError::ClientProtocol(format!("truncated IPv4 address: {e}")))?;
            (Ipv4Addr::from(buf).to_string(), AddrType::V4)
        }
        3 => {
            let len = stream
                .read_u8()
                .await
                .map_err(|e| EngineError::ClientProtocol(format!("truncated domain length: {e}")))?;
            let mut buf = vec![0u8; len as usize];
            stream
                .read_exact(&mut buf)
                .await
                .map_err(|e| EngineError::ClientProtocol(format!("truncated domain: {e}")))?;
            let domain = String::from_utf8(buf)
                .map_err(|e| EngineError::ClientProtocol(format!("non-UTF8 domain: {e}")))?;
            (domain, AddrType::Domain)
        }
        4 => {
            let mut buf = [0u8; 16];
            stream
                .read_exact(&mut buf)
                .await
                .map_err(|e| EngineError::ClientProtocol(format!("truncated IPv6 address: {e}")))?;
            (std::net::Ipv6Addr::from(buf).to_string(), AddrType::V6)
        }
        other => {
            let _ = stream.write_all(&socks5_reply_bytes(rep::ADDR_TYPE_NOT_SUPPORTED)).await;
            return Err(EngineError::ClientProtocol(format!("unsupported ATYP {other:#04x}")));
        }
    };

    let port = stream
        .read_u16()
        .await
        .map_err(|e| EngineError::ClientProtocol(format!("truncated port: {e}")))?;

    Ok(Target { host, port, addr_type })
}

/// Reads a SOCKS4/SOCKS4A CONNECT request (version byte already consumed).
pub async fn read_socks4_request<S>(stream: &mut S) -> Result<Target, EngineError>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    let mut head = [0u8; 7];
    stream
        .read_exact(&mut head)
        .await
        .map_err(|e| EngineError::ClientProtocol(format!("truncated request: {e}")))?;
    let cmd = head[0];
    let port = u16::from_be_bytes([head[1], head[2]]);
    let ip = [head[3], head[4], head[5], head[6]];

    if cmd != 0x01 {
        let _ = stream.write_all(&socks4_reply_bytes(socks4_code::REJECTED)).await;
        return Err(EngineError::ClientProtocol(format!("unsupported CD {cmd:#04x}")));
    }

    read_null_terminated(stream).await?; // USERID

    let is_socks4a = ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0;
    let (host, addr_type) = if is_socks4a {
        let domain = read_null_terminated(stream).await?;
        (domain, AddrType::Domain)
    } else {
        (Ipv4Addr::from(ip).to_string(), AddrType::V4)
    };

    Ok(Target { host, port, addr_type })
}

async fn read_null_terminated<S>(stream: &mut S) -> Result<String, EngineError>
where
    S: AsyncReadExt + Unpin,
{
    let mut buf = Vec::new();
    loop {
        let b = stream
            .read_u8()
            .await
            .map_err(|e| EngineError::ClientProtocol(format!("truncated null-terminated field: {e}")))?;
        if b == 0 {
            break;
        }
        buf.push(b);
        if buf.len() > 4096 {
            return Err(EngineError::ClientProtocol("null-terminated field too long".into()));
        }
    }
    String::from_utf8(buf).map_err(|e| EngineError::ClientProtocol(format!("non-UTF8 field: {e}")))
}

pub async fn write_socks5_reply<S>(stream: &mut S, rep: u8) -> std::io::Result<()>
where
    S: AsyncWriteExt + Unpin,
{
    stream.write_all(&socks5_reply_bytes(rep)).await
}

pub async fn write_socks4_reply<S>(stream: &mut S, code: u8) -> std::io::Result<()>
where
    S: AsyncWriteExt + Unpin,
{
    stream.write_all(&socks4_reply_bytes(code)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn socks5_greeting_always_replies_no_auth() {
        let mut stream = Cursor::new(vec![0x02, 0x00, 0x02]); // NMETHODS=2, METHODS=[0,2]
        finish_socks5_greeting(&mut stream).await.unwrap();
        assert_eq!(stream.into_inner()[3..], [0x05, 0x00]);
    }

    #[tokio::test]
    async fn socks5_request_round_trips_ipv4_domain_ipv6() {
        for (atyp, addr_bytes, expected_host) in [
            (1u8, vec![93, 184, 216, 34], "93.184.216.34".to_string()),
            (3u8, {
                let mut v = vec![11u8];
                v.extend_from_slice(b"example.com");
                v
            }, "example.com".to_string()),
            (4u8, vec![0xfe, 0x80, 0,0,0,0,0,0,0,0,0,0,0,0,0,1], "fe80::1".to_string()),
        ] {
            let mut body = vec![0x01, 0x00, atyp];
            body.extend_from_slice(&addr_bytes);
            body.extend_from_slice(&443u16.to_be_bytes());
            let mut stream = Cursor::new(body);
            let target = read_socks5_request(&mut stream).await.unwrap();
            assert_eq!(target.host, expected_host);
            assert_eq!(target.port, 443);
        }
    }

    #[tokio::test]
    async fn socks5_bad_cmd_replies_command_not_supported() {
        let mut stream = Cursor::new(vec![0x02, 0x00, 0x01, 1, 2, 3, 4, 0, 80]);
        let err = read_socks5_request(&mut stream).await.unwrap_err();
        assert!(matches!(err, EngineError::ClientProtocol(_)));
        let written = stream.into_inner();
        assert_eq!(&written[9..], &socks5_reply_bytes(rep::COMMAND_NOT_SUPPORTED));
    }

    #[tokio::test]
    async fn socks4_plain_ipv4_request() {
        let mut body = vec![0x01];
        body.extend_from_slice(&80u16.to_be_bytes());
        body.extend_from_slice(&[93, 184, 216, 34]);
        body.extend_from_slice(b"user\0");
        let mut stream = Cursor::new(body);
        let target = read_socks4_request(&mut stream).await.unwrap();
        assert_eq!(target.host, "93.184.216.34");
        assert_eq!(target.port, 80);
        assert_eq!(target.addr_type, AddrType::V4);
    }

    #[tokio::test]
    async fn socks4a_domain_request() {
        let mut body = vec![0x01];
        body.extend_from_slice(&80u16.to_be_bytes());
        body.extend_from_slice(&[0, 0, 0, 1]);
        body.extend_from_slice(b"user\0");
        body.extend_from_slice(b"example.org\0");
        let mut stream = Cursor::new(body);
        let target = read_socks4_request(&mut stream).await.unwrap();
        assert_eq!(target.host, "example.org");
        assert_eq!(target.port, 80);
        assert_eq!(target.addr_type, AddrType::Domain);
    }

    #[tokio::test]
    async fn partial_read_robustness_matches_whole_read() {
        // feed the request byte-by-byte through a reader that only ever
        // yields one byte per poll, and confirm the decoded target matches.
        let mut body = vec![0x01, 0x00, 0x03];
        body.push(11);
        body.extend_from_slice(b"example.com");
        body.extend_from_slice(&443u16.to_be_bytes());

        struct OneByteAtATime(Vec<u8>, usize);
        impl tokio::io::AsyncRead for OneByteAtATime {
            fn poll_read(
                mut self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                if self.1 < self.0.len() {
                    buf.put_slice(&[self.0[self.1]]);
                    self.1 += 1;
                }
                std::task::Poll::Ready(Ok(()))
            }
        }
        impl tokio::io::AsyncWrite for OneByteAtATime {
            fn poll_write(self: std::pin::Pin<&mut Self>, _cx: &mut std::task::Context<'_>, buf: &[u8]) -> std::task::Poll<Result<usize, std::io::Error>> {
                std::task::Poll::Ready(Ok(buf.len()))
            }
            fn poll_flush(self: std::pin::Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), std::io::Error>> {
                std::task::Poll::Ready(Ok(()))
            }
            fn poll_shutdown(self: std::pin::Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), std::io::Error>> {
                std::task::Poll::Ready(Ok(()))
            }
        }

        let mut reader = OneByteAtATime(body, 0);
        let target = read_socks5_request(&mut reader).await.unwrap();
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 443);
    }
}
