//! socksrotor-core/src/codec/socks4_upstream.rs
//! Outbound SOCKS4/SOCKS4A handshake against a chosen upstream (§4.3 "SOCKS4
//! upstream"). SOCKS4 carries no username/password subnegotiation; the
//! USERID field is sent empty, mirroring how the inbound side treats it as
//! opaque (§4.3 "Inbound").

use std::net::Ipv4Addr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::socks4_code;
use crate::error::EngineError;
use crate::types::{AddrType, ProxyEntry, Target};

pub async fn connect(entry: &ProxyEntry, target: &Target) -> Result<TcpStream, EngineError> {
    let mut stream = TcpStream::connect((entry.host.as_str(), entry.port))
        .await
        .map_err(EngineError::UpstreamConnect)?;

    let mut req = vec![0x04, 0x01];
    req.extend_from_slice(&target.port.to_be_bytes());

    match target.addr_type {
        AddrType::V4 => {
            let ip: Ipv4Addr = target
                .host
                .parse()
                .map_err(|e| EngineError::ClientProtocol(format!("bad IPv4 target: {e}")))?;
            req.extend_from_slice(&ip.octets());
            req.push(0x00); // empty USERID
        }
        AddrType::Domain => {
            // SOCKS4A: invalid-IP convention 0.0.0.x, followed by USERID then domain.
            req.extend_from_slice(&[0, 0, 0, 1]);
            req.push(0x00); // empty USERID
            req.extend_from_slice(target.host.as_bytes());
            req.push(0x00);
        }
        AddrType::V6 => {
            return Err(EngineError::ClientProtocol(
                "SOCKS4 upstream cannot carry an IPv6 target".into(),
            ));
        }
    }

    stream
        .write_all(&req)
        .await
        .map_err(EngineError::UpstreamConnect)?;

    let mut reply = [0u8; 8];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| EngineError::UpstreamHandshake(format!("connect reply: {e}")))?;
    let [_vn, cd, ..] = reply;

    match cd {
        socks4_code::GRANTED => Ok(stream),
        0x5B => Err(EngineError::UpstreamTarget(cd)), // request rejected/failed
        0x5C | 0x5D => Err(EngineError::UpstreamHandshake(format!(
            "upstream rejected SOCKS4 request: CD {cd:#04x} (ident unreachable/mismatch)"
        ))),
        other => Err(EngineError::UpstreamHandshake(format!("unexpected SOCKS4 CD {other:#04x}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn socks4a_domain_handshake_succeeds() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut head = [0u8; 8];
            sock.read_exact(&mut head).await.unwrap();
            assert_eq!(head[0], 0x04);
            assert_eq!(head[1], 0x01);
            assert_eq!(&head[4..8], [0, 0, 0, 1]);
            let mut userid = [0u8; 1];
            sock.read_exact(&mut userid).await.unwrap();
            assert_eq!(userid[0], 0);
            let mut domain = vec![0u8; "example.org".len() + 1];
            sock.read_exact(&mut domain).await.unwrap();
            assert_eq!(&domain[..domain.len() - 1], b"example.org");

            sock.write_all(&[0x00, 0x5A, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });

        let entry = ProxyEntry::new(crate::types::ProxyProtocol::Socks4, addr.ip().to_string(), addr.port());
        let target = Target { host: "example.org".into(), port: 80, addr_type: AddrType::Domain };
        connect(&entry, &target).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_request_surfaces_as_upstream_target_not_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut head = [0u8; 9]; // CD+port+ip+useridterm
            sock.read_exact(&mut head).await.unwrap();
            sock.write_all(&[0x00, 0x5B, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });

        let entry = ProxyEntry::new(crate::types::ProxyProtocol::Socks4, addr.ip().to_string(), addr.port());
        let target = Target { host: "10.0.0.1".into(), port: 80, addr_type: AddrType::V4 };
        let err = connect(&entry, &target).await.unwrap_err();
        assert!(matches!(err, EngineError::UpstreamTarget(0x5B)));
        assert!(!err.penalizes_upstream());
        server.await.unwrap();
    }
}
