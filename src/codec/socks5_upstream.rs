//! socksrotor-core/src/codec/socks5_upstream.rs
//! Outbound SOCKS5 handshake against a chosen upstream (§4.3 "SOCKS5
//! upstream"). Because we `read_exact` directly off the live `TcpStream`
//! rather than through a buffering framer, any bytes the upstream sends
//! past the reply header are simply left in the kernel socket buffer and
//! show up as the first bytes of the tunnel once relaying starts — no
//! explicit "forward the trailing bytes" bookkeeping is needed here (unlike
//! the HTTP CONNECT case, whose response has no length prefix).

use std::net::Ipv4Addr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{canonicalize_ipv6, rep};
use crate::error::EngineError;
use crate::types::{AddrType, ProxyEntry, Target};

pub async fn connect(entry: &ProxyEntry, target: &Target) -> Result<TcpStream, EngineError> {
    let mut stream = TcpStream::connect((entry.host.as_str(), entry.port))
        .await
        .map_err(EngineError::UpstreamConnect)?;

    negotiate_auth(&mut stream, entry).await?;
    send_connect_request(&mut stream, target).await?;
    Ok(stream)
}

async fn negotiate_auth(stream: &mut TcpStream, entry: &ProxyEntry) -> Result<(), EngineError> {
    let has_credentials = entry.username.is_some() && entry.password.is_some();
    let greeting: &[u8] = if has_credentials { &[0x05, 0x02, 0x00, 0x02] } else { &[0x05, 0x01, 0x00] };
    stream
        .write_all(greeting)
        .await
        .map_err(EngineError::UpstreamConnect)?;

    let mut reply = [0u8; 2];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| EngineError::UpstreamHandshake(format!("greeting reply: {e}")))?;
    let [ver, method] = reply;
    if ver != 0x05 {
        return Err(EngineError::UpstreamHandshake(format!("bad version in greeting reply: {ver:#04x}")));
    }

    match method {
        0x00 => Ok(()),
        0x02 if has_credentials => {
            let username = entry.username.as_deref().unwrap_or_default();
            let password = entry.password.as_deref().unwrap_or_default();
            let mut payload = vec![0x01, username.len() as u8];
            payload.extend_from_slice(username.as_bytes());
            payload.push(password.len() as u8);
            payload.extend_from_slice(password.as_bytes());

            stream
                .write_all(&payload)
                .await
                .map_err(EngineError::UpstreamConnect)?;
            let mut auth_reply = [0u8; 2];
            stream
                .read_exact(&mut auth_reply)
                .await
                .map_err(|e| EngineError::UpstreamHandshake(format!("auth reply: {e}")))?;
            if auth_reply != [0x01, 0x00] {
                return Err(EngineError::UpstreamHandshake("username/password authentication rejected".into()));
            }
            Ok(())
        }
        other => Err(EngineError::UpstreamHandshake(format!("upstream selected unsupported method {other:#04x}"))),
    }
}

async fn send_connect_request(stream: &mut TcpStream, target: &Target) -> Result<(), EngineError> {
    let mut req = vec![0x05, 0x01, 0x00];
    match target.addr_type {
        AddrType::V4 => {
            let ip: Ipv4Addr = target
                .host
                .parse()
                .map_err(|e| EngineError::ClientProtocol(format!("bad IPv4 target: {e}")))?;
            req.push(1);
            req.extend_from_slice(&ip.octets());
        }
        AddrType::Domain => {
            req.push(3);
            req.push(target.host.len() as u8);
            req.extend_from_slice(target.host.as_bytes());
        }
        AddrType::V6 => {
            let ip = canonicalize_ipv6(&target.host)
                .map_err(|e| EngineError::ClientProtocol(format!("bad IPv6 target: {e}")))?;
            req.push(4);
            req.extend_from_slice(&ip.octets());
        }
    }
    req.extend_from_slice(&target.port.to_be_bytes());

    stream
        .write_all(&req)
        .await
        .map_err(EngineError::UpstreamConnect)?;

    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .map_err(|e| EngineError::UpstreamHandshake(format!("connect reply header: {e}")))?;
    let [ver, reply_code, _rsv, atyp] = head;
    if ver != 0x05 {
        return Err(EngineError::UpstreamHandshake(format!("bad version in connect reply: {ver:#04x}")));
    }

    // Discard the bound address regardless of outcome, so the connection is
    // left positioned at the start of tunneled data on success.
    let addr_len = match atyp {
        1 => 4,
        3 => {
            let mut len_buf = [0u8; 1];
            stream
                .read_exact(&mut len_buf)
                .await
                .map_err(|e| EngineError::UpstreamHandshake(format!("bind domain length: {e}")))?;
            len_buf[0] as usize
        }
        4 => 16,
        other => {
            return Err(EngineError::UpstreamHandshake(format!("unsupported bind ATYP {other:#04x}")));
        }
    };
    let mut discard = vec![0u8; addr_len + 2]; // + BND.PORT
    stream
        .read_exact(&mut discard)
        .await
        .map_err(|e| EngineError::UpstreamHandshake(format!("bind address: {e}")))?;

    match reply_code {
        rep::SUCCEEDED => Ok(()),
        rep::HOST_UNREACHABLE | rep::CONNECTION_REFUSED | rep::TTL_EXPIRED | rep::NETWORK_UNREACHABLE => {
            Err(EngineError::UpstreamTarget(reply_code))
        }
        other => Err(EngineError::UpstreamHandshake(format!("upstream refused CONNECT: REP {other:#04x}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn full_success_handshake_no_auth() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            sock.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            sock.write_all(&[0x05, 0x00]).await.unwrap();

            let mut req = vec![0u8; 3 + 1 + 11 + 2];
            sock.read_exact(&mut req).await.unwrap();
            assert_eq!(&req[..3], [0x05, 0x01, 0x00]);
            assert_eq!(req[3], 3); // ATYP domain
            assert_eq!(&req[4..15], b"example.com");

            sock.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let entry = ProxyEntry::new(crate::types::ProxyProtocol::Socks5, addr.ip().to_string(), addr.port());
        let target = Target { host: "example.com".into(), port: 443, addr_type: AddrType::Domain };
        connect(&entry, &target).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn target_unreachable_is_not_penalized_as_handshake_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            sock.read_exact(&mut greeting).await.unwrap();
            sock.write_all(&[0x05, 0x00]).await.unwrap();
            let mut req = vec![0u8; 3 + 4 + 2];
            sock.read_exact(&mut req).await.unwrap();
            sock.write_all(&[0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let entry = ProxyEntry::new(crate::types::ProxyProtocol::Socks5, addr.ip().to_string(), addr.port());
        let target = Target { host: "10.0.0.1".into(), port: 80, addr_type: AddrType::V4 };
        let err = connect(&entry, &target).await.unwrap_err();
        assert!(matches!(err, EngineError::UpstreamTarget(0x04)));
        assert!(!err.penalizes_upstream());
        server.await.unwrap();
    }
}
