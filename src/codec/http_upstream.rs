//! socksrotor-core/src/codec/http_upstream.rs
//! Outbound HTTP CONNECT handshake (§4.3 "HTTP upstream"). Unlike the SOCKS
//! variants, the response has no length prefix: we have to buffer until we
//! see the blank line that ends the header block, which means any bytes we
//! read past it belong to the tunnel and must be handed back explicitly
//! rather than left in the socket.

use base64::Engine as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::buffer::{BufferPair, HTTP_OR_DIRECT_CAPACITY, HTTP_OVERFLOW_FLOOR};
use crate::error::EngineError;
use crate::types::{ProxyEntry, Target};

pub struct HttpUpstream {
    pub stream: TcpStream,
    /// Bytes read past the header terminator; must be treated as the first
    /// chunk of tunneled data rather than discarded.
    pub leading_bytes: Vec<u8>,
}

pub async fn connect(entry: &ProxyEntry, target: &Target) -> Result<HttpUpstream, EngineError> {
    let mut stream = TcpStream::connect((entry.host.as_str(), entry.port))
        .await
        .map_err(EngineError::UpstreamConnect)?;
    // §6: HTTP-upstream sockets request widened SO_RCVBUF/SO_SNDBUF, matching
    // the 256 KiB buffer floor this path uses (buffer::HTTP_OR_DIRECT_CAPACITY).
    let sock = socket2::SockRef::from(&stream);
    let _ = sock.set_recv_buffer_size(262_144);
    let _ = sock.set_send_buffer_size(262_144);

    let host_header = format!("{}:{}", target.host, target.port);
    let mut request = format!("CONNECT {host_header} HTTP/1.1\r\nHost: {host_header}\r\n");
    if let (Some(user), Some(pass)) = (&entry.username, &entry.password) {
        let creds = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
        request.push_str(&format!("Proxy-Authorization: Basic {creds}\r\n"));
    }
    request.push_str("Connection: keep-alive\r\nUser-Agent: socksrotor\r\n\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(EngineError::UpstreamConnect)?;

    let (status_line, leading_bytes) = read_response_headers(&mut stream).await?;

    // Presence of "200"/"407" anywhere in the status line, not a parsed
    // status code field — matches what real upstream proxies emit even
    // when the reason phrase is nonstandard.
    if status_line.contains("200") {
        Ok(HttpUpstream { stream, leading_bytes })
    } else if status_line.contains("407") {
        Err(EngineError::UpstreamAuthRequired)
    } else {
        Err(EngineError::UpstreamHandshake(format!("upstream refused CONNECT: {status_line}")))
    }
}

/// Reads in chunks until `\r\n\r\n` is seen, extracts the status line, and
/// returns any bytes read past the terminator in the same chunk.
///
/// Buffers through a `BufferPair` (C3) sized to the HTTP upstream floor
/// (§4.2). If an upstream never terminates its header block within that
/// capacity, this is the buffer-overflow case §4.2 describes: the capacity
/// is doubled (floored at 1 MiB) purely to record the overflow, and the
/// connection is torn down rather than given more chances to recover
/// mid-handshake.
async fn read_response_headers(stream: &mut TcpStream) -> Result<(String, Vec<u8>), EngineError> {
    let mut buf = BufferPair::new(HTTP_OR_DIRECT_CAPACITY);
    let mut scan_from = 0;
    let header_end = loop {
        let mut chunk = [0u8; 512];
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| EngineError::UpstreamHandshake(format!("reading CONNECT response: {e}")))?;
        if n == 0 {
            return Err(EngineError::UpstreamHandshake(
                "upstream closed connection before completing CONNECT response".into(),
            ));
        }
        if buf.input().len() + n > buf.input().capacity() {
            let doubled = (buf.input().capacity() * 2).max(HTTP_OVERFLOW_FLOOR);
            buf.ensure_capacity(doubled);
            return Err(EngineError::Resource(
                "CONNECT response header block overflowed the upstream buffer".into(),
            ));
        }
        buf.input_mut().extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_terminator(buf.input(), scan_from) {
            break pos + 4;
        }
        scan_from = buf.input().len().saturating_sub(3);
    };

    let header_bytes = buf.input_mut().split_to(header_end);
    let leading_bytes = buf.input().to_vec();

    let status_line = header_bytes
        .split(|&b| b == b'\n')
        .next()
        .ok_or_else(|| EngineError::UpstreamHandshake("empty CONNECT response".into()))?;
    let status_line = String::from_utf8_lossy(status_line).trim_end().to_string();

    Ok((status_line, leading_bytes))
}

fn find_header_terminator(buf: &[u8], scan_from: usize) -> Option<usize> {
    buf.windows(4).skip(scan_from).position(|w| w == b"\r\n\r\n").map(|p| p + scan_from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt as _;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn successful_connect_with_basic_auth() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = sock.read(&mut buf).await.unwrap();
            let req = String::from_utf8_lossy(&buf[..n]);
            assert!(req.starts_with("CONNECT example.com:443 HTTP/1.1"));
            assert!(req.contains("Proxy-Authorization: Basic"));
            sock.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await
                .unwrap();
        });

        let entry = ProxyEntry::new(crate::types::ProxyProtocol::Http, addr.ip().to_string(), addr.port())
            .with_credentials("alice", "hunter2");
        let target = Target { host: "example.com".into(), port: 443, addr_type: crate::types::AddrType::Domain };
        let result = connect(&entry, &target).await.unwrap();
        assert!(result.leading_bytes.is_empty());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn bytes_sent_past_the_header_terminator_are_preserved() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = sock.read(&mut buf).await.unwrap();
            let mut response = b"HTTP/1.1 200 Connection Established\r\n\r\n".to_vec();
            response.extend_from_slice(b"tunneled-first-chunk");
            sock.write_all(&response).await.unwrap();
        });

        let entry = ProxyEntry::new(crate::types::ProxyProtocol::Http, addr.ip().to_string(), addr.port());
        let target = Target { host: "example.com".into(), port: 443, addr_type: crate::types::AddrType::Domain };
        let result = connect(&entry, &target).await.unwrap();
        assert_eq!(result.leading_bytes, b"tunneled-first-chunk");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn proxy_auth_required_is_not_penalized() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let entry = ProxyEntry::new(crate::types::ProxyProtocol::Http, addr.ip().to_string(), addr.port());
        let target = Target { host: "example.com".into(), port: 443, addr_type: crate::types::AddrType::Domain };
        let err = connect(&entry, &target).await.unwrap_err();
        assert!(matches!(err, EngineError::UpstreamAuthRequired));
        assert!(!err.penalizes_upstream());
        server.await.unwrap();
    }
}
