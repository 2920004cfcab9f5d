use bytes::{Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

// A ClientHello spanning more records than this is not worth routing.
const MAX_HELLO_SIZE: usize = 32 * 1024;

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_ALPN: u16 = 0x0010;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientHelloInfo {
    pub server_name: Option<String>,
    pub alpn: Vec<String>,
}

#[derive(Debug, PartialEq)]
pub struct InvalidClientHello;

/// Accumulates the first flight from `stream` until a full ClientHello can
/// be decoded, then hands back both the decoded routing fields and the raw
/// bytes. The caller replays the bytes in front of the socket so the TLS
/// terminator (or a passthrough upstream) sees the flight untouched.
pub async fn read_client_hello<S>(stream: &mut S) -> io::Result<(Bytes, ClientHelloInfo)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        match decode_client_hello(&buf) {
            Ok(Some(info)) => return Ok((buf.freeze(), info)),
            Ok(None) => {}
            Err(InvalidClientHello) => {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "invalid ClientHello"));
            }
        }
        if buf.len() > MAX_HELLO_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "ClientHello too large"));
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "EOF before ClientHello"));
        }
    }
}

/// Decodes the ClientHello from raw TLS records. `Ok(None)` means the
/// flight is incomplete and more bytes are needed.
pub fn decode_client_hello(data: &[u8]) -> Result<Option<ClientHelloInfo>, InvalidClientHello> {
    let mut hello: Vec<u8> = Vec::new();
    let mut offset = 0;

    loop {
        if data.len() < offset + 5 {
            return check_partial(&hello);
        }
        let header = &data[offset..offset + 5];
        if header[0] != CONTENT_TYPE_HANDSHAKE || header[1] != 0x03 {
            return Err(InvalidClientHello);
        }
        let record_size = u16::from_be_bytes([header[3], header[4]]) as usize;
        if record_size == 0 {
            return Err(InvalidClientHello);
        }
        offset += 5;

        let available = data.len().saturating_sub(offset).min(record_size);
        hello.extend_from_slice(&data[offset..offset + available]);
        offset += available;

        if !hello.is_empty() && hello[0] != HANDSHAKE_CLIENT_HELLO {
            return Err(InvalidClientHello);
        }
        if hello.len() >= 4 {
            let want = u32::from_be_bytes([0, hello[1], hello[2], hello[3]]) as usize + 4;
            if hello.len() >= want {
                return parse_hello_body(&hello[4..want]).map(Some);
            }
        }
        if available < record_size {
            // Mid-record; the rest of the flight is still on the wire.
            return Ok(None);
        }
    }
}

fn check_partial(hello: &[u8]) -> Result<Option<ClientHelloInfo>, InvalidClientHello> {
    if !hello.is_empty() && hello[0] != HANDSHAKE_CLIENT_HELLO {
        return Err(InvalidClientHello);
    }
    Ok(None)
}

fn parse_hello_body(payload: &[u8]) -> Result<ClientHelloInfo, InvalidClientHello> {
    // legacy_version(2) + random(32)
    if payload.len() < 34 {
        return Err(InvalidClientHello);
    }
    let mut offset = 34;

    // session id
    if offset + 1 > payload.len() {
        return Err(InvalidClientHello);
    }
    offset += 1 + payload[offset] as usize;

    // cipher suites
    if offset + 2 > payload.len() {
        return Err(InvalidClientHello);
    }
    offset += 2 + u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;

    // compression methods
    if offset + 1 > payload.len() {
        return Err(InvalidClientHello);
    }
    offset += 1 + payload[offset] as usize;

    // A hello without extensions is legal; it just has no SNI or ALPN.
    if offset + 2 > payload.len() {
        return Ok(ClientHelloInfo::default());
    }
    let ext_len = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
    offset += 2;
    if offset + ext_len > payload.len() {
        return Err(InvalidClientHello);
    }

    Ok(parse_extensions(&payload[offset..offset + ext_len]))
}

fn parse_extensions(data: &[u8]) -> ClientHelloInfo {
    let mut info = ClientHelloInfo::default();
    let mut offset = 0;

    while offset + 4 <= data.len() {
        let ext_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let ext_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4;
        if offset + ext_len > data.len() {
            break;
        }
        let ext_data = &data[offset..offset + ext_len];
        match ext_type {
            EXT_SERVER_NAME => info.server_name = parse_sni(ext_data),
            EXT_ALPN => info.alpn = parse_alpn(ext_data),
            _ => {}
        }
        offset += ext_len;
    }

    info
}

fn parse_sni(data: &[u8]) -> Option<String> {
    if data.len() < 2 {
        return None;
    }
    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if data.len() < 2 + list_len {
        return None;
    }
    let mut offset = 2;
    while offset + 3 <= 2 + list_len {
        let name_type = data[offset];
        let name_len = u16::from_be_bytes([data[offset + 1], data[offset + 2]]) as usize;
        offset += 3;
        if offset + name_len > data.len() {
            break;
        }
        if name_type == 0 {
            if let Ok(hostname) = std::str::from_utf8(&data[offset..offset + name_len]) {
                return Some(hostname.to_string());
            }
        }
        offset += name_len;
    }
    None
}

fn parse_alpn(data: &[u8]) -> Vec<String> {
    let mut protocols = Vec::new();
    if data.len() < 2 {
        return protocols;
    }
    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if data.len() < 2 + list_len {
        return protocols;
    }
    let mut offset = 2;
    while offset < 2 + list_len {
        let proto_len = data[offset] as usize;
        offset += 1;
        if offset + proto_len > data.len() {
            break;
        }
        if let Ok(protocol) = std::str::from_utf8(&data[offset..offset + proto_len]) {
            protocols.push(protocol.to_string());
        }
        offset += proto_len;
    }
    protocols
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::ServerName;
    use rustls::{ClientConfig, ClientConnection, RootCertStore};
    use std::sync::Arc;

    fn real_client_hello(sni: &str, alpn: &[&str]) -> Vec<u8> {
        crate::networking::tls::init_crypto();
        let roots = RootCertStore::empty();
        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        let name = ServerName::try_from(sni.to_string()).unwrap();
        let mut conn = ClientConnection::new(Arc::new(config), name).unwrap();
        let mut out = Vec::new();
        conn.write_tls(&mut out).unwrap();
        out
    }

    #[test]
    fn decodes_sni_and_alpn_from_rustls_hello() {
        let flight = real_client_hello("a.example", &["h2", "http/1.1"]);
        let info = decode_client_hello(&flight).unwrap().unwrap();
        assert_eq!(info.server_name.as_deref(), Some("a.example"));
        assert_eq!(info.alpn, vec!["h2".to_string(), "http/1.1".to_string()]);
    }

    #[test]
    fn truncated_hello_wants_more_bytes() {
        let flight = real_client_hello("a.example", &[]);
        assert_eq!(decode_client_hello(&flight[..10]), Ok(None));
        assert_eq!(decode_client_hello(&flight[..4]), Ok(None));
        assert_eq!(decode_client_hello(&[]), Ok(None));
    }

    #[test]
    fn rejects_non_tls_bytes() {
        assert_eq!(decode_client_hello(b"GET / HTTP/1.1\r\n"), Err(InvalidClientHello));
    }

    #[tokio::test]
    async fn reads_a_split_flight() {
        let flight = real_client_hello("split.example", &["h2"]);
        let (mut tx, mut rx) = tokio::io::duplex(64 * 1024);
        let (a, b) = flight.split_at(20);
        let a = a.to_vec();
        let b = b.to_vec();
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            tx.write_all(&a).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            tx.write_all(&b).await.unwrap();
        });
        let (raw, info) = read_client_hello(&mut rx).await.unwrap();
        assert_eq!(&raw[..], &flight[..]);
        assert_eq!(info.server_name.as_deref(), Some("split.example"));
    }
}
