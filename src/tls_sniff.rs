use tokio::io::{AsyncRead, AsyncReadExt};

use crate::buf_reader::BufReader;

pub const RECORD_TYPE_HANDSHAKE: u8 = 0x16;

const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const SERVER_NAME_TYPE_HOST: u8 = 0x00;

// Plaintext TLS records carry at most 2^14 bytes of payload.
const MAX_RECORD_LEN: usize = 16384;

/// Reads one TLS record off the stream and extracts the SNI host name from
/// the ClientHello it carries.
///
/// A ClientHello fragmented across multiple records is treated as a parse
/// failure; real clients send it in one.
pub async fn read_sni_host<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<String> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await.map_err(|e| {
        std::io::Error::new(e.kind(), format!("read tls record header: {e}"))
    })?;

    if header[0] != RECORD_TYPE_HANDSHAKE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("not a tls handshake record: type {:#04x}", header[0]),
        ));
    }

    let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if record_len == 0 || record_len > MAX_RECORD_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid tls record length: {record_len}"),
        ));
    }

    let mut record = vec![0u8; record_len];
    stream.read_exact(&mut record).await.map_err(|e| {
        std::io::Error::new(e.kind(), format!("read tls handshake record: {e}"))
    })?;

    extract_sni_host(&record)
}

/// Walks the ClientHello handshake body (the record payload, without the
/// 5-byte record header) to the server_name extension.
pub fn extract_sni_host(handshake: &[u8]) -> std::io::Result<String> {
    parse_client_hello(handshake).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("parse client hello: {e}"),
        )
    })
}

fn parse_client_hello(handshake: &[u8]) -> std::io::Result<String> {
    let mut reader = BufReader::new(handshake);

    let handshake_type = reader.read_u8()?;
    if handshake_type != HANDSHAKE_TYPE_CLIENT_HELLO {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("not a client hello: handshake type {handshake_type}"),
        ));
    }

    let handshake_len = reader.read_u24_be()? as usize;
    if handshake_len > reader.remaining() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "client hello spans multiple records",
        ));
    }

    let _protocol_version = reader.read_u16_be()?;

    // random
    reader.skip(32)?;

    let session_id_len = reader.read_u8()? as usize;
    reader.skip(session_id_len)?;

    let cipher_suites_len = reader.read_u16_be()? as usize;
    reader.skip(cipher_suites_len)?;

    let compression_len = reader.read_u8()? as usize;
    reader.skip(compression_len)?;

    let extensions_len = reader.read_u16_be()? as usize;
    let extensions_end = reader.position() + extensions_len;

    while reader.position() < extensions_end {
        let ext_type = reader.read_u16_be()?;
        let ext_len = reader.read_u16_be()? as usize;

        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name_extension(reader.read_slice(ext_len)?);
        }
        reader.skip(ext_len)?;
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "no server_name extension in client hello",
    ))
}

fn parse_server_name_extension(data: &[u8]) -> std::io::Result<String> {
    let mut reader = BufReader::new(data);

    let list_len = reader.read_u16_be()? as usize;
    let list_end = reader.position() + list_len;

    while reader.position() < list_end {
        let name_type = reader.read_u8()?;
        let name_len = reader.read_u16_be()? as usize;
        let name = reader.read_slice(name_len)?;

        if name_type == SERVER_NAME_TYPE_HOST {
            return std::str::from_utf8(name).map(str::to_string).map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("server name is not utf-8: {e}"),
                )
            });
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "no host_name entry in server_name extension",
    ))
}

/// Builds a minimal ClientHello record carrying `host` as its SNI entry.
#[cfg(test)]
pub(crate) fn build_client_hello(host: &str) -> Vec<u8> {
    let host = host.as_bytes();

    let mut server_name_ext = Vec::new();
    server_name_ext.extend_from_slice(&((host.len() + 3) as u16).to_be_bytes()); // list length
    server_name_ext.push(SERVER_NAME_TYPE_HOST);
    server_name_ext.extend_from_slice(&(host.len() as u16).to_be_bytes());
    server_name_ext.extend_from_slice(host);

    let mut extensions = Vec::new();
    extensions.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
    extensions.extend_from_slice(&(server_name_ext.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&server_name_ext);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]); // protocol version
    body.extend_from_slice(&[0u8; 32]); // random
    body.push(0); // session id length
    body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // cipher suites
    body.extend_from_slice(&[0x01, 0x00]); // compression methods
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = Vec::new();
    handshake.push(HANDSHAKE_TYPE_CLIENT_HELLO);
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]); // u24 length
    handshake.extend_from_slice(&body);

    let mut record = Vec::new();
    record.push(RECORD_TYPE_HANDSHAKE);
    record.extend_from_slice(&[0x03, 0x01]); // record version
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_extract_sni() {
        let hello = build_client_hello("example.com");
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::io::AsyncWriteExt::write_all(&mut client, &hello)
            .await
            .unwrap();

        let host = read_sni_host(&mut server).await.unwrap();
        assert_eq!(host, "example.com");
    }

    #[test]
    fn test_missing_sni_extension() {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]);
        body.extend_from_slice(&[0u8; 32]);
        body.push(0);
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
        body.extend_from_slice(&[0x01, 0x00]);
        body.extend_from_slice(&[0x00, 0x00]); // empty extensions block

        let mut handshake = vec![HANDSHAKE_TYPE_CLIENT_HELLO];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let err = extract_sni_host(&handshake).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncated_hello_is_an_error() {
        let hello = build_client_hello("example.com");
        let err = extract_sni_host(&hello[5..20]).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_not_a_client_hello() {
        // ServerHello handshake type
        let handshake = [0x02, 0x00, 0x00, 0x02, 0x03, 0x03];
        let err = extract_sni_host(&handshake).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
