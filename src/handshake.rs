//! WebSocket upgrade handshake
//!
//! Parses the client's HTTP upgrade request into a [`Handshake`] record
//! and builds the `101 Switching Protocols` response, including
//! negotiation of the `permessage-deflate` extension parameters.

use base64::Engine;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// GUID appended to the client key when computing `Sec-WebSocket-Accept`
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const MAX_HEADER_SIZE: usize = 8192;

/// `permessage-deflate` parameters advertised by the client.
///
/// Window-bits fields use `-1` for "parameter absent" and `0` for
/// "present without a value".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub permessage_deflate: bool,
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
    pub server_max_window_bits: i32,
    pub client_max_window_bits: i32,
}

impl Default for Extension {
    fn default() -> Self {
        Extension {
            permessage_deflate: false,
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: -1,
            client_max_window_bits: -1,
        }
    }
}

/// Parsed WebSocket upgrade request.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub version: String,
    pub key: String,
    pub host: String,
    pub extension: Extension,
}

impl Handshake {
    /// Parse an upgrade request from a byte buffer.
    ///
    /// Returns [`Error::NeedMore`] while the request head is incomplete so
    /// a push-driven caller can wait for the next chunk.
    pub fn from_buffer(buf: &[u8]) -> Result<Handshake> {
        Self::parse(buf).map(|(hs, _)| hs)
    }

    /// Like [`Handshake::from_buffer`], also returning how many bytes the
    /// request head consumed, so a caller can keep any pipelined frame
    /// bytes that followed it.
    pub fn parse(buf: &[u8]) -> Result<(Handshake, usize)> {
        if buf.len() > MAX_HEADER_SIZE {
            return Err(Error::InvalidHttp("request too large"));
        }

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut req = httparse::Request::new(&mut headers);
        let consumed = match req.parse(buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Err(Error::NeedMore(1)),
            Err(_) => return Err(Error::InvalidHttp("malformed request head")),
        };
        if req.method != Some("GET") {
            return Err(Error::InvalidHttp("method must be GET"));
        }

        let mut hs = Handshake::default();
        let mut upgrade_headers = 0;

        for header in req.headers.iter() {
            let value = std::str::from_utf8(header.value)
                .map_err(|_| Error::InvalidHttp("header value is not utf8"))?;
            let name = header.name.to_ascii_lowercase();
            match name.as_str() {
                "host" => hs.host = value.to_string(),
                "sec-websocket-key" => hs.key = value.to_string(),
                "sec-websocket-version" => hs.version = value.to_string(),
                "upgrade" => {
                    if value.eq_ignore_ascii_case("websocket") {
                        upgrade_headers += 1;
                    }
                }
                "connection" => {
                    if value
                        .split(',')
                        .any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
                    {
                        upgrade_headers += 1;
                    }
                }
                "sec-websocket-extensions" => hs.extension = parse_extension(value),
                _ => {}
            }
        }

        if upgrade_headers != 2 {
            return Err(Error::Handshake("upgrade headers not found"));
        }
        if hs.key.is_empty() {
            return Err(Error::Handshake("missing Sec-WebSocket-Key"));
        }
        Ok((hs, consumed))
    }

    /// Build the `101 Switching Protocols` reply.
    ///
    /// The extensions line is included only when the client advertised
    /// `permessage-deflate`; context takeover is always disabled because
    /// the shared compressor pool resets state on every lease.
    pub fn response(&self) -> String {
        const CRLF: &str = "\r\n";
        let mut rsp = String::with_capacity(192);
        rsp.push_str("HTTP/1.1 101 Switching Protocols");
        rsp.push_str(CRLF);
        rsp.push_str("Upgrade: websocket");
        rsp.push_str(CRLF);
        rsp.push_str("Connection: Upgrade");
        rsp.push_str(CRLF);
        rsp.push_str("Sec-WebSocket-Accept: ");
        rsp.push_str(&sec_accept(&self.key));
        rsp.push_str(CRLF);
        if self.extension.permessage_deflate {
            rsp.push_str(
                "Sec-WebSocket-Extensions: permessage-deflate; \
                 client_no_context_takeover; server_no_context_takeover",
            );
            rsp.push_str(CRLF);
        }
        rsp.push_str(CRLF);
        rsp
    }
}

fn parse_extension(value: &str) -> Extension {
    let mut ext = Extension::default();
    ext.permessage_deflate = value.contains("permessage-deflate");

    for part in value.split(';') {
        let mut kv = part.splitn(2, '=');
        let name = kv.next().unwrap_or("").trim();
        let param = kv.next().map(str::trim);
        match name {
            "server_no_context_takeover" => ext.server_no_context_takeover = true,
            "client_no_context_takeover" => ext.client_no_context_takeover = true,
            "server_max_window_bits" => {
                ext.server_max_window_bits = window_bits(param);
            }
            "client_max_window_bits" => {
                ext.client_max_window_bits = window_bits(param);
            }
            _ => {}
        }
    }
    ext
}

// present without value => 0, unparsable value ignored
fn window_bits(param: Option<&str>) -> i32 {
    match param {
        None => 0,
        Some(v) => v.parse().unwrap_or(0),
    }
}

/// `Sec-WebSocket-Accept` value for a client key:
/// `base64(sha1(key || GUID))`.
pub fn sec_accept(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Random client key for an upgrade request: 16 bytes from the kernel
/// CSPRNG, base64 encoded.
pub fn sec_key() -> Result<String> {
    let mut bytes = [0u8; 16];
    let mut filled = 0;
    while filled < bytes.len() {
        let n = unsafe {
            libc::getrandom(
                bytes[filled..].as_mut_ptr() as *mut libc::c_void,
                bytes.len() - filled,
                0,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::Io(err));
        }
        filled += n as usize;
    }
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &str = "GET ws://ws.example.com/ws HTTP/1.1\r\n\
        Host: ws.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: 3yMLSWFdF1MH1YDDPW/aYQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        Sec-WebSocket-Extensions: permessage-deflate; \
        server_max_window_bits=12; client_max_window_bits=13\r\n\r\n";

    #[test]
    fn parse_upgrade_request() {
        let hs = Handshake::from_buffer(REQUEST.as_bytes()).unwrap();

        assert_eq!(hs.version, "13");
        assert_eq!(hs.key, "3yMLSWFdF1MH1YDDPW/aYQ==");
        assert_eq!(hs.host, "ws.example.com");

        assert!(hs.extension.permessage_deflate);
        assert_eq!(hs.extension.server_max_window_bits, 12);
        assert_eq!(hs.extension.client_max_window_bits, 13);
        assert!(!hs.extension.server_no_context_takeover);

        let expected = "HTTP/1.1 101 Switching Protocols\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Accept: 9bQuZIN64KrRsqgxuR1CxYN94zQ=\r\n\
            Sec-WebSocket-Extensions: permessage-deflate; \
            client_no_context_takeover; server_no_context_takeover\r\n\r\n";
        assert_eq!(hs.response(), expected);
    }

    #[test]
    fn response_without_deflate() {
        let request = "GET / HTTP/1.1\r\n\
            Host: x\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\n\r\n";
        let hs = Handshake::from_buffer(request.as_bytes()).unwrap();
        assert!(!hs.extension.permessage_deflate);
        assert_eq!(hs.extension.server_max_window_bits, -1);
        assert_eq!(hs.extension.client_max_window_bits, -1);

        let rsp = hs.response();
        assert!(rsp.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(!rsp.contains("Sec-WebSocket-Extensions"));
        assert!(rsp.ends_with("\r\n\r\n"));
    }

    #[test]
    fn partial_request_needs_more() {
        let partial = &REQUEST.as_bytes()[..40];
        assert!(matches!(
            Handshake::from_buffer(partial),
            Err(Error::NeedMore(_))
        ));
    }

    #[test]
    fn missing_upgrade_headers() {
        let request = "GET / HTTP/1.1\r\n\
            Host: x\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
        assert!(matches!(
            Handshake::from_buffer(request.as_bytes()),
            Err(Error::Handshake(_))
        ));
    }

    #[test]
    fn accept_key_vectors() {
        let cases = [
            ("dGhlIHNhbXBsZSBub25jZQ==", "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="),
            ("3yMLSWFdF1MH1YDDPW/aYQ==", "9bQuZIN64KrRsqgxuR1CxYN94zQ="),
            ("/Hua7JHfD1waXr47jL/uAg==", "ELgfPf42E81xadzWVke1JyXNmqU="),
        ];
        for (key, accept) in cases {
            assert_eq!(sec_accept(key), accept);
        }
    }

    #[test]
    fn generated_key_shape() {
        let key = sec_key().unwrap();
        assert_eq!(key.len(), 24);
        assert_ne!(key, sec_key().unwrap());
    }
}
