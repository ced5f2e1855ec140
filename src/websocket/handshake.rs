//! The WebSocket opening handshake (RFC 6455 §4) and permessage-deflate
//! negotiation (RFC 7692 §5).
//!
//! Grounded on `original_source/poseidon/socket/wss_server_session.cpp`'s
//! `do_wss_complete_handshake` (accept-or-reject decision, PMCE only
//! initialised when `pmce_send_window_bits() != 0`) and the teacher's use
//! of `sha-1`/`base64` for comparable accept-key derivation elsewhere in
//! the pack.

use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::http::Request;
use crate::websocket::pmce::PmceParams;
use crate::websocket::CloseStatus;

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(GUID.as_bytes());
    base64::encode(hasher.finalize())
}

/// What the server learned from a client's opening request.
pub struct ServerHandshake {
    pub accept: String,
    pub pmce: Option<PmceParams>,
}

/// Validates a request for the handshake preconditions spec.md §4.7
/// requires, returning the response pieces on success.
pub fn accept_server_request(request: &Request) -> Result<ServerHandshake> {
    let upgrade_ok = request
        .header("upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection_ok = request
        .header("connection")
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);
    let version_ok = request.header("sec-websocket-version") == Some("13");
    let key = request.header("sec-websocket-key");

    if !(upgrade_ok && connection_ok && version_ok) || key.is_none() {
        return Err(Error::protocol(CloseStatus::ProtocolError, "not a valid WebSocket upgrade request"));
    }

    let pmce = match request.header("sec-websocket-extensions") {
        Some(value) if mentions_permessage_deflate(value) => Some(negotiate_server_pmce(value)?),
        _ => None,
    };

    Ok(ServerHandshake {
        accept: accept_key(key.unwrap()),
        pmce,
    })
}

/// Renders the 101 response line, `Sec-WebSocket-Accept`, and (if
/// negotiated) the echoed `permessage-deflate` extension header.
pub fn build_server_response(handshake: &ServerHandshake) -> String {
    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n",
        handshake.accept
    );
    if let Some(params) = &handshake.pmce {
        response.push_str("Sec-WebSocket-Extensions: permessage-deflate");
        if params.server_no_context_takeover {
            response.push_str("; server_no_context_takeover");
        }
        if params.client_no_context_takeover {
            response.push_str("; client_no_context_takeover");
        }
        if params.server_window_bits != 15 {
            response.push_str(&format!("; server_max_window_bits={}", params.server_window_bits));
        }
        if params.client_window_bits != 15 {
            response.push_str(&format!("; client_max_window_bits={}", params.client_window_bits));
        }
        response.push_str("\r\n");
    }
    response.push_str("\r\n");
    response
}

fn mentions_permessage_deflate(header_value: &str) -> bool {
    header_value.split(',').any(|part| {
        part.split(';')
            .next()
            .map(|name| name.trim().eq_ignore_ascii_case("permessage-deflate"))
            .unwrap_or(false)
    })
}

fn negotiate_server_pmce(header_value: &str) -> Result<PmceParams> {
    let mut params = PmceParams::default();
    let offer = header_value
        .split(',')
        .find(|part| {
            part.split(';')
                .next()
                .map(|name| name.trim().eq_ignore_ascii_case("permessage-deflate"))
                .unwrap_or(false)
        })
        .expect("caller already checked permessage-deflate is present");

    for param in offer.split(';').skip(1) {
        let param = param.trim();
        let (name, value) = match param.split_once('=') {
            Some((n, v)) => (n.trim(), Some(v.trim().trim_matches('"'))),
            None => (param, None),
        };
        match name.to_ascii_lowercase().as_str() {
            "server_no_context_takeover" => params.server_no_context_takeover = true,
            "client_no_context_takeover" => params.client_no_context_takeover = true,
            "server_max_window_bits" => params.server_window_bits = parse_window_bits(value)?,
            "client_max_window_bits" => params.client_window_bits = parse_window_bits(value)?,
            "" => {}
            other => {
                return Err(Error::protocol(
                    CloseStatus::ProtocolError,
                    format!("unsupported permessage-deflate parameter `{other}`"),
                ))
            }
        }
    }
    Ok(params)
}

fn parse_window_bits(value: Option<&str>) -> Result<u8> {
    let bits: u8 = value
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Error::protocol(CloseStatus::ProtocolError, "invalid window bits"))?;
    if !(9..=15).contains(&bits) {
        return Err(Error::protocol(CloseStatus::ProtocolError, "window bits out of range [9, 15]"));
    }
    Ok(bits)
}

/// A client-side opening request: the raw bytes to send, and the key to
/// verify the server's `Sec-WebSocket-Accept` against.
pub struct ClientRequest {
    pub text: String,
    pub key: String,
}

/// Builds a client opening request offering `permessage-deflate` with
/// default parameters.
pub fn build_client_request(host: &str, path: &str, random_key: [u8; 16]) -> ClientRequest {
    let key = base64::encode(random_key);
    let text = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Extensions: permessage-deflate\r\n\r\n"
    );
    ClientRequest { text, key }
}

/// Verifies a server's 101 response against the key we sent, returning
/// the negotiated PMCE parameters if the server echoed the extension.
pub fn verify_server_response(response: &[u8], expected_key: &str) -> Result<Option<PmceParams>> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut parsed = httparse::Response::new(&mut headers);
    match parsed.parse(response) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return Err(Error::protocol(CloseStatus::ProtocolError, "malformed handshake response")),
    }
    if parsed.code != Some(101) {
        return Err(Error::protocol(CloseStatus::ProtocolError, "server did not switch protocols"));
    }
    let find = |name: &str| {
        parsed
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| String::from_utf8_lossy(h.value).into_owned())
    };
    let accept = find("sec-websocket-accept").ok_or_else(|| Error::protocol(CloseStatus::ProtocolError, "missing Sec-WebSocket-Accept"))?;
    if accept != accept_key(expected_key) {
        return Err(Error::protocol(CloseStatus::ProtocolError, "Sec-WebSocket-Accept mismatch"));
    }
    match find("sec-websocket-extensions") {
        Some(value) if mentions_permessage_deflate(&value) => Ok(Some(negotiate_server_pmce(&value)?)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: &[(&str, &str)]) -> Request {
        Request {
            method: "GET".into(),
            path: "/ws".into(),
            version: 1,
            headers: headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn accepts_a_well_formed_upgrade_request() {
        let req = request(&[
            ("Upgrade", "websocket"),
            ("Connection", "Upgrade"),
            ("Sec-WebSocket-Version", "13"),
            ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
        ]);
        let handshake = accept_server_request(&req).unwrap();
        assert_eq!(handshake.accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert!(handshake.pmce.is_none());
    }

    #[test]
    fn rejects_wrong_version() {
        let req = request(&[
            ("Upgrade", "websocket"),
            ("Connection", "Upgrade"),
            ("Sec-WebSocket-Version", "8"),
            ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
        ]);
        assert!(accept_server_request(&req).is_err());
    }

    #[test]
    fn negotiates_permessage_deflate_with_no_context_takeover() {
        let req = request(&[
            ("Upgrade", "websocket"),
            ("Connection", "Upgrade"),
            ("Sec-WebSocket-Version", "13"),
            ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
            ("Sec-WebSocket-Extensions", "permessage-deflate; client_no_context_takeover"),
        ]);
        let handshake = accept_server_request(&req).unwrap();
        let pmce = handshake.pmce.unwrap();
        assert!(pmce.client_no_context_takeover);
        assert!(!pmce.server_no_context_takeover);
    }

    #[test]
    fn rejects_window_bits_out_of_range() {
        let req = request(&[
            ("Upgrade", "websocket"),
            ("Connection", "Upgrade"),
            ("Sec-WebSocket-Version", "13"),
            ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
            ("Sec-WebSocket-Extensions", "permessage-deflate; server_max_window_bits=20"),
        ]);
        assert!(accept_server_request(&req).is_err());
    }
}
