//! HTTP → WebSocket upgrade handshake: validates an already-parsed request and builds
//! the 101 response or a rejection.
//!
//! `connection.rs` reads the request line and headers off the socket by hand, one
//! delimiter-bounded line at a time, and hands this module the parsed result — no HTTP
//! parsing crate is involved.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::engine::Engine as _;

use crate::error::HandshakeError;

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// A parsed HTTP/1.1 request line plus headers, lower-cased header names. This is the
/// only shape the validator ever sees.
pub struct Request {
    pub version_major: u8,
    pub version_minor: u8,
    pub headers: HashMap<String, String>,
}

impl Request {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// The response the validator produces: either the 101 upgrade or a rejection,
/// always carrying the status line's headers.
pub struct Response {
    pub status_code: u16,
    pub headers: Vec<(&'static str, String)>,
}

impl Response {
    /// Render as an HTTP/1.1 status line plus headers, CRLF-terminated, ready to write
    /// to the socket.
    pub fn to_bytes(&self) -> Vec<u8> {
        let reason = match self.status_code {
            101 => "Switching Protocols",
            400 => "Bad Request",
            403 => "Forbidden",
            505 => "HTTP Version Not Supported",
            _ => "Error",
        };
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status_code, reason);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

fn ascii_eq_ignore_case(value: &str, expected: &str) -> bool {
    value.eq_ignore_ascii_case(expected)
}

/// Run the six ordered checks, short-circuiting on the first failure.
fn validate(req: &Request) -> Result<(), HandshakeError> {
    if (req.version_major, req.version_minor) < (1, 1) {
        return Err(HandshakeError::UnsupportedVersion);
    }
    let upgrade = req.header("upgrade").ok_or(HandshakeError::BadUpgradeHeader)?;
    if !ascii_eq_ignore_case(upgrade, "websocket") {
        return Err(HandshakeError::BadUpgradeHeader);
    }
    let connection = req
        .header("connection")
        .ok_or(HandshakeError::BadConnectionHeader)?;
    if !ascii_eq_ignore_case(connection, "upgrade") {
        return Err(HandshakeError::BadConnectionHeader);
    }
    if req.header("origin").is_none() {
        return Err(HandshakeError::MissingOrigin);
    }
    let version = req.header("sec-websocket-version").ok_or(HandshakeError::BadVersion)?;
    if version != "13" {
        return Err(HandshakeError::BadVersion);
    }
    if req.header("sec-websocket-key").is_none() {
        return Err(HandshakeError::MissingKey);
    }
    Ok(())
}

fn accept_token(key: &str) -> String {
    let concatenated = format!("{key}{GUID}");
    let digest = sha1_smol::Sha1::from(concatenated).digest().bytes();
    BASE64.encode(digest)
}

fn reject(err: HandshakeError) -> Response {
    let mut headers = vec![("Connection", "Close".to_string())];
    if err == HandshakeError::BadVersion {
        headers.push(("Sec-WebSocket-Version", "13".to_string()));
    }
    Response {
        status_code: err.status_code(),
        headers,
    }
}

/// Validate the request and build the response. On success the caller (the
/// connection engine) is responsible for starting frame reads and arming the
/// keep-alive PING timer; this function has no side effects of its own.
pub fn handle(req: &Request) -> Result<Response, (HandshakeError, Response)> {
    match validate(req) {
        Ok(()) => {
            // `validate` already confirmed the key is present.
            let key = req.header("sec-websocket-key").expect("checked above");
            let accept = accept_token(key);
            Ok(Response {
                status_code: 101,
                headers: vec![
                    ("Upgrade", "websocket".to_string()),
                    ("Connection", "Upgrade".to_string()),
                    ("Sec-WebSocket-Accept", accept),
                ],
            })
        }
        Err(err) => Err((err, reject(err))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(headers: &[(&str, &str)]) -> Request {
        Request {
            version_major: 1,
            version_minor: 1,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_lowercase(), v.to_string()))
                .collect(),
        }
    }

    fn valid_request() -> Request {
        req(&[
            ("Upgrade", "websocket"),
            ("Connection", "Upgrade"),
            ("Origin", "http://a"),
            ("Sec-WebSocket-Version", "13"),
            ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
        ])
    }

    #[test]
    fn accepts_valid_handshake_with_rfc_test_vector() {
        let resp = handle(&valid_request()).unwrap();
        assert_eq!(resp.status_code, 101);
        let accept = resp
            .headers
            .iter()
            .find(|(k, _)| *k == "Sec-WebSocket-Accept")
            .unwrap();
        assert_eq!(accept.1, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn rejects_bad_version() {
        let mut request = valid_request();
        request.version_major = 1;
        request.version_minor = 0;
        let (err, resp) = handle(&request).unwrap_err();
        assert_eq!(err, HandshakeError::UnsupportedVersion);
        assert_eq!(resp.status_code, 505);
    }

    #[test]
    fn rejects_bad_websocket_version_header_with_echoed_version() {
        let mut request = valid_request();
        request.headers.insert("sec-websocket-version".into(), "12".into());
        let (err, resp) = handle(&request).unwrap_err();
        assert_eq!(err, HandshakeError::BadVersion);
        assert_eq!(resp.status_code, 400);
        assert!(resp
            .headers
            .iter()
            .any(|(k, v)| *k == "Sec-WebSocket-Version" && v == "13"));
    }

    #[test]
    fn rejects_missing_origin() {
        let mut request = valid_request();
        request.headers.remove("origin");
        let (err, _) = handle(&request).unwrap_err();
        assert_eq!(err, HandshakeError::MissingOrigin);
    }

    #[test]
    fn upgrade_and_connection_headers_are_case_insensitive() {
        let request = req(&[
            ("Upgrade", "WebSocket"),
            ("Connection", "Upgrade, keep-alive"),
            ("Origin", "http://a"),
            ("Sec-WebSocket-Version", "13"),
            ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
        ]);
        // "Upgrade, keep-alive" is not ASCII-equal to "upgrade"; this documents the
        // narrower exact-match behaviour the Connection-header check requires.
        let result = handle(&request);
        assert!(result.is_err());
    }
}
