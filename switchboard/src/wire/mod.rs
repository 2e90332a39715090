// This module contains the incremental HTTP request parser.
pub mod http;

// This module contains JSON-RPC body helpers.
pub mod json;

// Re-exports.
pub use http::{parse, Method, ParseError, Request};

use bytes::{Bytes, BytesMut};

/// Builder for the broker's responses: status line, a few headers and a
/// body, always framed with `Content-Length`.
#[derive(Debug)]
pub struct Response {
    status: &'static str,
    headers: Vec<(&'static str, String)>,
    body: Bytes,
}

impl Response {
    pub fn ok() -> Self {
        Self::with_status("200 OK")
    }

    pub fn with_status(status: &'static str) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// An error response with a JSON body carrying `code` and `message`;
    /// `jsonrpc2` adds the JSON-RPC 2.0 envelope.
    pub fn error(status: &'static str, code: i64, message: &str, jsonrpc2: bool) -> Self {
        let body = if jsonrpc2 {
            serde_json::json!({
                "jsonrpc": "2.0",
                "error": {"code": code, "message": message},
                "id": serde_json::Value::Null,
            })
        } else {
            serde_json::json!({"error": {"code": code, "message": message}})
        };
        Self::with_status(status).body(Bytes::from(body.to_string().into_bytes()))
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(64 + self.body.len());
        out.extend_from_slice(b"HTTP/1.1 ");
        out.extend_from_slice(self.status.as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"Content-Length: ");
        out.extend_from_slice(self.body.len().to_string().as_bytes());
        out.extend_from_slice(b"\r\n\r\n");
        out.extend_from_slice(&self.body);
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_status_headers_and_body() {
        let encoded = Response::ok()
            .header("Id", "1")
            .header("Name", "foo")
            .body(Bytes::from_static(b"hello"))
            .encode();
        assert_eq!(
            &encoded[..],
            &b"HTTP/1.1 200 OK\r\nId: 1\r\nName: foo\r\nContent-Length: 5\r\n\r\nhello"[..]
        );
    }

    #[test]
    fn error_bodies() {
        let plain = Response::error("404 Not Found", -32601, "Method not found", false).encode();
        let text = String::from_utf8_lossy(&plain);
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("-32601"));
        assert!(!text.contains("jsonrpc"));

        let enveloped = Response::error("404 Not Found", -32601, "Method not found", true).encode();
        let text = String::from_utf8_lossy(&enveloped);
        assert!(text.contains("\"jsonrpc\":\"2.0\""));
    }
}
