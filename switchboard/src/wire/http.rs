use bytes::Bytes;
use memchr::{memchr, memmem};
use std::fmt;

/// Largest accepted request-line-plus-headers block.
pub const MAX_HEAD: usize = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Other,
}

/// A parsed request: the request line plus the handful of headers the
/// broker cares about. The body is the raw `Content-Length` payload.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub id: Option<String>,
    pub name: Option<String>,
    pub info: Option<String>,
    pub priority: i32,
    pub noid: bool,
    pub fail_on_disconnect: bool,
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseError(pub &'static str);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed request: {}", self.0)
    }
}

impl std::error::Error for ParseError {}

/// Tries to take one request off the front of `buf`. Returns the request
/// and the number of consumed bytes once the head and the full body have
/// arrived; `None` while more data is needed.
pub fn parse(buf: &[u8]) -> Result<Option<(Request, usize)>, ParseError> {
    let head_end = match memmem::find(buf, b"\r\n\r\n") {
        Some(i) => i,
        None => {
            if buf.len() > MAX_HEAD {
                return Err(ParseError("header block too large"));
            }
            return Ok(None);
        }
    };
    if head_end > MAX_HEAD {
        return Err(ParseError("header block too large"));
    }

    let head = &buf[..head_end];
    let mut lines = head.split(|&b| b == b'\n').map(|line| {
        if line.ends_with(b"\r") {
            &line[..line.len() - 1]
        } else {
            line
        }
    });

    let request_line = lines.next().ok_or(ParseError("empty request line"))?;
    let (method, path) = parse_request_line(request_line)?;

    let mut request = Request {
        method,
        path,
        id: None,
        name: None,
        info: None,
        priority: 0,
        noid: false,
        fail_on_disconnect: false,
        body: Bytes::new(),
    };

    let mut content_length = 0usize;
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let colon = memchr(b':', line).ok_or(ParseError("header without a colon"))?;
        let name = trim(&line[..colon]);
        let value = trim(&line[colon + 1..]);
        if name.eq_ignore_ascii_case(b"content-length") {
            content_length = std::str::from_utf8(value)
                .ok()
                .and_then(|v| v.parse().ok())
                .ok_or(ParseError("bad content-length"))?;
        } else if name.eq_ignore_ascii_case(b"id") {
            request.id = Some(text(value)?);
        } else if name.eq_ignore_ascii_case(b"name") {
            request.name = Some(text(value)?);
        } else if name.eq_ignore_ascii_case(b"info") {
            request.info = Some(text(value)?);
        } else if name.eq_ignore_ascii_case(b"priority") {
            request.priority = std::str::from_utf8(value)
                .ok()
                .and_then(|v| v.parse().ok())
                .ok_or(ParseError("bad priority"))?;
        } else if name.eq_ignore_ascii_case(b"option") {
            parse_options(value, &mut request);
        }
    }

    let total = head_end + 4 + content_length;
    if buf.len() < total {
        return Ok(None);
    }
    request.body = Bytes::copy_from_slice(&buf[head_end + 4..total]);
    Ok(Some((request, total)))
}

fn parse_request_line(line: &[u8]) -> Result<(Method, String), ParseError> {
    let mut parts = line.split(|&b| b == b' ').filter(|p| !p.is_empty());
    let method = match parts.next().ok_or(ParseError("missing method"))? {
        b"GET" => Method::Get,
        b"POST" => Method::Post,
        _ => Method::Other,
    };
    let target = parts.next().ok_or(ParseError("missing request target"))?;
    parts.next().ok_or(ParseError("missing protocol version"))?;

    // the query string is irrelevant to dispatch
    let target = match memchr(b'?', target) {
        Some(i) => &target[..i],
        None => target,
    };
    if !target.starts_with(b"/") {
        return Err(ParseError("request target must be absolute"));
    }
    Ok((method, text(target)?))
}

fn parse_options(value: &[u8], request: &mut Request) {
    for option in value.split(|&b| b == b',') {
        let option = trim(option);
        if option.eq_ignore_ascii_case(b"noid") {
            request.noid = true;
        } else if option.eq_ignore_ascii_case(b"fail-on-disconnect")
            || option.eq_ignore_ascii_case(b"fail")
        {
            request.fail_on_disconnect = true;
        }
    }
}

fn trim(value: &[u8]) -> &[u8] {
    let start = value
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or_else(|| value.len());
    let end = value
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &value[start..end]
}

fn text(value: &[u8]) -> Result<String, ParseError> {
    std::str::from_utf8(value)
        .map(str::to_string)
        .map_err(|_| ParseError("header is not valid utf-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(input: &[u8]) -> (Request, usize) {
        parse(input).unwrap().expect("request is complete")
    }

    #[test]
    fn full_request() {
        let (request, consumed) = parse_all(
            b"POST /math/add HTTP/1.1\r\nId: 7\r\nPriority: 3\r\nContent-Length: 4\r\n\r\nbody",
        );
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.path, "/math/add");
        assert_eq!(request.id.as_deref(), Some("7"));
        assert_eq!(request.priority, 3);
        assert_eq!(&request.body[..], b"body");
        assert_eq!(
            consumed,
            b"POST /math/add HTTP/1.1\r\nId: 7\r\nPriority: 3\r\nContent-Length: 4\r\n\r\nbody"
                .len()
        );
    }

    #[test]
    fn partial_feeds() {
        let full = b"GET /rpc/add HTTP/1.1\r\nName: foo, bar\r\nContent-Length: 2\r\n\r\nok";
        for cut in 1..full.len() {
            assert!(
                parse(&full[..cut]).unwrap().is_none(),
                "cut at {} should be incomplete",
                cut
            );
        }
        let (request, consumed) = parse_all(full);
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.name.as_deref(), Some("foo, bar"));
        assert_eq!(consumed, full.len());
    }

    #[test]
    fn pipelined_requests() {
        let two = b"POST /a HTTP/1.1\r\nContent-Length: 1\r\n\r\nxPOST /b HTTP/1.1\r\nContent-Length: 0\r\n\r\n";
        let (first, consumed) = parse_all(two);
        assert_eq!(first.path, "/a");
        assert_eq!(&first.body[..], b"x");
        let (second, _) = parse_all(&two[consumed..]);
        assert_eq!(second.path, "/b");
        assert!(second.body.is_empty());
    }

    #[test]
    fn header_names_are_case_insensitive() {
        let (request, _) = parse_all(
            b"POST /x HTTP/1.1\r\ncontent-length: 2\r\nID: abc\r\nOPTION: noid, fail\r\n\r\nhi",
        );
        assert_eq!(request.id.as_deref(), Some("abc"));
        assert!(request.noid);
        assert!(request.fail_on_disconnect);
    }

    #[test]
    fn missing_content_length_means_empty_body() {
        let (request, consumed) = parse_all(b"GET /rpc/details HTTP/1.1\r\n\r\n");
        assert_eq!(request.path, "/rpc/details");
        assert!(request.body.is_empty());
        assert_eq!(consumed, b"GET /rpc/details HTTP/1.1\r\n\r\n".len());
    }

    #[test]
    fn query_string_is_stripped() {
        let (request, _) = parse_all(b"GET /jobs/run?debug=1 HTTP/1.1\r\n\r\n");
        assert_eq!(request.path, "/jobs/run");
    }

    #[test]
    fn oversized_head_is_rejected() {
        let mut big = Vec::from(&b"GET / HTTP/1.1\r\nPad: "[..]);
        big.extend(std::iter::repeat(b'x').take(MAX_HEAD + 1));
        assert!(parse(&big).is_err());
    }

    #[test]
    fn header_without_colon_is_rejected() {
        assert!(parse(b"GET / HTTP/1.1\r\nbogus line\r\n\r\n").is_err());
    }
}
