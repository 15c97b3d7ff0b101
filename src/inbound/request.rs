//! Client request head: parsing, header injection and proxy-form encoding
//!
//! Only the head is parsed. Whatever follows it (body, tunnelled bytes) is
//! relayed untouched.

use crate::{Error, Result};

/// Upper bound on a request head
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

const MAX_HEADERS: usize = 128;

/// Credential header presented to the fallback
pub const AUTH_TOKEN_HEADER: &str = "X-LANTERN-AUTH-TOKEN";

/// Random-length header that varies request size
pub const PADDING_HEADER: &str = "X_LANTERN-RANDOM-LENGTH-HEADER";

/// Parsed request line and headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    method: String,
    proxy_uri: String,
    headers: Vec<(String, Vec<u8>)>,
}

impl RequestHead {
    /// Parse a head from the front of `buf`.
    ///
    /// Returns `Ok(None)` while the head is incomplete, otherwise the head and
    /// the number of bytes it occupied.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let len = match req.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(Error::protocol(format!("Malformed request: {}", e))),
        };

        let method = req
            .method
            .ok_or_else(|| Error::protocol("Missing method"))?
            .to_string();
        let target = req
            .path
            .ok_or_else(|| Error::protocol("Missing request target"))?
            .to_string();
        let headers: Vec<(String, Vec<u8>)> = req
            .headers
            .iter()
            .map(|h| (h.name.to_string(), h.value.to_vec()))
            .collect();

        let proxy_uri = proxy_form(&method, &target, &headers)?;

        Ok(Some((
            RequestHead {
                method,
                proxy_uri,
                headers,
            },
            len,
        )))
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Target as forwarded: absolute URI, or authority form for CONNECT
    pub fn proxy_uri(&self) -> &str {
        &self.proxy_uri
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// First value of a header, case-insensitive
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// Replace every value of `name` with `value`
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.as_bytes().to_vec()));
    }

    /// Serialize in proxy form for the upstream fallback
    pub fn encode_proxy(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.headers.len() * 32);
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.proxy_uri.as_bytes());
        out.extend_from_slice(b" HTTP/1.1\r\n");

        if self.header("host").is_none() {
            if let Some(authority) = authority_of(&self.proxy_uri, self.is_connect()) {
                out.extend_from_slice(b"Host: ");
                out.extend_from_slice(authority.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
        }

        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

fn has_scheme(target: &str) -> bool {
    let lower = target.get(..8).unwrap_or(target).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn proxy_form(method: &str, target: &str, headers: &[(String, Vec<u8>)]) -> Result<String> {
    if method.eq_ignore_ascii_case("CONNECT") || has_scheme(target) {
        return Ok(target.to_string());
    }

    if target.starts_with('/') {
        let host = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("host"))
            .and_then(|(_, v)| std::str::from_utf8(v).ok())
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::protocol("Request has no host"))?;
        return Ok(format!("http://{}{}", host, target));
    }

    Err(Error::protocol(format!("Unsupported request target: {}", target)))
}

fn authority_of(uri: &str, connect: bool) -> Option<&str> {
    if connect {
        return Some(uri);
    }
    let rest = uri.split_once("://")?.1;
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..end];
    (!authority.is_empty()).then_some(authority)
}
