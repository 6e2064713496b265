//! Scrape requests and responses, and their HTTP/1.1 wire encoding.
//!
//! The proxy forwards a collector request to a polling client as the raw
//! bytes of an absolute-form HTTP/1.1 request (the body of the `/poll`
//! response), and the client returns the scraped response as the raw bytes
//! of an HTTP/1.1 response (the body of its `/push` request). Both sides
//! fully materialize bodies; nothing here streams.

use std::time::Duration;

use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use url::Url;

/// Correlation id attached by the proxy to every outbound scrape request and
/// echoed back by the client on the pushed response. Stripped before the
/// response reaches the collector.
pub const ID_HEADER: HeaderName = HeaderName::from_static("id");

/// Carries the collector's scrape deadline in fractional seconds. On a push
/// it holds the deadline *remaining* at push time. Stripped before the
/// response reaches the collector.
pub const SCRAPE_TIMEOUT_HEADER: HeaderName =
    HeaderName::from_static("x-prometheus-scrape-timeout-seconds");

const MAX_WIRE_HEADERS: usize = 64;

/// A scrape response with its body materialized.
pub type ScrapeResponse = http::Response<Vec<u8>>;

/// A scrape request as brokered between collector and client. Scrapes are
/// idempotent and carry no body.
#[derive(Debug, Clone)]
pub struct ScrapeRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
}

impl ScrapeRequest {
    /// Serializes the request in absolute form, so the client learns the
    /// full target URL from the request line alone.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(format!("{} {} HTTP/1.1\r\n", self.method, self.url).as_bytes());
        if !self.headers.contains_key(header::HOST) {
            if let Some(host) = self.url.host_str() {
                buf.extend_from_slice(format!("host: {host}\r\n").as_bytes());
            }
        }
        write_headers(&mut buf, &self.headers, &[]);
        buf.extend_from_slice(b"\r\n");
        buf
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed http payload")]
    Parse(#[from] httparse::Error),
    #[error("truncated http payload")]
    Incomplete,
    #[error("invalid header or status line")]
    Header(#[from] http::Error),
    #[error("request line is not absolute-form")]
    NotAbsolute,
}

/// Parses the wire-format request a client receives from `/poll`.
pub fn parse_request(buf: &[u8]) -> Result<ScrapeRequest, WireError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_WIRE_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    if let httparse::Status::Partial = parsed.parse(buf)? {
        return Err(WireError::Incomplete);
    }
    let (method, path) = match (parsed.method, parsed.path) {
        (Some(m), Some(p)) => (m, p),
        _ => return Err(WireError::Incomplete),
    };
    let url = Url::parse(path).map_err(|_| WireError::NotAbsolute)?;
    Ok(ScrapeRequest {
        method: method.parse().map_err(http::Error::from)?,
        url,
        headers: collect_headers(parsed.headers)?,
    })
}

/// Parses the wire-format response a client pushes to `/push`. The body is
/// whatever follows the header block; a stale `Content-Length` from before
/// materialization is not trusted.
pub fn parse_response(buf: &[u8]) -> Result<ScrapeResponse, WireError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_WIRE_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);
    let header_len = match parsed.parse(buf)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Err(WireError::Incomplete),
    };
    let status = match parsed.code {
        Some(code) => StatusCode::from_u16(code).map_err(http::Error::from)?,
        None => return Err(WireError::Incomplete),
    };
    let mut response = http::Response::new(buf[header_len..].to_vec());
    *response.status_mut() = status;
    *response.headers_mut() = collect_headers(parsed.headers)?;
    Ok(response)
}

/// Serializes a materialized response for a `/push` body. `Content-Length`
/// is recomputed and any `Transfer-Encoding` left over from the original
/// transfer is dropped.
pub fn encode_response(response: &ScrapeResponse) -> Vec<u8> {
    let status = response.status();
    let mut buf = Vec::with_capacity(256 + response.body().len());
    buf.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    write_headers(
        &mut buf,
        response.headers(),
        &[header::CONTENT_LENGTH, header::TRANSFER_ENCODING],
    );
    buf.extend_from_slice(format!("content-length: {}\r\n\r\n", response.body().len()).as_bytes());
    buf.extend_from_slice(response.body());
    buf
}

/// Reads the scrape-timeout header as a duration. Absent, unparsable, or
/// non-positive values yield `None` and the caller's default applies.
pub fn scrape_timeout(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(&SCRAPE_TIMEOUT_HEADER)?.to_str().ok()?;
    let seconds: f64 = raw.trim().parse().ok()?;
    if seconds.is_finite() && seconds > 0.0 {
        Some(Duration::from_secs_f64(seconds))
    } else {
        None
    }
}

/// Formats a remaining deadline the way `scrape_timeout` reads it.
pub fn format_scrape_timeout(remaining: Duration) -> HeaderValue {
    HeaderValue::from_str(&format!("{}", remaining.as_secs_f64())).expect("can't fail")
}

fn write_headers(buf: &mut Vec<u8>, headers: &HeaderMap, skip: &[HeaderName]) {
    for (name, value) in headers {
        if skip.contains(name) {
            continue;
        }
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Result<HeaderMap, WireError> {
    let mut headers = HeaderMap::with_capacity(parsed.len());
    for h in parsed {
        headers.append(
            HeaderName::from_bytes(h.name.as_bytes()).map_err(http::Error::from)?,
            HeaderValue::from_bytes(h.value).map_err(http::Error::from)?,
        );
    }
    Ok(headers)
}
