//! Inbound request extraction and the URL & Range parser.
//!
//! # Responsibilities
//! - Build the immutable [`StreamRequest`] from an HTTP request
//! - Parse and structurally validate the target URL
//! - Parse the `Range` header (`bytes=<start>-[<end>]` only)
//!
//! # Design Decisions
//! - Parsing is pure and synchronous; no upstream I/O happens here
//! - A malformed `Range` header is a hard error, never silently dropped
//! - The raw target string is kept alongside the parsed URL because URL
//!   normalization erases `../` segments the attack detector must see

use std::net::IpAddr;
use std::sync::LazyLock;
use std::time::SystemTime;

use axum::http::{header, HeaderMap, Method, Request};
use regex::Regex;
use url::Url;

/// Header carrying the per-request correlation id.
pub const X_REQUEST_ID: &str = "x-request-id";

static RANGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^bytes=([0-9]+)-([0-9]*)$").expect("Invalid range regex"));

/// Why a request could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("missing target url")]
    MissingTarget,
    #[error("malformed target url: {0}")]
    MalformedUrl(String),
    #[error("unsupported url scheme '{0}', only http and https are allowed")]
    UnsupportedScheme(String),
    #[error("malformed Range header: {0}")]
    MalformedRange(String),
}

impl ParseError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ParseError::MissingTarget => "MISSING_TARGET",
            ParseError::MalformedUrl(_) => "MALFORMED_URL",
            ParseError::UnsupportedScheme(_) => "UNSUPPORTED_SCHEME",
            ParseError::MalformedRange(_) => "MALFORMED_RANGE",
        }
    }
}

/// One inbound playback request. Created once, never mutated.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub request_id: String,
    pub method: Method,
    /// The target exactly as the client sent it (after query decoding). Empty when absent.
    pub target_url: String,
    pub range_header: Option<String>,
    pub client_ip: IpAddr,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
    pub received_at: SystemTime,
}

impl StreamRequest {
    /// Extract the gateway's view of an HTTP request.
    ///
    /// The peer address is used as client IP unless `trust_forwarded_for` is set
    /// and a parseable `X-Forwarded-For` entry is present.
    pub fn from_http<B>(request: &Request<B>, peer_ip: IpAddr, trust_forwarded_for: bool) -> Self {
        let headers = request.headers();
        let target_url = request
            .uri()
            .query()
            .and_then(|query| {
                url::form_urlencoded::parse(query.as_bytes())
                    .find(|(key, _)| key == "url")
                    .map(|(_, value)| value.into_owned())
            })
            .unwrap_or_default();

        let client_ip = if trust_forwarded_for {
            forwarded_ip(headers).unwrap_or(peer_ip)
        } else {
            peer_ip
        };

        Self {
            request_id: header_string(headers, X_REQUEST_ID)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            method: request.method().clone(),
            target_url,
            range_header: header_string(headers, header::RANGE.as_str()),
            client_ip,
            user_agent: header_string(headers, header::USER_AGENT.as_str()),
            referrer: header_string(headers, header::REFERER.as_str()),
            received_at: SystemTime::now(),
        }
    }
}

/// Lossy header read: values that are not visible ASCII are kept as replacement text
/// so later validation can reject them instead of treating them as absent.
fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// A validated `Range: bytes=start-[end]` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ParsedRange {
    /// Number of bytes requested, when the range is closed.
    pub fn len(&self) -> Option<u64> {
        self.end.and_then(|end| (end - self.start).checked_add(1))
    }
}

/// Output of the parser: a usable target and the optional byte range.
#[derive(Debug, Clone)]
pub struct ParsedTarget {
    pub url: Url,
    pub range: Option<ParsedRange>,
}

/// Parse the raw target and `Range` header.
pub fn parse(raw_url: &str, raw_range: Option<&str>) -> Result<ParsedTarget, ParseError> {
    let raw_url = raw_url.trim();
    if raw_url.is_empty() {
        return Err(ParseError::MissingTarget);
    }

    let url = Url::parse(raw_url).map_err(|e| ParseError::MalformedUrl(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(ParseError::UnsupportedScheme(other.to_string())),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ParseError::MalformedUrl("missing host".to_string()));
    }

    let range = raw_range.map(parse_range).transpose()?;

    Ok(ParsedTarget { url, range })
}

/// Parse a single-range `bytes=start-[end]` header value.
pub fn parse_range(raw: &str) -> Result<ParsedRange, ParseError> {
    let malformed = || ParseError::MalformedRange(raw.to_string());
    let captures = RANGE.captures(raw).ok_or_else(malformed)?;

    let start: u64 = captures[1].parse().map_err(|_| malformed())?;
    let end = match &captures[2] {
        "" => None,
        digits => Some(digits.parse::<u64>().map_err(|_| malformed())?),
    };

    if matches!(end, Some(end) if end < start) {
        return Err(malformed());
    }

    Ok(ParsedRange { start, end })
}
