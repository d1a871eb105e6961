// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Parses successive HTTP requests out of a flow's reassembled byte stream,
//! using httparse for the wire format and the http crate for the parsed
//! representation.

use http::{
    header::{CONTENT_LENGTH, TRANSFER_ENCODING},
    HeaderMap, HeaderName, HeaderValue,
};

use crate::tcp_reassemble::ByteReceiver;

const MAX_HEADERS: usize = 100;

/// A fully captured request. The body is materialized before the record is
/// released so every forwarded copy can own an independent reader; the flow
/// buffer is never referenced again.
#[derive(Debug)]
pub struct CapturedRequest {
    pub parts: http::request::Parts,
    pub body: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
enum HttpParseError {
    #[error("bad http version 1.{0}")]
    BadVersion(u8),
    #[error("bad uri: {0}")]
    BadUri(#[from] http::uri::InvalidUri),
    #[error("bad method: {0}")]
    InvalidMethod(#[from] http::method::InvalidMethod),
    #[error("failed to parse request: {0}")]
    ParseFailed(#[from] httparse::Error),
}

// the constructor is private
fn new_req_parts() -> http::request::Parts {
    http::Request::new(()).into_parts().0
}

fn decode_http1_version(v: u8) -> Result<http::Version, HttpParseError> {
    Ok(match v {
        0 => http::Version::HTTP_10,
        1 => http::Version::HTTP_11,
        v => return Err(HttpParseError::BadVersion(v)),
    })
}

fn to_header_map(headers: &[httparse::Header<'_>]) -> HeaderMap {
    let mut header_map = HeaderMap::new();
    for h in headers {
        if *h == httparse::EMPTY_HEADER {
            break;
        }
        header_map.append(
            match HeaderName::from_bytes(h.name.as_bytes()) {
                Ok(v) => v,
                Err(err) => {
                    tracing::debug!("invalid http header {err}");
                    continue;
                }
            },
            match HeaderValue::try_from(h.value) {
                Ok(v) => v,
                Err(err) => {
                    tracing::debug!("invalid http header value: {err}");
                    continue;
                }
            },
        );
    }
    header_map
}

fn content_length(hm: &HeaderMap) -> usize {
    hm.get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok()?.trim().parse().ok())
        .unwrap_or(0)
}

fn is_chunked(hm: &HeaderMap) -> bool {
    hm.get(TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

/// Parses a request head out of `buf`. `Ok(None)` means more data is needed.
fn parse_head(buf: &[u8]) -> Result<Option<(http::request::Parts, usize)>, HttpParseError> {
    let mut headers = vec![httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    match request.parse(buf) {
        Ok(httparse::Status::Partial) => Ok(None),
        Ok(httparse::Status::Complete(body_start)) => {
            let mut parts = new_req_parts();
            parts.method = http::Method::from_bytes(request.method.unwrap().as_bytes())?;
            parts.uri = request.path.unwrap().parse::<http::Uri>()?;
            parts.version = decode_http1_version(request.version.unwrap())?;
            parts.headers = to_header_map(&headers);
            Ok(Some((parts, body_start)))
        }
        Err(err) => Err(err.into()),
    }
}

const METHODS: &[&[u8]] = &[
    b"GET ", b"POST ", b"PUT ", b"DELETE ", b"HEAD ", b"OPTIONS ", b"PATCH ", b"CONNECT ",
    b"TRACE ",
];

/// Reads successive HTTP requests from a flow's byte stream. One per flow;
/// lives on the consumer task.
pub struct RequestReader {
    rx: ByteReceiver,
    buf: Vec<u8>,
    closed: bool,
}

impl RequestReader {
    pub fn new(rx: ByteReceiver) -> RequestReader {
        RequestReader {
            rx,
            buf: Vec::new(),
            closed: false,
        }
    }

    /// Waits for more stream data. False once the flow has ended and the
    /// buffer is all there will ever be.
    async fn fill(&mut self) -> bool {
        if self.closed {
            return false;
        }
        match self.rx.recv().await {
            Some(chunk) => {
                self.buf.extend_from_slice(&chunk);
                true
            }
            None => {
                self.closed = true;
                false
            }
        }
    }

    /// The next complete request on the flow, or `None` at end-of-stream.
    ///
    /// Parse errors do not end the stream: they are logged and the reader
    /// skips ahead to the next plausible message boundary, so pipelined
    /// requests after a malformed one still come through.
    pub async fn next_request(&mut self) -> Option<CapturedRequest> {
        loop {
            if self.buf.is_empty() && self.closed {
                return None;
            }
            match parse_head(&self.buf) {
                Ok(Some((parts, body_start))) => {
                    self.buf.drain(..body_start);
                    let body = self.read_body(&parts.headers).await;
                    return Some(CapturedRequest { parts, body });
                }
                Ok(None) => {
                    if !self.fill().await {
                        if !self.buf.is_empty() {
                            tracing::debug!(
                                "discarding {} trailing bytes at end of stream",
                                self.buf.len()
                            );
                            self.buf.clear();
                        }
                        return None;
                    }
                }
                Err(err) => {
                    tracing::error!("Error: {err}");
                    self.resync();
                }
            }
        }
    }

    /// Materializes the body that follows an already-consumed head. An
    /// `Expect: 100-continue` is not answered (we never speak into the
    /// observed flow); whatever body bytes follow are taken as the body.
    /// Stream end mid-body yields the bytes seen so far.
    async fn read_body(&mut self, headers: &HeaderMap) -> Vec<u8> {
        if is_chunked(headers) {
            return self.read_chunked_body().await;
        }
        let want = content_length(headers);
        while self.buf.len() < want {
            if !self.fill().await {
                break;
            }
        }
        let take = want.min(self.buf.len());
        self.buf.drain(..take).collect()
    }

    async fn read_chunked_body(&mut self) -> Vec<u8> {
        let mut body = Vec::new();
        loop {
            let line_end = loop {
                match find_crlf(&self.buf) {
                    Some(pos) => break pos,
                    None => {
                        if !self.fill().await {
                            return body;
                        }
                    }
                }
            };
            let size = match parse_chunk_size(&self.buf[..line_end]) {
                Some(size) => size,
                None => {
                    tracing::debug!("bad chunk size line, truncating body");
                    return body;
                }
            };
            self.buf.drain(..line_end + 2);

            if size == 0 {
                // Trailer section: discard lines through the final blank one.
                loop {
                    match find_crlf(&self.buf) {
                        Some(0) => {
                            self.buf.drain(..2);
                            return body;
                        }
                        Some(pos) => {
                            self.buf.drain(..pos + 2);
                        }
                        None => {
                            if !self.fill().await {
                                return body;
                            }
                        }
                    }
                }
            }

            while self.buf.len() < size + 2 {
                if !self.fill().await {
                    let take = size.min(self.buf.len());
                    body.extend_from_slice(&self.buf[..take]);
                    self.buf.clear();
                    return body;
                }
            }
            body.extend_from_slice(&self.buf[..size]);
            self.buf.drain(..size + 2);
        }
    }

    /// Cuts the buffer forward to the next line boundary that looks like the
    /// start of a request, or empties it when there is none. Always makes
    /// progress.
    fn resync(&mut self) {
        for i in 1..self.buf.len() {
            if self.buf[i - 1] == b'\n' && METHODS.iter().any(|m| self.buf[i..].starts_with(m)) {
                self.buf.drain(..i);
                return;
            }
        }
        self.buf.clear();
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_chunk_size(line: &[u8]) -> Option<usize> {
    let line = std::str::from_utf8(line).ok()?;
    let size = line.split(';').next()?.trim();
    usize::from_str_radix(size, 16).ok()
}
