// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Duplicates captured requests across the configured destinations and
//! performs the outbound round-trips.

use std::{collections::HashMap, sync::Arc, time::Duration};

use http::{
    header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING, USER_AGENT},
    HeaderMap, HeaderName, HeaderValue, Method, Uri,
};
use rand::Rng;

use crate::{
    addr::{Addr, AddrList},
    chomp::FlowKey,
    http_read::CapturedRequest,
    Error,
};

/// Pause between repeated copies of the same request.
pub const REPEAT_DELAY: Duration = Duration::from_secs(2);

/// Idle outbound connections kept per destination host.
const MAX_IDLE_CONNS_PER_HOST: usize = 16;

/// Lowercased header name to replacement value. An empty replacement deletes
/// the header; deleting `user-agent` re-inserts it empty so the outbound
/// client sends none at all.
#[derive(Clone, Debug, Default)]
pub struct HeaderOverrides(HashMap<String, String>);

impl HeaderOverrides {
    /// Parses repeated `Name: Value` occurrences of the header flag.
    pub fn parse(lines: &[String]) -> Result<HeaderOverrides, Error> {
        let mut map = HashMap::new();
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::BadHeader(line.clone()))?;
            let name = name.trim().to_ascii_lowercase();
            if HeaderName::from_bytes(name.as_bytes()).is_err() {
                return Err(Error::BadHeader(line.clone()));
            }
            map.insert(name, value.trim_start().to_owned());
        }
        Ok(HeaderOverrides(map))
    }

    /// Applies the table to a captured header map, once per request, before
    /// any copies are made. A `host` override also rewrites the request
    /// authority, which for the forwarded form is the Host header itself.
    fn apply(&self, headers: &mut HeaderMap) {
        for (key, value) in &self.0 {
            let name = HeaderName::from_bytes(key.as_bytes()).unwrap();
            if value.is_empty() {
                headers.remove(&name);
                if name == USER_AGENT {
                    headers.insert(USER_AGENT, HeaderValue::from_static(""));
                }
            } else if let Ok(value) = HeaderValue::from_str(value) {
                headers.insert(name, value);
            }
        }
    }
}

/// Copies per destination for one captured request: the fractional part of
/// the multiplier is a probability, and at least one copy is always sent.
fn repeat_count(multiply: f64) -> u32 {
    if !multiply.is_finite() || multiply <= 1.0 {
        return 1;
    }
    let extra = rand::thread_rng().gen_bool(multiply.fract()) as u32;
    (multiply.trunc() as u32 + extra).max(1)
}

/// The URL the client was originally requesting, for the outcome log.
fn original_url(parts: &http::request::Parts, key: FlowKey) -> String {
    let host = parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_owned())
        .unwrap_or_else(|| key.dst().to_string());
    format!("http://{}{}", host, path_and_query(&parts.uri))
}

fn path_and_query(uri: &Uri) -> &str {
    uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
}

/// The authority a copy is dispatched to: the destination itself, or the
/// observed destination of the flow when the IP is the unspecified sentinel.
fn dispatch_authority(dst: Addr, key: FlowKey) -> String {
    let ip = dst.ip.unwrap_or(key.dst_ip);
    std::net::SocketAddr::new(ip, dst.port).to_string()
}

pub struct Forwarder {
    destinations: AddrList,
    overrides: HeaderOverrides,
    methods: Option<Vec<Method>>,
    multiply: f64,
    repeat_delay: Duration,
    verbose: bool,
    client: reqwest::Client,
}

impl Forwarder {
    pub fn new(
        destinations: AddrList,
        overrides: HeaderOverrides,
        methods: Option<Vec<Method>>,
        multiply: f64,
        verbose: bool,
    ) -> Result<Forwarder, Error> {
        if destinations.is_empty() {
            return Err(Error::NoDestinations);
        }
        // Header names live in a HeaderMap and so are lowercased in memory;
        // title-casing on the wire restores the canonical form clients sent
        // them in.
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(MAX_IDLE_CONNS_PER_HOST)
            .http1_title_case_headers()
            .build()?;
        Ok(Forwarder {
            destinations,
            overrides,
            methods,
            multiply,
            repeat_delay: REPEAT_DELAY,
            verbose,
            client,
        })
    }

    /// Shortens the pause between repeated copies; the tests use this.
    pub fn with_repeat_delay(mut self, delay: Duration) -> Forwarder {
        self.repeat_delay = delay;
        self
    }

    /// Fans one captured request out to every destination. Each destination
    /// gets its own worker task so a slow or repeating destination never
    /// blocks the others; per-copy failures are logged and contained.
    pub fn forward(self: &Arc<Self>, key: FlowKey, mut req: CapturedRequest) {
        if let Some(methods) = &self.methods {
            if !methods.contains(&req.parts.method) {
                tracing::debug!("skipping {} request from {}", req.parts.method, key.src());
                return;
            }
        }

        let url = original_url(&req.parts, key);
        self.overrides.apply(&mut req.parts.headers);
        let req = Arc::new(req);

        for dst in self.destinations.iter().copied() {
            let fwd = self.clone();
            let req = req.clone();
            let url = url.clone();
            tokio::spawn(async move {
                let copies = repeat_count(fwd.multiply);
                for n in 0..copies {
                    if n > 0 {
                        tokio::time::sleep(fwd.repeat_delay).await;
                    }
                    fwd.dispatch(&req, key, dst, &url, n > 0).await;
                }
            });
        }
    }

    /// One outbound round-trip. No retries; the outcome is a log line either
    /// way.
    async fn dispatch(
        &self,
        req: &CapturedRequest,
        key: FlowKey,
        dst: Addr,
        original_url: &str,
        repeat: bool,
    ) {
        let authority = dispatch_authority(dst, key);
        let target = format!("http://{}{}", authority, path_and_query(&req.parts.uri));

        // The body was fully buffered at capture time, so its length is
        // authoritative; framing headers from the wire may disagree with it
        // and are recomputed by the client.
        let mut headers = req.parts.headers.clone();
        headers.remove(CONTENT_LENGTH);
        headers.remove(TRANSFER_ENCODING);

        let outbound = self
            .client
            .request(req.parts.method.clone(), target.as_str())
            .headers(headers)
            .body(req.body.clone())
            .build();
        let outbound = match outbound {
            Ok(outbound) => outbound,
            Err(err) => {
                tracing::error!("Error: {err}");
                return;
            }
        };

        match self.client.execute(outbound).await {
            Ok(response) => {
                let repeat = if repeat { " REPEAT" } else { "" };
                tracing::info!(
                    "{} {} {} ({}{}) {}",
                    key.src(),
                    req.parts.method,
                    original_url,
                    authority,
                    repeat,
                    response.status().as_u16()
                );
                if self.verbose {
                    print!("{}", request_head(req, &authority));
                }
            }
            Err(err) => tracing::error!("Error: {err}"),
        }
    }
}

/// The outbound request head, body stripped, for verbose dumps. Header
/// names are shown the way the client writes them on the wire.
fn request_head(req: &CapturedRequest, authority: &str) -> String {
    let mut out = format!(
        "{} {} {:?}\r\n",
        req.parts.method,
        path_and_query(&req.parts.uri),
        req.parts.version
    );
    if !req.parts.headers.contains_key(HOST) {
        out.push_str(&format!("Host: {authority}\r\n"));
    }
    for (name, value) in &req.parts.headers {
        out.push_str(&format!(
            "{}: {}\r\n",
            title_case(name.as_str()),
            value.to_str().unwrap_or("")
        ));
    }
    out.push_str("\r\n");
    out
}

/// Canonical `Word-Word` header casing, as hyper's title-case mode emits it.
fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for ch in name.chars() {
        if upper {
            out.extend(ch.to_uppercase());
        } else {
            out.push(ch);
        }
        upper = ch == '-';
    }
    out
}
