// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Wires the pipeline together: capture threads feed the fan-in channel,
//! the assembler loop feeds per-flow consumers, consumers feed the
//! forwarder.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use http::Method;
use tokio::sync::mpsc;

use crate::{
    addr::AddrList,
    capture,
    chomp::FlowKey,
    forward::{Forwarder, HeaderOverrides},
    http_read::RequestReader,
    tcp_reassemble::{ByteReceiver, FlowTable},
    Error,
};

/// Fan-in queue depth. Producers block when it fills.
const FAN_IN_CAPACITY: usize = 100;

const FLUSH_INTERVAL: Duration = Duration::from_secs(60);
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Everything the CLI can configure.
#[derive(Clone, Debug)]
pub struct Options {
    pub sources: Vec<String>,
    pub destinations: Vec<String>,
    pub headers: Vec<String>,
    pub methods: Vec<String>,
    pub multiply: f64,
    pub verbose: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            sources: vec!["*:80".to_owned()],
            destinations: Vec::new(),
            headers: Vec::new(),
            methods: Vec::new(),
            multiply: 1.0,
            verbose: false,
        }
    }
}

pub struct Wiretap {
    sources: AddrList,
    destinations: AddrList,
    interfaces: Vec<String>,
    forwarder: Arc<Forwarder>,
    verbose: bool,
}

impl Wiretap {
    /// Resolves and validates the whole configuration. Everything fatal
    /// about the options surfaces here, before any capture handle is opened.
    pub fn new(opts: Options) -> Result<Wiretap, Error> {
        let sources = AddrList::resolve_patterns(&opts.sources)?;
        let destinations = AddrList::resolve_list(&opts.destinations)?;
        let overrides = HeaderOverrides::parse(&opts.headers)?;
        let methods = parse_methods(&opts.methods)?;
        let forwarder = Arc::new(Forwarder::new(
            destinations.clone(),
            overrides,
            methods,
            opts.multiply,
            opts.verbose,
        )?);

        Ok(Wiretap {
            sources,
            destinations,
            interfaces: capture::find_interfaces(),
            forwarder,
            verbose: opts.verbose,
        })
    }

    /// Runs the wiretap until the capture sources all terminate, which for
    /// live interfaces means forever; shutdown is by process termination.
    pub async fn run(self) -> Result<(), Error> {
        let sources = capture::open_all(
            &self.interfaces,
            &self.sources.filter(),
            self.sources.requires_promisc(),
        )?;

        if self.verbose {
            eprintln!("Listening on interfaces {}", self.interfaces.join(", "));
            eprintln!("Using pcap filter: \"{}\"", self.sources.filter());
        }
        eprintln!(
            "Wiretapping HTTP traffic to {} and forwarding to {}...",
            self.sources, self.destinations
        );

        let (tx, mut rx) = mpsc::channel(FAN_IN_CAPACITY);
        for source in sources {
            source.spawn(tx.clone());
        }
        drop(tx);

        let forwarder = self.forwarder.clone();
        let mut flows = FlowTable::new(move |key: FlowKey, stream: ByteReceiver| {
            tokio::spawn(consume_flow(key, stream, forwarder.clone()));
        });

        // The assembler loop: the only place the flow table is touched.
        let start = tokio::time::Instant::now() + FLUSH_INTERVAL;
        let mut flush = tokio::time::interval_at(start, FLUSH_INTERVAL);
        loop {
            tokio::select! {
                seg = rx.recv() => match seg {
                    Some(seg) => flows.ingest(seg, Instant::now()),
                    None => break,
                },
                _ = flush.tick() => {
                    if let Some(cutoff) = Instant::now().checked_sub(IDLE_TIMEOUT) {
                        flows.flush_older_than(cutoff);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Reads requests off one flow until its stream ends, handing each to the
/// forwarder as soon as its body is complete.
async fn consume_flow(key: FlowKey, stream: ByteReceiver, forwarder: Arc<Forwarder>) {
    let mut reader = RequestReader::new(stream);
    while let Some(req) = reader.next_request().await {
        forwarder.forward(key, req);
    }
}

fn parse_methods(methods: &[String]) -> Result<Option<Vec<Method>>, Error> {
    if methods.is_empty() {
        return Ok(None);
    }
    methods
        .iter()
        .map(|m| {
            Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                .map_err(|_| Error::BadMethod(m.clone()))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}
