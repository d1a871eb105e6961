// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Passive HTTP wiretap: captures TCP traffic bound for a set of source
//! endpoints, reassembles the byte streams, parses the HTTP requests out of
//! them and forwards a copy of each request to a set of destinations. The
//! observed traffic itself is never touched.

pub mod addr;
pub mod capture;
pub mod chomp;
pub mod forward;
pub mod http_read;
pub mod tcp_reassemble;
pub mod wiretap;

pub use addr::AddrList;
pub use wiretap::{Options, Wiretap};

/// Fatal errors. Everything here is reported before or during startup; once
/// the pipeline runs, failures are logged per flow or per dispatched copy and
/// never propagate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot resolve {input} ({reason})")]
    Resolve { input: String, reason: String },
    #[error("invalid header line {0:?} (expected \"Name: Value\")")]
    BadHeader(String),
    #[error("invalid method {0:?}")]
    BadMethod(String),
    #[error("no destinations to forward to")]
    NoDestinations,
    #[error("no interfaces could be opened for capture")]
    NoInterfaces,
    #[error("{0}")]
    Pcap(#[from] pcap::Error),
    #[error("{0}")]
    Client(#[from] reqwest::Error),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}
