// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Live packet sources. One capture handle per interface, each driven by a
//! dedicated OS thread (libpcap reads block), all feeding the shared fan-in
//! channel.

use std::thread;

use pcap::{Active, Capture, Device};
use tokio::sync::mpsc;

use crate::{chomp, tcp_reassemble::Segment, Error};

const SNAPLEN: i32 = 65535;
const READ_TIMEOUT_MS: i32 = 10;

/// Interfaces worth wiretapping: everything carrying at least one address.
/// VMware host interfaces are rejected by libpcap, so they are skipped up
/// front.
pub fn find_interfaces() -> Vec<String> {
    Device::list()
        .unwrap_or_default()
        .into_iter()
        .filter(|dev| !dev.addresses.is_empty() && !dev.name.starts_with("vmnet"))
        .map(|dev| dev.name)
        .collect()
}

pub struct PacketSource {
    name: String,
    capture: Capture<Active>,
    linktype: i32,
}

impl PacketSource {
    pub fn open(interface: &str, filter: &str, promisc: bool) -> Result<PacketSource, Error> {
        let mut capture = Capture::from_device(interface)?
            .snaplen(SNAPLEN)
            .promisc(promisc)
            .timeout(READ_TIMEOUT_MS)
            .open()?;
        capture.filter(filter, true)?;
        let linktype = capture.get_datalink().0;
        Ok(PacketSource {
            name: interface.to_owned(),
            capture,
            linktype,
        })
    }

    /// Moves the source onto its own thread. A full fan-in queue blocks the
    /// thread here, which is the pipeline's backpressure point; packets are
    /// never dropped on our side of libpcap.
    pub fn spawn(self, tx: mpsc::Sender<Segment>) {
        thread::spawn(move || self.run(tx));
    }

    fn run(mut self, tx: mpsc::Sender<Segment>) {
        loop {
            match self.capture.next_packet() {
                Ok(packet) => {
                    // The packet borrows libpcap's own buffer; decode now,
                    // before the next read invalidates it.
                    if let Some(seg) = chomp::decode_frame(self.linktype, packet.data) {
                        if tx.blocking_send(seg).is_err() {
                            return;
                        }
                    }
                }
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(pcap::Error::NoMorePackets) => return,
                Err(err) => {
                    tracing::debug!("read error on {}: {err}", self.name);
                }
            }
        }
    }
}

/// Opens a source per interface. A lone interface that fails to open is
/// fatal; with several, failures are logged and the interface skipped.
/// Coming up with zero sources is always fatal.
pub fn open_all(interfaces: &[String], filter: &str, promisc: bool) -> Result<Vec<PacketSource>, Error> {
    let mut sources = Vec::new();
    for interface in interfaces {
        match PacketSource::open(interface, filter, promisc) {
            Ok(source) => sources.push(source),
            Err(err) if interfaces.len() == 1 => return Err(err),
            Err(err) => tracing::error!("Error: cannot capture on {interface}: {err}"),
        }
    }
    if sources.is_empty() {
        return Err(Error::NoInterfaces);
    }
    Ok(sources)
}
