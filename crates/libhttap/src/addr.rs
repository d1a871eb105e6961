// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Resolved wiretap endpoints and the capture filter derived from them.

use std::{
    fmt,
    net::{IpAddr, SocketAddr, ToSocketAddrs},
};

use crate::Error;

/// A resolved TCP endpoint. An `ip` of `None` is the unspecified sentinel:
/// such a destination mirrors to whatever host the observed flow was
/// reaching, filled in at dispatch time. Sentinels never appear in source
/// lists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Addr {
    pub ip: Option<IpAddr>,
    pub port: u16,
}

impl Addr {
    pub fn new(ip: IpAddr, port: u16) -> Addr {
        Addr { ip: Some(ip), port }
    }

    pub fn unspecified(port: u16) -> Addr {
        Addr { ip: None, port }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            Some(ip) => write!(f, "{}", SocketAddr::new(ip, self.port)),
            None => write!(f, ":{}", self.port),
        }
    }
}

/// Ordered set of endpoints, deduplicated structurally in first-seen order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddrList(Vec<Addr>);

impl AddrList {
    /// Resolves `HOST[:PORT]` patterns for wiretap sources. A missing port
    /// defaults to 80; `*` or an empty host expands to every address bound
    /// to a local interface.
    pub fn resolve_patterns(strs: &[String]) -> Result<AddrList, Error> {
        Self::resolve_patterns_with(strs, &local_addrs())
    }

    /// Resolves `HOST[:PORT]` strings for forward destinations. A `*` or
    /// empty host becomes the unspecified sentinel instead of expanding.
    pub fn resolve_list(strs: &[String]) -> Result<AddrList, Error> {
        let mut addrs = AddrList::default();
        for str in strs {
            let (host, port) = split_addr(str);
            let port = resolve_port(str, &port)?;
            if host.is_empty() {
                addrs.push(Addr::unspecified(port));
            } else {
                addrs.push(Addr::new(resolve_host(str, &host, port)?, port));
            }
        }
        Ok(addrs)
    }

    fn resolve_patterns_with(strs: &[String], local: &[IpAddr]) -> Result<AddrList, Error> {
        let mut addrs = AddrList::default();
        for str in strs {
            let (host, port) = split_addr(str);
            let port = resolve_port(str, &port)?;
            if host.is_empty() {
                for ip in local {
                    addrs.push(Addr::new(*ip, port));
                }
            } else {
                addrs.push(Addr::new(resolve_host(str, &host, port)?, port));
            }
        }
        Ok(addrs)
    }

    fn push(&mut self, addr: Addr) {
        if !self.0.contains(&addr) {
            self.0.push(addr);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Addr> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The BPF expression selecting traffic to the listed endpoints. Only
    /// destination hosts and ports appear; direction is a property of the
    /// capture point.
    pub fn filter(&self) -> String {
        self.0
            .iter()
            .map(|addr| {
                let ip = addr.ip.expect("source endpoints are always resolved");
                format!("(dst host {} and tcp dst port {})", ip, addr.port)
            })
            .collect::<Vec<_>>()
            .join(" or ")
    }

    /// True iff some listed IP is not bound to a local interface, in which
    /// case the capture handles must be opened in promiscuous mode.
    pub fn requires_promisc(&self) -> bool {
        self.requires_promisc_with(&local_addrs())
    }

    fn requires_promisc_with(&self, local: &[IpAddr]) -> bool {
        self.0.iter().any(|addr| match addr.ip {
            Some(ip) => !local.contains(&ip),
            None => true,
        })
    }
}

impl fmt::Display for AddrList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (v4, v6): (Vec<&Addr>, Vec<&Addr>) = self
            .0
            .iter()
            .partition(|addr| matches!(addr.ip, Some(IpAddr::V4(_))));
        let all = v4
            .iter()
            .chain(v6.iter())
            .map(|addr| addr.to_string())
            .collect::<Vec<_>>();
        write!(f, "{}", all.join(", "))
    }
}

/// Every address bound to a local interface, as reported by libpcap.
pub(crate) fn local_addrs() -> Vec<IpAddr> {
    match pcap::Device::list() {
        Ok(devices) => devices
            .iter()
            .flat_map(|dev| dev.addresses.iter().map(|addr| addr.addr))
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Splits `HOST[:PORT]` into host and port strings. A missing port defaults
/// to 80, a `*` host maps to the empty string, IPv6 literals lose their
/// brackets.
fn split_addr(addr: &str) -> (String, String) {
    let addr = if has_port(addr) {
        addr.to_owned()
    } else {
        format!("{addr}:80")
    };
    let colon = addr.rfind(':').unwrap();
    let (host, port) = (&addr[..colon], &addr[colon + 1..]);
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let host = if host == "*" { "" } else { host };
    (host.to_owned(), port.to_owned())
}

fn has_port(addr: &str) -> bool {
    let colon = addr.rfind(':').map(|i| i as isize).unwrap_or(-1);
    let bracket = addr.rfind(']').map(|i| i as isize).unwrap_or(-1);
    colon > bracket
}

fn resolve_port(input: &str, port: &str) -> Result<u16, Error> {
    match port {
        "http" => Ok(80),
        "https" => Ok(443),
        _ => port.parse().map_err(|_| Error::Resolve {
            input: input.to_owned(),
            reason: format!("invalid port {port:?}"),
        }),
    }
}

fn resolve_host(input: &str, host: &str, port: u16) -> Result<IpAddr, Error> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let resolved = (host, port).to_socket_addrs().map_err(|err| Error::Resolve {
        input: input.to_owned(),
        reason: err.to_string(),
    })?;
    resolved
        .map(|sa| sa.ip())
        .next()
        .ok_or_else(|| Error::Resolve {
            input: input.to_owned(),
            reason: "no addresses found".to_owned(),
        })
}
