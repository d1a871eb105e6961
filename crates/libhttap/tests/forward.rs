// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Drives the duplicator and dispatcher against real local listeners.

use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use http::Method;
use libhttap::{
    addr::AddrList,
    chomp::FlowKey,
    forward::{Forwarder, HeaderOverrides},
    http_read::CapturedRequest,
};

#[derive(Debug)]
struct Received {
    head: String,
    body: Vec<u8>,
    at: Instant,
}

impl Received {
    fn has_header(&self, name: &str, value: &str) -> bool {
        self.head.lines().any(|line| {
            line.split_once(':').is_some_and(|(n, v)| {
                n.eq_ignore_ascii_case(name) && v.trim() == value
            })
        })
    }
}

struct Server {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Received>>>,
}

impl Server {
    fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    async fn wait_for(&self, n: usize) -> Vec<Received> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.count() < n {
            assert!(Instant::now() < deadline, "timed out waiting for {n} requests");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        std::mem::take(&mut *self.requests.lock().unwrap())
    }
}

fn serve() -> Server {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let requests: Arc<Mutex<Vec<Received>>> = Default::default();
    let sink = requests.clone();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            let sink = sink.clone();
            thread::spawn(move || handle(stream, sink));
        }
    });

    Server { addr, requests }
}

fn handle(mut stream: TcpStream, sink: Arc<Mutex<Vec<Received>>>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..pos + 4]).to_string();
            let content_length = head
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    if name.eq_ignore_ascii_case("content-length") {
                        value.trim().parse::<usize>().ok()
                    } else {
                        None
                    }
                })
                .unwrap_or(0);

            let mut body = buf[pos + 4..].to_vec();
            while body.len() < content_length {
                match stream.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => body.extend_from_slice(&chunk[..n]),
                }
            }
            body.truncate(content_length);

            sink.lock().unwrap().push(Received {
                head,
                body,
                at: Instant::now(),
            });
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
            return;
        }
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

fn flow() -> FlowKey {
    FlowKey {
        src_ip: "127.0.0.1".parse().unwrap(),
        dst_ip: "127.0.0.1".parse().unwrap(),
        src_port: 54321,
        dst_port: 80,
    }
}

fn captured(method: Method, path: &str, headers: &[(&str, &str)], body: &[u8]) -> CapturedRequest {
    let mut builder = http::Request::builder().method(method).uri(path);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let (parts, _) = builder.body(()).unwrap().into_parts();
    CapturedRequest {
        parts,
        body: body.to_vec(),
    }
}

fn destinations(servers: &[&Server]) -> AddrList {
    let strs: Vec<String> = servers.iter().map(|s| s.addr.to_string()).collect();
    AddrList::resolve_list(&strs).unwrap()
}

fn forwarder(destinations: AddrList, overrides: HeaderOverrides, multiply: f64) -> Arc<Forwarder> {
    Arc::new(
        Forwarder::new(destinations, overrides, None, multiply, false)
            .unwrap()
            .with_repeat_delay(Duration::from_millis(200)),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mirrors_request_unchanged() {
    let server = serve();
    let fwd = forwarder(destinations(&[&server]), HeaderOverrides::default(), 1.0);

    fwd.forward(
        flow(),
        captured(Method::GET, "/", &[("host", "orig.example")], b""),
    );

    let got = server.wait_for(1).await;
    assert_eq!(got.len(), 1);
    assert!(got[0].head.starts_with("GET / HTTP/1.1\r\n"));
    assert!(got[0].has_header("host", "orig.example"));
    assert!(got[0].body.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn host_override_and_body_survive() {
    let server = serve();
    let overrides = HeaderOverrides::parse(&["Host: example.com".to_owned()]).unwrap();
    let fwd = forwarder(destinations(&[&server]), overrides, 1.0);

    fwd.forward(
        flow(),
        captured(
            Method::POST,
            "/submit",
            &[("host", "orig.example"), ("content-length", "11")],
            b"FOO BAR BAZ",
        ),
    );

    let got = server.wait_for(1).await;
    assert!(got[0].head.starts_with("POST /submit HTTP/1.1\r\n"));
    assert!(got[0].has_header("host", "example.com"));
    assert_eq!(got[0].body, b"FOO BAR BAZ");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn multiply_repeats_after_delay() {
    let server = serve();
    let fwd = forwarder(destinations(&[&server]), HeaderOverrides::default(), 2.0);

    fwd.forward(
        flow(),
        captured(Method::GET, "/", &[("host", "h")], b""),
    );

    let got = server.wait_for(2).await;
    assert_eq!(got.len(), 2);
    let gap = got[1].at.duration_since(got[0].at);
    assert!(gap >= Duration::from_millis(200), "repeat came after {gap:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_destination_gets_a_copy() {
    let one = serve();
    let two = serve();
    let fwd = forwarder(destinations(&[&one, &two]), HeaderOverrides::default(), 1.0);

    fwd.forward(
        flow(),
        captured(Method::GET, "/", &[("host", "h")], b""),
    );

    assert_eq!(one.wait_for(1).await.len(), 1);
    assert_eq!(two.wait_for(1).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn method_filter_admits_only_listed() {
    let server = serve();
    let fwd = Arc::new(
        Forwarder::new(
            destinations(&[&server]),
            HeaderOverrides::default(),
            Some(vec![Method::GET]),
            1.0,
            false,
        )
        .unwrap(),
    );

    fwd.forward(
        flow(),
        captured(Method::POST, "/dropped", &[("host", "h")], b"x"),
    );
    fwd.forward(
        flow(),
        captured(Method::GET, "/kept", &[("host", "h")], b""),
    );

    let got = server.wait_for(1).await;
    assert!(got[0].head.starts_with("GET /kept"));
    // Give a stray POST time to show up if the filter leaked it.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unspecified_destination_mirrors_observed_host() {
    let server = serve();
    // A destination with no host: only the port is fixed, the IP comes from
    // the flow being observed.
    let dsts = AddrList::resolve_list(&[format!("*:{}", server.addr.port())]).unwrap();
    let fwd = forwarder(dsts, HeaderOverrides::default(), 1.0);

    let key = FlowKey {
        dst_ip: server.addr.ip(),
        ..flow()
    };
    fwd.forward(key, captured(Method::GET, "/", &[("host", "h")], b""));

    assert_eq!(server.wait_for(1).await.len(), 1);
}
