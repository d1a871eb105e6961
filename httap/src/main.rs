// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! The httap CLI: wiretaps HTTP traffic on local interfaces and forwards a
//! copy of every captured request.

use clap::Parser;
use libhttap::{Options, Wiretap};
use tracing::metadata::LevelFilter;
use tracing_subscriber::{fmt::time::ChronoLocal, prelude::*};

/// Wiretaps and forwards HTTP traffic.
#[derive(clap::Parser, Debug)]
#[command(
    name = "httap",
    disable_version_flag = true,
    override_usage = "httap [OPTIONS] [--src HOST:PORT ...] --dst HOST:PORT ..."
)]
struct Args {
    /// Source(s) to wiretap HTTP traffic from; * expands to all local
    /// addresses
    #[arg(
        short = 's',
        long = "src",
        value_name = "HOST[:PORT]",
        default_value = "*:80"
    )]
    src: Vec<String>,

    /// Destination(s) to forward a copy of the HTTP traffic to; an empty
    /// host mirrors to the observed destination
    #[arg(
        short = 'd',
        long = "dst",
        value_name = "HOST[:PORT]",
        required_unless_present = "version"
    )]
    dst: Vec<String>,

    /// Set or replace a request header in the duplicated traffic; an empty
    /// value deletes the header
    #[arg(short = 'H', long = "header", value_name = "LINE")]
    header: Vec<String>,

    /// Only forward requests that use the given method(s)
    #[arg(short = 'm', long = "methods", value_name = "METHOD")]
    methods: Vec<String>,

    /// How many copies to forward per destination per captured request
    #[arg(short = 'n', long = "multiply", value_name = "N", default_value_t = 1.0)]
    multiply: f64,

    /// Show extra information, including all request headers
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Display version information and exit
    #[arg(long = "version")]
    version: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::Layer::new()
                .with_timer(ChronoLocal::new("%Y/%m/%d %H:%M:%S".to_owned()))
                .with_level(false)
                .with_target(false)
                .with_writer(std::io::stdout),
        )
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default.into())
                .from_env_lossy(),
        )
        .init();
}

fn run(args: Args) -> Result<(), libhttap::Error> {
    let tap = Wiretap::new(Options {
        sources: args.src,
        destinations: args.dst,
        headers: args.header,
        methods: args.methods,
        multiply: args.multiply,
        verbose: args.verbose,
    })?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        // Swallow SIGHUP so the wiretap survives its terminal going away.
        tokio::spawn(async {
            use tokio::signal::unix::{signal, SignalKind};
            if let Ok(mut hangup) = signal(SignalKind::hangup()) {
                loop {
                    hangup.recv().await;
                }
            }
        });

        tap.run().await
    })
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) if err.use_stderr() => {
            eprintln!("Fatal: {err}");
            std::process::exit(1);
        }
        Err(err) => {
            // --help lands here; print it and leave successfully.
            let _ = err.print();
            return;
        }
    };

    if args.version {
        eprintln!("httap version {} (libpcap)", env!("CARGO_PKG_VERSION"));
        return;
    }

    init_logging(args.verbose);

    if let Err(err) = run(args) {
        eprintln!("Fatal: {err}");
        std::process::exit(1);
    }
}
