//! Throughput/latency microbenchmark: repeatedly issues memory reads
//! against a Completer's BAR0 and reports completions per second and
//! (optionally) per-request latency.
//!
//! Unlike a multi-threaded DMA benchmark, everything here runs on the
//! single event-loop thread: multiple in-flight requests are achieved by
//! pipelining reads up to the 32-tag limit rather than by spawning
//! worker threads.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use pcie_stream::{CplStatus, EventLoop, Family, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[clap(about, version)]
struct Args {
    /// Force IPv4
    #[clap(short = '4')]
    ipv4: bool,
    /// Force IPv6
    #[clap(short = '6')]
    ipv6: bool,
    #[clap(short, long = "addr", default_value = "127.0.0.1")]
    addr: String,
    #[clap(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// BAR0 region size assumed on the Completer side
    #[clap(
        long, default_value_t = 8 * 1024 * 1024,
        parse(try_from_str = parse_int::parse)
    )]
    region_size: u64,
    /// Bytes per read request
    #[clap(long, default_value_t = 256)]
    read_len: usize,
    /// Number of reads in flight at once, up to the 32-tag limit
    #[clap(long, default_value_t = 8)]
    pipeline: usize,
    /// Stop after this many completed reads (0 = run until Ctrl-C)
    #[clap(long, default_value_t = 0)]
    count: u64,
    /// Report latency of every completion instead of an aggregate rate
    #[clap(long)]
    latency: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let family = match (args.ipv4, args.ipv6) {
        (true, false) => Family::V4,
        (false, true) => Family::V6,
        _ => Family::Any,
    };

    let mut client = EventLoop::connect(family, &args.addr, args.port)?;
    client.install_sigint_handler()?;
    for conn in client.connections_mut() {
        conn.register_bar(0, 0, args.region_size, None, None)?;
    }

    let completed = Rc::new(Cell::new(0u64));
    let bytes_done = Rc::new(Cell::new(0u64));
    let in_flight = Rc::new(Cell::new(0usize));
    let next_addr = Rc::new(Cell::new(0u64));

    let issue_one = {
        let completed = completed.clone();
        let bytes_done = bytes_done.clone();
        let in_flight = in_flight.clone();
        let next_addr = next_addr.clone();
        let region_size = args.region_size;
        let read_len = args.read_len;
        let latency = args.latency;
        move |conn: &mut pcie_stream::Connection| -> Result<()> {
            let addr = next_addr.get();
            next_addr.set((addr + read_len as u64) % region_size);
            in_flight.set(in_flight.get() + 1);
            let started = Instant::now();
            let completed = completed.clone();
            let bytes_done = bytes_done.clone();
            let in_flight = in_flight.clone();
            conn.read(
                0,
                addr,
                read_len,
                Box::new(move |status, data| {
                    in_flight.set(in_flight.get() - 1);
                    if status != CplStatus::Successful {
                        log::warn!("completion status {:?}", status);
                        return;
                    }
                    completed.set(completed.get() + 1);
                    bytes_done.set(bytes_done.get() + data.len() as u64);
                    if latency {
                        println!("latency: {} us", started.elapsed().as_micros());
                    }
                }),
            )?;
            Ok(())
        }
    };

    let last_report = Rc::new(Cell::new(Instant::now()));
    loop {
        {
            let refill = args.pipeline.saturating_sub(in_flight.get());
            for conn in client.connections_mut() {
                for _ in 0..refill {
                    issue_one(conn)?;
                }
            }
        }

        if client.step()? {
            break;
        }

        if args.count > 0 && completed.get() >= args.count {
            break;
        }

        if !args.latency && last_report.get().elapsed() >= Duration::from_secs(1) {
            println!(
                "{} completions/s, {} B/s",
                completed.get(),
                bytes_done.get()
            );
            completed.set(0);
            bytes_done.set(0);
            last_report.set(Instant::now());
        }
    }

    Ok(())
}
