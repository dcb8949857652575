//! Example Requester: connects to a Completer, writes a byte pattern into
//! BAR0, reads it back, and prints the round-tripped bytes.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{bail, Result};
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
    /// Address to connect to
    #[clap(short, long = "addr", default_value = "127.0.0.1")]
    addr: String,
    /// Port to connect to
    #[clap(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Offset within BAR0 to write then read back
    #[clap(
        short, long, default_value_t = 0,
        parse(try_from_str = parse_int::parse)
    )]
    offset: u64,
    /// Hex bytes to write, e.g. "deadbeef"
    #[clap(short, long, default_value = "deadbeef")]
    data: String,
}

fn hex_decode(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        bail!("hex string must have an even number of digits");
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(Into::into))
        .collect()
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let family = match (args.ipv4, args.ipv6) {
        (true, false) => Family::V4,
        (false, true) => Family::V6,
        _ => Family::Any,
    };
    let payload = hex_decode(&args.data)?;

    let mut client = EventLoop::connect(family, &args.addr, args.port)?;
    client.install_sigint_handler()?;

    for conn in client.connections_mut() {
        // A real host learns BAR0's base/size from configuration space;
        // this demo assumes both sides agree on it out of band.
        conn.register_bar(0, 0, 4096, None, None)?;
        conn.write(0, args.offset, &payload)?;
    }

    let done = Rc::new(RefCell::new(false));
    let result = Rc::new(RefCell::new(Vec::new()));
    let len = payload.len();
    for conn in client.connections_mut() {
        let done = done.clone();
        let result = result.clone();
        conn.read(
            0,
            args.offset,
            len,
            Box::new(move |status, data| {
                if status == CplStatus::Successful {
                    *result.borrow_mut() = data.to_vec();
                } else {
                    log::warn!("completer reported {:?} for the read", status);
                }
                *done.borrow_mut() = true;
            }),
        )?;
    }

    while !*done.borrow() {
        if client.step()? {
            bail!("connection closed before the completion arrived");
        }
    }

    println!("read back: {:02x?}", result.borrow());
    Ok(())
}
