//! Example Completer: serves a single memory-backed BAR0 and a Type-0
//! configuration-space header over the PCIe-over-TCP transport.
//!
//! The BAR's base is advertised as `0`; a real device would learn its BAR
//! assignment from firmware/OS enumeration, which this transport does
//! not implement. Demo clients agree on the base out of band.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use clap::Parser;
use pcie_stream::{ConfigSpace0, EventLoop, Family, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[clap(about, version)]
struct Args {
    /// Force IPv4
    #[clap(short = '4')]
    ipv4: bool,
    /// Force IPv6
    #[clap(short = '6')]
    ipv6: bool,
    /// Address to listen on
    #[clap(short, long = "addr", default_value = "0.0.0.0")]
    addr: String,
    /// Port to listen on
    #[clap(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// BAR0 size in bytes, must be a power of two
    #[clap(
        long, default_value_t = 4096,
        parse(try_from_str = parse_int::parse)
    )]
    bar_size: u64,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let family = match (args.ipv4, args.ipv6) {
        (true, false) => Family::V4,
        (false, true) => Family::V6,
        _ => Family::Any,
    };

    let memory = Arc::new(Mutex::new(vec![0u8; args.bar_size as usize]));
    let cfg = Arc::new(Mutex::new(ConfigSpace0 {
        vendor_id: 0x1af4,
        device_id: 0x1000,
        ..Default::default()
    }));
    let bar_size = args.bar_size;

    let mut server = EventLoop::bind(family, &args.addr, args.port)?;
    server.install_sigint_handler()?;

    server.set_accept_callback(Box::new(move |conn| {
        let mem_r = memory.clone();
        let mem_w = memory.clone();
        conn.register_bar(
            0,
            0,
            bar_size,
            Some(Box::new(move |offset, buf| {
                let mem = mem_r.lock().unwrap();
                let start = offset as usize;
                let end = start + buf.len();
                if end > mem.len() {
                    return false;
                }
                buf.copy_from_slice(&mem[start..end]);
                true
            })),
            Some(Box::new(move |offset, data| {
                let mut mem = mem_w.lock().unwrap();
                let start = offset as usize;
                let end = start + data.len();
                if end <= mem.len() {
                    mem[start..end].copy_from_slice(data);
                } else {
                    log::warn!("write past end of BAR0, dropping");
                }
            })),
        )
        .expect("BAR0 registration failed");

        let cfg_r = cfg.clone();
        let cfg_w = cfg.clone();
        conn.register_cfg0_read(Box::new(move |offset, buf| {
            let bytes = cfg_r.lock().unwrap().to_bytes();
            let start = offset as usize;
            let end = start + buf.len();
            if end > bytes.len() {
                return false;
            }
            buf.copy_from_slice(&bytes[start..end]);
            true
        }));
        conn.register_cfg0_write(Box::new(move |offset, data| {
            // BAR0 lives at config offset 0x10, per the Type 0 header layout.
            if offset == 0x10 && data.len() == 4 {
                let value = u32::from_le_bytes(data.try_into().unwrap());
                cfg_w.lock().unwrap().write_bar(0, value, bar_size as u32);
            }
        }));

        log::info!("completer ready for new connection");
    }));

    server.run()?;
    Ok(())
}
