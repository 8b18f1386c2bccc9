//! Headless loopback demo: drives two in-process `Endpoint`s through a
//! configurable send/recv workload over the loopback transports and reports
//! throughput.

use std::time::{Duration, Instant};

use clap::Parser;
use rdm_core::transport::TransportEvent;
use rdm_core::{CqEntry, Endpoint, EndpointConfig, PeerHandle};
use tracing::info;

/// Loopback throughput demo for the RDM core engine.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Payload size per message, in bytes.
    #[arg(long, default_value_t = 64 * 1024)]
    message_size: usize,

    /// Number of messages to send.
    #[arg(long, default_value_t = 64)]
    count: usize,

    /// MTU used by both endpoints.
    #[arg(long, default_value_t = 8_928)]
    mtu: usize,
}

const PEER: PeerHandle = PeerHandle(1);

fn relay(from: &mut Endpoint, to: &mut Endpoint) {
    for (peer, packet) in from.drain_sent(false) {
        let _ = to.inject_transport_event(false, TransportEvent::RecvComplete { peer, packet });
    }
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = EndpointConfig::builder()
        .mtu_size(args.mtu)
        .build()
        .expect("valid endpoint configuration");

    let mut sender = Endpoint::new(config.clone()).expect("sender endpoint");
    let mut receiver = Endpoint::new(config).expect("receiver endpoint");

    let payload = vec![0xABu8; args.message_size];
    let start = Instant::now();
    let mut bytes_done = 0u64;

    for i in 0..args.count {
        receiver
            .recv(PEER, args.message_size as u64, i as u64)
            .expect("post recv");
        sender
            .send(PEER, payload.clone(), i as u64)
            .expect("submit send");

        for _ in 0..10_000 {
            let processed = sender.progress() + receiver.progress();
            relay(&mut sender, &mut receiver);
            relay(&mut receiver, &mut sender);
            if processed == 0 {
                break;
            }
        }

        while let Some(entry) = receiver.poll_completion() {
            if let CqEntry::Completion(c) = entry {
                bytes_done += c.len;
            }
        }
        while sender.poll_completion().is_some() {}
    }

    let elapsed = start.elapsed().max(Duration::from_nanos(1));
    let mbps = (bytes_done as f64 * 8.0) / elapsed.as_secs_f64() / 1_000_000.0;
    info!(
        messages = args.count,
        bytes = bytes_done,
        elapsed_ms = elapsed.as_millis() as u64,
        throughput_mbps = mbps,
        "loopback run complete"
    );
    println!(
        "{} messages, {} bytes in {:?} ({:.1} Mbps)",
        args.count, bytes_done, elapsed, mbps
    );
}
