//! Loopback Request/Response Example
//!
//! This example runs the middleware against the simulated controller with
//! loopback enabled:
//! - A responder subscription answers every request frame
//! - A processing thread drains the RX queue
//! - The main thread sends requests and services the receive interrupt

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use canbus_router::sim::SimPeripheral;
use canbus_router::{CanBus, Config, Fifo, IdWidth, Instance, RxParams, SystemClock};

const REQUEST_ID: u32 = 0x120;
const RESPONSE_ID: u32 = 0x121;

type Bus = CanBus<SimPeripheral, SystemClock>;

fn main() {
    // Initialize logging
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> canbus_router::Result<()> {
    let bus = Arc::new(CanBus::with_system_clock(Config::default(), SimPeripheral::new()));
    bus.peripheral().set_loopback(true);
    bus.start()?;
    println!("Bus started: {:?}", bus);

    // Responder: echo the request payload back, inverted
    let responder: Weak<Bus> = Arc::downgrade(&bus);
    bus.register_rx(RxParams::new(
        Instance::Can1,
        REQUEST_ID,
        IdWidth::Standard,
        move |frame, _| {
            let Some(bus) = responder.upgrade() else {
                return;
            };
            let reply: Vec<u8> = frame.data().iter().map(|b| !b).collect();
            if let Err(e) = bus.send(Instance::Can1, RESPONSE_ID, IdWidth::Standard, &reply) {
                eprintln!("Reply failed: {}", e);
            }
        },
    ))?;

    // Requester side: count responses
    let responses = Arc::new(AtomicU32::new(0));
    let counter = responses.clone();
    bus.register_rx(RxParams::new(
        Instance::Can1,
        RESPONSE_ID,
        IdWidth::Standard,
        move |frame, meta| {
            counter.fetch_add(1, Ordering::Relaxed);
            println!("RX  {}  (t={} ms)", frame, meta.timestamp_ms);
        },
    ))?;

    // Processing task
    let worker = bus.clone();
    let processing = thread::spawn(move || {
        let mut dispatched = 0;
        while worker.is_started() {
            dispatched += worker.process_rx_timeout(Duration::from_millis(10));
        }
        dispatched
    });

    for seq in 0..5u8 {
        let request = [seq, 0x10, 0x20, 0x30];
        bus.send(Instance::Can1, REQUEST_ID, IdWidth::Standard, &request)?;
        println!("TX  request #{}", seq);

        // Request loops back, the responder replies, the reply loops back
        for _ in 0..2 {
            bus.on_rx_pending(Instance::Can1, Fifo::Fifo0);
            thread::sleep(Duration::from_millis(20));
        }
    }

    bus.stop();
    let dispatched = processing.join().unwrap_or(0);

    println!("\nFrames dispatched: {}", dispatched);
    println!("Responses received: {}", responses.load(Ordering::Relaxed));
    println!("Diagnostics: {}", bus.diagnostics(Instance::Can1));

    Ok(())
}
