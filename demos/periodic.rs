//! Periodic Scheduler Example
//!
//! This example registers a few TX slots and drives the periodic scheduler
//! from a 10 ms tick for one simulated second:
//! - A 100 ms heartbeat with a fixed payload
//! - A 50 ms status frame packed from shared state
//! - A manual slot sent on demand

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use canbus_router::sim::SimPeripheral;
use canbus_router::{CanBus, Config, IdWidth, Instance, ManualClock, TxParams, TxPayload};

const TICK_MS: u32 = 10;

fn main() {
    // Initialize logging
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> canbus_router::Result<()> {
    let bus = CanBus::new(Config::default(), SimPeripheral::new(), ManualClock::new(0));
    bus.start()?;

    // Heartbeat
    let heartbeat = TxParams::new(Instance::Can1, 0x700, IdWidth::Standard)
        .period(100)
        .payload(TxPayload::bytes(&[0x05])?);
    bus.register_tx(heartbeat)?;

    // Status frame packed at send time
    let pack_rate = Arc::new(AtomicU16::new(0));
    let source = pack_rate.clone();
    let status = TxParams::new(Instance::Can1, 0x18FF_50E5, IdWidth::Extended)
        .period(50)
        .payload(TxPayload::packed(move |buf| {
            let value = source.load(Ordering::Relaxed);
            buf[..2].copy_from_slice(&value.to_le_bytes());
            buf[2] = 0xFF;
            3
        }));
    let status_handle = bus.register_tx(status)?;

    // Manual slot
    let fault = bus.register_tx(TxParams::new(Instance::Can1, 0x080, IdWidth::Standard))?;

    let mut fired = 0;
    for tick in 1..=100 {
        let now = tick * TICK_MS;
        bus.clock().set(now);
        pack_rate.store(tick as u16 * 25, Ordering::Relaxed);

        let report = bus.process_periodic(now);
        fired += report.fired;
        if report.failed > 0 {
            eprintln!("{} ms: {} slot(s) failed", now, report.failed);
        }

        if now == 500 {
            bus.send_slot_with_data(fault, &[0x01, 0x02])?;
            // Slow the status frame down for the second half
            bus.set_period(status_handle, 200)?;
        }
    }

    println!("Periodic frames sent: {}", fired);
    for frame in bus.peripheral().take_transmitted() {
        println!("TX  {}", frame);
    }
    println!("Diagnostics: {}", bus.diagnostics_total());

    Ok(())
}
