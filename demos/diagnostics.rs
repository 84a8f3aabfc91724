//! Diagnostics Example
//!
//! This example provokes every error the middleware counts and prints the
//! resulting counters:
//! - TX mailbox timeouts on a stuck controller
//! - TX queue overflow in queued mode
//! - RX queue overflow when the processing task falls behind
//! - Hardware rejections and bus-error interrupts

use std::time::Duration;

use canbus_router::sim::SimPeripheral;
use canbus_router::{
    CanBus, CanError, Config, Frame, IdWidth, Instance, Mailbox, RxParams, TxMode,
    RX_QUEUE_CAPACITY, TX_QUEUE_CAPACITY,
};

fn main() {
    // Initialize logging
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> canbus_router::Result<()> {
    let config = Config::default()
        .with_instance(Instance::Can2, true)
        .with_tx_mode(TxMode::Queued)
        .with_tx_timeout(Duration::from_millis(20))
        .with_tx_queue_timeout(Duration::ZERO);
    let bus = CanBus::with_system_clock(config, SimPeripheral::new());
    bus.start()?;

    // Mailbox timeout: the direct wait ignores the TX mode
    bus.peripheral().set_stuck(Instance::Can1, true);
    match bus.send_timeout(
        Instance::Can1,
        0x10,
        IdWidth::Standard,
        &[],
        Duration::from_millis(20),
    ) {
        Err(e) if e.is_timeout() => println!("Mailbox wait timed out"),
        other => println!("Unexpected result: {:?}", other),
    }

    // TX queue overflow
    let mut refused = 0;
    for _ in 0..TX_QUEUE_CAPACITY + 4 {
        if let Err(CanError::QueueFull) = bus.send(Instance::Can1, 0x20, IdWidth::Standard, &[]) {
            refused += 1;
        }
    }
    println!("Queued sends refused: {}", refused);

    // Queued frames time out one by one while the mailboxes stay stuck
    println!("Frames transmitted by TX task: {}", bus.process_tx());
    bus.peripheral().set_stuck(Instance::Can1, false);

    // RX queue overflow
    bus.register_rx(RxParams::new(Instance::Can2, 0, IdWidth::Standard, |_, _| {}).wildcard())?;
    for id in 0..RX_QUEUE_CAPACITY as u32 + 8 {
        let frame = Frame::new(Instance::Can2, id, IdWidth::Standard, &[id as u8])?;
        if let Some(fifo) = bus.peripheral().inject(frame) {
            bus.on_rx_pending(Instance::Can2, fifo);
        }
    }
    println!("Frames dispatched: {}", bus.process_rx());

    // Hardware rejection and bus error
    bus.peripheral().set_reject_tx(true);
    let timeout = Duration::from_millis(5);
    if let Err(e) = bus.send_timeout(Instance::Can2, 0x30, IdWidth::Standard, &[], timeout) {
        println!("Send failed: {} (hardware: {})", e, e.is_hardware_error());
    }
    bus.on_bus_error(Instance::Can2, 0x0000_0040);
    bus.on_tx_complete(Instance::Can1, Mailbox(0));

    for instance in Instance::ALL {
        println!("{}: {}", instance, bus.diagnostics(instance));
    }
    println!("Total: {}", bus.diagnostics_total());

    bus.reset_diagnostics();
    println!("After reset: {}", bus.diagnostics_total());

    Ok(())
}
