//! End-to-end tests of the transaction engine over an in-memory serial link.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ffubus::protocol::link::SerialLink;
use ffubus::protocol::{crc, request, BusEvent, MasterConfig, ModbusMaster};

/// Both ends of the fake bus: bytes queued for the engine to read and every
/// frame the engine wrote.
#[derive(Clone, Default)]
struct TestBus {
    to_engine: Arc<Mutex<VecDeque<u8>>>,
    from_engine: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl TestBus {
    fn inject(&self, bytes: &[u8]) {
        self.to_engine.lock().unwrap().extend(bytes.iter().copied());
    }

    fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.from_engine.lock().unwrap().clone()
    }

    /// Poll until the engine has transmitted at least `count` frames.
    fn wait_frames(&self, count: usize, timeout: Duration) -> Vec<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            let frames = self.sent_frames();
            if frames.len() >= count {
                return frames;
            }
            assert!(
                Instant::now() < deadline,
                "only {} of {count} frames transmitted within {timeout:?}",
                frames.len()
            );
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

struct TestLink {
    bus: TestBus,
}

impl SerialLink for TestLink {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pending = self.bus.to_engine.lock().unwrap();
        let n = pending.len().min(buf.len());
        for slot in buf.iter_mut().take(n) {
            *slot = pending.pop_front().unwrap();
        }
        Ok(n)
    }

    fn write_all_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.bus.from_engine.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    fn flush_tx(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// Generous upper bound for anything the engine should do promptly.
const WAIT: Duration = Duration::from_secs(2);

fn test_master() -> (ModbusMaster, TestBus) {
    let bus = TestBus::default();
    let link = TestLink { bus: bus.clone() };
    let config = MasterConfig {
        request_timeout: Duration::from_millis(200),
        tx_guard: Duration::from_millis(5),
        rx_idle: Duration::from_millis(40),
    };
    let master = ModbusMaster::from_link(Box::new(link), config).unwrap();
    (master, bus)
}

/// Append the CRC trailer to a frame body.
fn with_crc(body: &[u8]) -> Vec<u8> {
    let mut frame = body.to_vec();
    let checksum = crc::checksum(body);
    frame.push((checksum & 0xFF) as u8);
    frame.push((checksum >> 8) as u8);
    frame
}

/// Receive events until (and including) the next `TransactionFinished`.
fn collect_until_finished(events: &flume::Receiver<BusEvent>, timeout: Duration) -> Vec<BusEvent> {
    let deadline = Instant::now() + timeout;
    let mut seen = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = events
            .recv_timeout(remaining)
            .unwrap_or_else(|_| panic!("no TransactionFinished within {timeout:?}: {seen:?}"));
        let done = matches!(event, BusEvent::TransactionFinished);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

#[test]
fn read_holding_registers_decodes_reply() {
    let (master, bus) = test_master();
    let events = master.subscribe();

    let id = master.read_holding_registers(1, 0x0010, 2).unwrap();
    assert_ne!(id, 0);

    let frames = bus.wait_frames(1, WAIT);
    assert_eq!(
        frames[0],
        vec![0x01, 0x03, 0x00, 0x10, 0x00, 0x02, 0xC5, 0xCE]
    );

    bus.inject(&with_crc(&[0x01, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x14]));
    let seen = collect_until_finished(&events, WAIT);

    assert!(
        matches!(&seen[0], BusEvent::ResponseRawComplete { id: got, .. } if *got == id),
        "raw completion must come first: {seen:?}"
    );
    assert!(
        matches!(&seen[1], BusEvent::ResponseRaw { id: got, function_code: 0x03, .. } if *got == id)
    );
    assert!(matches!(
        &seen[2],
        BusEvent::HoldingRegistersRead { id: got, slave_address: 1, start_address: 0x0010, values }
            if *got == id && *values == vec![10, 20]
    ));
    assert!(matches!(seen.last(), Some(BusEvent::TransactionFinished)));
    assert!(!seen
        .iter()
        .any(|event| matches!(event, BusEvent::TransactionLost { .. })));

    assert_eq!(master.rx_telegrams(), 1);
    assert_eq!(master.crc_errors(), 0);
}

#[test]
fn write_single_coil_reply_is_echo_only() {
    let (master, bus) = test_master();
    let events = master.subscribe();

    let id = master.write_single_coil(5, 0x0002, true);
    let frames = bus.wait_frames(1, WAIT);
    assert_eq!(&frames[0][..6], &[0x05, 0x05, 0x00, 0x02, 0xFF, 0x00]);

    // The slave echoes the request verbatim.
    bus.inject(&frames[0]);
    let seen = collect_until_finished(&events, WAIT);

    assert!(
        matches!(&seen[0], BusEvent::ResponseRawComplete { id: got, .. } if *got == id)
    );
    assert!(!seen.iter().any(|event| matches!(
        event,
        BusEvent::CoilsRead { .. } | BusEvent::TransactionLost { .. }
    )));
    assert_eq!(master.rx_telegrams(), 1);
}

#[test]
fn exception_reply_is_terminal() {
    let (master, bus) = test_master();
    master.set_telegram_repeat_count(3);
    let events = master.subscribe();

    let id = master.read_holding_registers(1, 0x0000, 1).unwrap();
    bus.wait_frames(1, WAIT);

    bus.inject(&with_crc(&[0x01, 0x83, 0x02]));
    let seen = collect_until_finished(&events, WAIT);

    assert!(
        matches!(&seen[0], BusEvent::ResponseRawComplete { id: got, .. } if *got == id)
    );
    assert!(matches!(
        &seen[1],
        BusEvent::Exception { id: got, code } if *got == id && code.code() == 0x02
    ));
    assert!(!seen
        .iter()
        .any(|event| matches!(event, BusEvent::HoldingRegistersRead { .. })));

    // Despite the remaining attempt budget the telegram must not be re-sent.
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(bus.sent_frames().len(), 1);
}

#[test]
fn crc_error_is_counted_and_leads_to_loss() {
    let (master, bus) = test_master();
    let events = master.subscribe();

    let id = master.read_holding_registers(1, 0x0010, 2).unwrap();
    bus.wait_frames(1, WAIT);

    let mut reply = with_crc(&[0x01, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x14]);
    let last = reply.len() - 1;
    reply[last] ^= 0xFF;
    bus.inject(&reply);

    let deadline = Instant::now() + WAIT;
    while master.crc_errors() == 0 {
        assert!(Instant::now() < deadline, "CRC error never counted");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(master.crc_errors(), 1);
    assert_eq!(master.rx_telegrams(), 0);
    // The bad frame produced no events; the request timer is still running.
    assert!(events.try_recv().is_err());

    let seen = collect_until_finished(&events, WAIT);
    assert!(matches!(
        &seen[0],
        BusEvent::TransactionLost { id: got } if *got == id
    ));
    assert!(!seen
        .iter()
        .any(|event| matches!(event, BusEvent::ResponseRawComplete { .. })));
}

#[test]
fn broadcast_finishes_without_loss() {
    let (master, bus) = test_master();
    let events = master.subscribe();

    let id = master.write_single_register(0, 0x0001, 7);
    assert_ne!(id, 0);
    bus.wait_frames(1, WAIT);

    // No reply ever comes; the request timer advances the queue anyway.
    let seen = collect_until_finished(&events, WAIT);
    assert!(!seen
        .iter()
        .any(|event| matches!(event, BusEvent::TransactionLost { .. })));
}

#[test]
fn high_priority_queue_drains_first() {
    let (master, bus) = test_master();

    // Occupy the bus so the following submissions actually queue up.
    master.send_raw_request(9, 0x08, vec![0x00, 0x00, 0xA5, 0x37]);
    let frames = bus.wait_frames(1, WAIT);
    assert_eq!(frames[0][0], 9);

    master.read_holding_registers(1, 0x0000, 1).unwrap(); // A, standard
    master.submit(
        request::generate_write_single_register(2, 0x0000, 1),
        true, // B, high priority
    );
    master.read_holding_registers(3, 0x0000, 1).unwrap(); // C, standard
    assert_eq!(master.queue_size(false), 2);
    assert_eq!(master.queue_size(true), 1);

    // Answer each telegram with an echo to let the queue advance.
    let mut answered = 1;
    bus.inject(&frames[0]);
    for expected_slave in [2u8, 1, 3] {
        let frames = bus.wait_frames(answered + 1, WAIT);
        let frame = &frames[answered];
        assert_eq!(
            frame[0], expected_slave,
            "unexpected transmission order: {frames:?}"
        );
        bus.inject(frame);
        answered += 1;
    }
}

#[test]
fn lost_telegram_is_retried_while_budget_remains() {
    let (master, bus) = test_master();
    let events = master.subscribe();

    let telegram = request::generate_raw(4, 0x03, vec![0x00, 0x00, 0x00, 0x01]).with_repeat(2);
    let id = master.submit(telegram, false);

    // Never answered: both attempts must transmit the identical frame.
    let frames = bus.wait_frames(2, Duration::from_secs(3));
    assert_eq!(frames[0], frames[1]);

    let mut losses = 0;
    let deadline = Instant::now() + WAIT;
    while losses < 2 {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(BusEvent::TransactionLost { id: got }) if got == id => losses += 1,
            Ok(_) => {}
            Err(_) => panic!("expected two losses, saw {losses}"),
        }
    }

    // Budget exhausted: no third attempt.
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(bus.sent_frames().len(), 2);
}

#[test]
fn stray_bytes_are_dropped_silently() {
    let (master, bus) = test_master();
    let events = master.subscribe();

    bus.inject(&[0x55, 0xAA, 0x01, 0x02, 0x03]);
    std::thread::sleep(Duration::from_millis(100));

    assert!(events.try_recv().is_err());
    assert_eq!(master.crc_errors(), 0);
    assert_eq!(master.rx_telegrams(), 0);

    // The bus still works afterwards.
    let id = master.read_holding_registers(1, 0x0010, 2).unwrap();
    bus.wait_frames(1, WAIT);
    bus.inject(&with_crc(&[0x01, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x14]));
    let seen = collect_until_finished(&events, WAIT);
    assert!(seen
        .iter()
        .any(|event| matches!(event, BusEvent::HoldingRegistersRead { id: got, .. } if *got == id)));
}

#[test]
fn clear_queue_drops_pending_but_not_in_flight() {
    let (master, bus) = test_master();
    let events = master.subscribe();

    let blocker = master.send_raw_request(9, 0x08, vec![0x00, 0x00, 0x12, 0x34]);
    let frames = bus.wait_frames(1, WAIT);

    master.read_holding_registers(1, 0x0000, 1).unwrap();
    master.read_holding_registers(2, 0x0000, 1).unwrap();
    assert_eq!(master.queue_size(false), 2);

    master.clear_queue(false);
    assert_eq!(master.queue_size(false), 0);

    // The in-flight blocker still completes normally.
    bus.inject(&frames[0]);
    let seen = collect_until_finished(&events, WAIT);
    assert!(seen
        .iter()
        .any(|event| matches!(event, BusEvent::ResponseRawComplete { id: got, .. } if *got == blocker)));

    // Nothing else goes out after the cleared queue.
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(bus.sent_frames().len(), 1);
}

#[test]
fn blocking_raw_request_returns_reply_frame() {
    let (master, bus) = test_master();

    // A helper thread plays the slave: echo the first transmitted frame.
    let responder = std::thread::spawn({
        let bus = bus.clone();
        move || {
            let frames = bus.wait_frames(1, WAIT);
            bus.inject(&frames[0]);
        }
    });

    let reply = master
        .send_raw_request_blocking(6, 0x11, Vec::new())
        .unwrap();
    responder.join().unwrap();

    assert_eq!(reply.as_ref(), bus.sent_frames()[0].as_slice());
}

#[test]
fn blocking_raw_request_reports_loss() {
    let (master, _bus) = test_master();

    let err = master
        .send_raw_request_blocking(6, 0x11, Vec::new())
        .unwrap_err();
    assert!(err.to_string().contains("lost"), "unexpected error: {err}");
}
