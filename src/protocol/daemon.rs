//! The bus engine loop. One thread owns the serial link, the three timers
//! and the RX buffer; everything else talks to it through the shared queue,
//! the command channel and the event hub.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::Bytes;
use flume::Receiver;

use super::{
    crc, decoder,
    events::{BusEvent, EventHub},
    frame,
    link::SerialLink,
    queue::TelegramQueue,
    request::{
        FC_READ_COILS, FC_READ_DISCRETE_INPUTS, FC_READ_HOLDING_REGISTERS,
        FC_READ_INPUT_REGISTERS, FC_WRITE_MULTIPLE_COILS, FC_WRITE_MULTIPLE_REGISTERS,
        FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER,
    },
    telegram::{ExceptionCode, Telegram},
};

const READ_BUF_SIZE: usize = 256;

/// Timer intervals of the transaction engine.
///
/// The request timeout bounds how long a slave may take to answer. The TX
/// guard delays the next send after a finished transaction so the RS-485
/// driver can release the line; it must stay below the RX idle interval.
/// The RX idle interval delimits frames (the RTU 3.5-character gap,
/// approximated generously for low baud rates).
#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub request_timeout: Duration,
    pub tx_guard: Duration,
    pub rx_idle: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            tx_guard: Duration::from_millis(4),
            rx_idle: Duration::from_millis(100),
        }
    }
}

#[derive(Debug)]
pub(super) enum EngineCommand {
    /// A telegram was queued while no transaction was pending; try to send.
    Kick,
    SetTxGuard(Duration),
    Stop,
}

#[derive(Debug, Default)]
pub(super) struct SharedCounters {
    pub rx_telegrams: AtomicU64,
    pub crc_errors: AtomicU64,
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run the engine until `EngineCommand::Stop` arrives. Must be started in a
/// separate thread, otherwise it will block the caller.
pub(super) fn boot_bus_loop(
    link: Box<dyn SerialLink>,
    queue: Arc<Mutex<TelegramQueue>>,
    hub: Arc<EventHub>,
    counters: Arc<SharedCounters>,
    config: MasterConfig,
    cmd_rx: Receiver<EngineCommand>,
) -> Result<()> {
    let mut engine = Engine {
        link,
        queue,
        hub,
        counters,
        config,
        rx_buffer: Vec::with_capacity(READ_BUF_SIZE),
        last_rx_byte: None,
        request_deadline: None,
        tx_guard_deadline: None,
    };

    loop {
        while let Ok(cmd) = cmd_rx.try_recv() {
            match cmd {
                EngineCommand::Kick => engine.try_send_next(),
                EngineCommand::SetTxGuard(guard) => engine.config.tx_guard = guard,
                EngineCommand::Stop => return Ok(()),
            }
        }

        engine.poll_timers();
        engine.drain_rx();
        std::thread::sleep(Duration::from_millis(1));
    }
}

struct Engine {
    link: Box<dyn SerialLink>,
    queue: Arc<Mutex<TelegramQueue>>,
    hub: Arc<EventHub>,
    counters: Arc<SharedCounters>,
    config: MasterConfig,
    rx_buffer: Vec<u8>,
    last_rx_byte: Option<Instant>,
    request_deadline: Option<Instant>,
    tx_guard_deadline: Option<Instant>,
}

impl Engine {
    /// Check the three single-shot timers. Each deadline is disarmed before
    /// its handler runs.
    fn poll_timers(&mut self) {
        if self
            .tx_guard_deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
        {
            self.tx_guard_deadline = None;
            self.try_send_next();
        }

        if self
            .request_deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
        {
            self.request_deadline = None;
            self.on_request_timeout();
        }

        if let Some(last) = self.last_rx_byte {
            if !self.rx_buffer.is_empty() && last.elapsed() >= self.config.rx_idle {
                self.last_rx_byte = None;
                self.parse_response();
            }
        }
    }

    /// Drain everything the device has pending into the RX buffer; every
    /// byte re-arms the idle timer.
    fn drain_rx(&mut self) {
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match self.link.read_available(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    self.rx_buffer.extend_from_slice(&buf[..n]);
                    self.last_rx_byte = Some(Instant::now());
                }
                Err(err) => {
                    log::warn!("serial read error: {err}");
                    break;
                }
            }
        }
    }

    /// Promote the next telegram (high priority first) unless one is still
    /// being retried, then transmit it. Goes idle when both queues are empty.
    fn try_send_next(&mut self) {
        // A reply is still outstanding; whatever triggered this fires again
        // once the transaction terminates.
        if self.request_deadline.is_some() {
            return;
        }

        let telegram = {
            let Ok(mut queue) = self.queue.lock() else {
                return;
            };

            if queue.current.as_ref().is_some_and(|t| t.repeat_count <= 0) {
                queue.current = None;
            }
            if queue.current.is_none() {
                match queue.pop_next() {
                    Some(next) => queue.current = Some(next),
                    None => {
                        queue.transaction_pending = false;
                        return;
                    }
                }
            }
            queue.transaction_pending = true;

            let Some(current) = queue.current.as_mut() else {
                return;
            };
            current.repeat_count -= 1;
            current.clone()
        };

        self.request_deadline = Some(Instant::now() + self.config.request_timeout);

        let adu = frame::encode_adu(&telegram);
        log::debug!("TX telegram {}: {}", telegram.id(), hex(&adu));
        if let Err(err) = self
            .link
            .write_all_bytes(&adu)
            .and_then(|()| self.link.flush_tx())
        {
            // Transaction still terminates through the request timeout, so
            // the queue keeps moving even with a dead port.
            log::warn!("serial write failed for telegram {}: {err}", telegram.id());
        }
    }

    fn on_request_timeout(&mut self) {
        let current = {
            let Ok(queue) = self.queue.lock() else {
                return;
            };
            queue
                .current
                .as_ref()
                .map(|t| (t.id(), t.needs_answer()))
        };

        if let Some((id, needs_answer)) = current {
            if needs_answer {
                log::warn!("telegram {id}: no reply before request timeout");
                self.hub.emit(BusEvent::TransactionLost { id });
            }
        }
        self.finish_transaction();
    }

    /// A transaction ended (reply, exception or timeout). The TX guard gives
    /// the RS-485 driver time to release the line before the next send.
    fn finish_transaction(&mut self) {
        self.hub.emit(BusEvent::TransactionFinished);
        self.tx_guard_deadline = Some(Instant::now() + self.config.tx_guard);
    }

    /// A CRC-valid reply is a terminal outcome for the current telegram,
    /// exception replies included: zero the attempt budget so the next
    /// `try_send_next` retires it instead of re-sending.
    fn retire_current(&mut self) {
        if let Ok(mut queue) = self.queue.lock() {
            if let Some(current) = queue.current.as_mut() {
                current.repeat_count = 0;
            }
        }
    }

    /// The RX idle timer fired: treat the accumulated buffer as one candidate
    /// frame and run it through the reject rules.
    fn parse_response(&mut self) {
        let current = match self.queue.lock() {
            Ok(queue) => queue.current.clone(),
            Err(_) => None,
        };
        // Replies only count while the request timer runs; anything else is
        // stray traffic (late replies included, those transactions already
        // terminated).
        let Some(current) = current.filter(|_| self.request_deadline.is_some()) else {
            log::debug!(
                "dropping {} stray bytes outside a transaction: {}",
                self.rx_buffer.len(),
                hex(&self.rx_buffer)
            );
            self.rx_buffer.clear();
            return;
        };

        if self.rx_buffer.len() < 4 {
            log::debug!("dropping runt frame: {}", hex(&self.rx_buffer));
            self.rx_buffer.clear();
            return;
        }

        let slave_address = self.rx_buffer[0];
        let function_code = self.rx_buffer[1] & 0x7F;
        let exception = self.rx_buffer[1] & 0x80 != 0;

        if exception {
            self.parse_exception_response(&current);
            return;
        }

        if self.rx_buffer.len() > frame::MAX_ADU_LEN - 1 {
            log::warn!("dropping oversized frame ({} bytes)", self.rx_buffer.len());
            self.rx_buffer.clear();
            return;
        }

        if !crc::verify(&self.rx_buffer) {
            self.counters.crc_errors.fetch_add(1, Ordering::Relaxed);
            log::warn!("CRC error: {}", hex(&self.rx_buffer));
            self.rx_buffer.clear();
            return;
        }

        self.request_deadline = None;
        self.counters.rx_telegrams.fetch_add(1, Ordering::Relaxed);
        self.retire_current();

        let reply = Bytes::from(std::mem::take(&mut self.rx_buffer));
        let pdu = reply.slice(2..reply.len() - 2);
        let id = current.id();

        self.hub.emit(BusEvent::ResponseRawComplete {
            id,
            frame: reply.clone(),
        });
        self.hub.emit(BusEvent::ResponseRaw {
            id,
            slave_address,
            function_code,
            pdu: pdu.clone(),
        });
        self.decode_reply(&current, slave_address, function_code, &pdu);
        self.finish_transaction();
    }

    fn parse_exception_response(&mut self, current: &Telegram) {
        if self.rx_buffer.len() < 5 {
            log::debug!("dropping truncated exception frame: {}", hex(&self.rx_buffer));
            self.rx_buffer.clear();
            return;
        }
        if !crc::verify(&self.rx_buffer) {
            self.counters.crc_errors.fetch_add(1, Ordering::Relaxed);
            log::warn!("CRC error in exception frame: {}", hex(&self.rx_buffer));
            self.rx_buffer.clear();
            return;
        }

        self.request_deadline = None;
        self.counters.rx_telegrams.fetch_add(1, Ordering::Relaxed);
        self.retire_current();

        let code = ExceptionCode::from(self.rx_buffer[2]);
        let reply = Bytes::from(std::mem::take(&mut self.rx_buffer));
        let id = current.id();
        log::warn!("telegram {id}: exception {code}");

        self.hub
            .emit(BusEvent::ResponseRawComplete { id, frame: reply });
        self.hub.emit(BusEvent::Exception { id, code });
        self.finish_transaction();
    }

    /// Per-function decoding, using the request context cached on the
    /// telegram. Malformed PDUs only cost the decoded event; the raw
    /// completion already went out.
    fn decode_reply(
        &self,
        telegram: &Telegram,
        slave_address: u8,
        function_code: u8,
        pdu: &Bytes,
    ) {
        let id = telegram.id();
        match function_code {
            FC_READ_COILS | FC_READ_DISCRETE_INPUTS => {
                let Some(values) = decoder::decode_bit_values(pdu, telegram.requested_count)
                else {
                    log::warn!("telegram {id}: fc{function_code} reply has inconsistent byte count");
                    return;
                };
                let start_address = telegram.requested_start_address;
                if function_code == FC_READ_COILS {
                    self.hub.emit(BusEvent::CoilsRead {
                        id,
                        slave_address,
                        start_address,
                        values,
                    });
                } else {
                    self.hub.emit(BusEvent::DiscreteInputsRead {
                        id,
                        slave_address,
                        start_address,
                        values,
                    });
                }
            }
            FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS => {
                let Some(values) = decoder::decode_word_values(pdu, telegram.requested_count)
                else {
                    log::warn!(
                        "telegram {id}: fc{function_code} reply length does not match request"
                    );
                    return;
                };
                let start_address = telegram.requested_start_address;
                if function_code == FC_READ_HOLDING_REGISTERS {
                    self.hub.emit(BusEvent::HoldingRegistersRead {
                        id,
                        slave_address,
                        start_address,
                        values,
                    });
                } else {
                    self.hub.emit(BusEvent::InputRegistersRead {
                        id,
                        slave_address,
                        start_address,
                        values,
                    });
                }
            }
            FC_WRITE_SINGLE_COIL
            | FC_WRITE_SINGLE_REGISTER
            | FC_WRITE_MULTIPLE_COILS
            | FC_WRITE_MULTIPLE_REGISTERS => {
                // Echo responses; the raw completion is all there is to say.
            }
            _ => {
                // fc 7/8/11/12/17 and friends: raw completion only for now.
                log::debug!("telegram {id}: no decoder for fc{function_code}");
            }
        }
    }
}
