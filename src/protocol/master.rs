use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use flume::{Receiver, Sender};

use super::daemon::{boot_bus_loop, EngineCommand, MasterConfig, SharedCounters};
use super::events::{BusEvent, EventHub};
use super::link::{open_ffu_port, SerialLink};
use super::queue::TelegramQueue;
use super::request;
use super::telegram::Telegram;

/// How long the blocking raw helper waits for its reply.
const BLOCKING_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to a running Modbus RTU master.
///
/// The engine itself runs on a dedicated thread owning the serial link;
/// this handle feeds its telegram queue and exposes the event stream. All
/// request methods return the assigned telegram id, which ties the emitted
/// events back to the request. Dropping the handle stops the engine and
/// joins its thread.
pub struct ModbusMaster {
    queue: Arc<Mutex<TelegramQueue>>,
    hub: Arc<EventHub>,
    counters: Arc<SharedCounters>,
    cmd_tx: Sender<EngineCommand>,
    default_repeat: AtomicI32,
    thread_handle: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl ModbusMaster {
    /// Open `port_name` with the FFU line discipline (8 data bits, no
    /// parity, two stop bits) and start the engine.
    pub fn open(port_name: &str, baud: u32, config: MasterConfig) -> Result<Self> {
        let port = open_ffu_port(port_name, baud)?;
        log::info!("opened {port_name} at {baud} baud");
        Self::from_link(Box::new(port), config)
    }

    /// Start the engine on an already opened link. This is also how the
    /// tests attach an in-memory bus.
    pub fn from_link(link: Box<dyn SerialLink>, config: MasterConfig) -> Result<Self> {
        let queue = Arc::new(Mutex::new(TelegramQueue::default()));
        let hub = Arc::new(EventHub::default());
        let counters = Arc::new(SharedCounters::default());
        let (cmd_tx, cmd_rx) = flume::unbounded();

        let thread_handle = std::thread::spawn({
            let queue = Arc::clone(&queue);
            let hub = Arc::clone(&hub);
            let counters = Arc::clone(&counters);
            move || boot_bus_loop(link, queue, hub, counters, config, cmd_rx)
        });

        Ok(Self {
            queue,
            hub,
            counters,
            cmd_tx,
            default_repeat: AtomicI32::new(1),
            thread_handle: Mutex::new(Some(thread_handle)),
        })
    }

    /// Subscribe to the bus event stream. Events emitted before the call are
    /// not replayed.
    pub fn subscribe(&self) -> Receiver<BusEvent> {
        self.hub.subscribe()
    }

    /// Append a prepared telegram to the send queue and return its id. Kicks
    /// the engine when no transaction is pending.
    pub fn submit(&self, telegram: Telegram, high_priority: bool) -> u64 {
        let id = telegram.id();
        let kick = {
            let Ok(mut queue) = self.queue.lock() else {
                return 0;
            };
            queue.push(telegram, high_priority);
            // Claim the bus before the engine picks the telegram up, so a
            // second submit cannot kick a send into a running transaction.
            let kick = !queue.transaction_pending;
            queue.transaction_pending = true;
            kick
        };
        if kick {
            let _ = self.cmd_tx.send(EngineCommand::Kick);
        }
        id
    }

    pub fn queue_size(&self, high_priority: bool) -> usize {
        self.queue
            .lock()
            .map(|queue| queue.size(high_priority))
            .unwrap_or(0)
    }

    /// Drop all queued telegrams of one priority. The in-flight telegram is
    /// unaffected and still terminates through its reply or timeout.
    pub fn clear_queue(&self, high_priority: bool) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear(high_priority);
        }
    }

    /// Total CRC-valid response frames received.
    pub fn rx_telegrams(&self) -> u64 {
        self.counters.rx_telegrams.load(Ordering::Relaxed)
    }

    /// Total frames rejected by the CRC check.
    pub fn crc_errors(&self) -> u64 {
        self.counters.crc_errors.load(Ordering::Relaxed)
    }

    /// Attempt budget given to telegrams built by the request methods below.
    pub fn telegram_repeat_count(&self) -> i32 {
        self.default_repeat.load(Ordering::Relaxed)
    }

    pub fn set_telegram_repeat_count(&self, attempts: i32) {
        self.default_repeat.store(attempts.max(1), Ordering::Relaxed);
    }

    /// Adjust the delay between a finished transaction and the next send.
    pub fn set_tx_guard(&self, guard: Duration) {
        let _ = self.cmd_tx.send(EngineCommand::SetTxGuard(guard));
    }

    fn submit_default(&self, telegram: Telegram) -> u64 {
        self.submit(telegram.with_repeat(self.telegram_repeat_count()), false)
    }

    pub fn read_coils(&self, slave_address: u8, start_address: u16, count: u16) -> Result<u64> {
        let telegram = request::generate_read_coils(slave_address, start_address, count)?;
        Ok(self.submit_default(telegram))
    }

    pub fn read_discrete_inputs(
        &self,
        slave_address: u8,
        start_address: u16,
        count: u16,
    ) -> Result<u64> {
        let telegram = request::generate_read_discrete_inputs(slave_address, start_address, count)?;
        Ok(self.submit_default(telegram))
    }

    pub fn read_holding_registers(
        &self,
        slave_address: u8,
        start_address: u16,
        count: u16,
    ) -> Result<u64> {
        let telegram =
            request::generate_read_holding_registers(slave_address, start_address, count)?;
        Ok(self.submit_default(telegram))
    }

    pub fn read_input_registers(
        &self,
        slave_address: u8,
        start_address: u16,
        count: u16,
    ) -> Result<u64> {
        let telegram = request::generate_read_input_registers(slave_address, start_address, count)?;
        Ok(self.submit_default(telegram))
    }

    pub fn write_single_coil(&self, slave_address: u8, data_address: u16, on: bool) -> u64 {
        self.submit_default(request::generate_write_single_coil(
            slave_address,
            data_address,
            on,
        ))
    }

    pub fn write_single_register(&self, slave_address: u8, data_address: u16, value: u16) -> u64 {
        self.submit_default(request::generate_write_single_register(
            slave_address,
            data_address,
            value,
        ))
    }

    pub fn read_exception_status(&self, slave_address: u8) -> u64 {
        self.submit_default(request::generate_read_exception_status(slave_address))
    }

    pub fn read_diagnostic_counter(
        &self,
        slave_address: u8,
        sub_function: u16,
        data: &[u8],
    ) -> u64 {
        self.submit_default(request::generate_diagnostics(
            slave_address,
            sub_function,
            data,
        ))
    }

    pub fn get_comm_event_counter(&self, slave_address: u8) -> u64 {
        self.submit_default(request::generate_get_comm_event_counter(slave_address))
    }

    pub fn get_comm_event_log(&self, slave_address: u8) -> u64 {
        self.submit_default(request::generate_get_comm_event_log(slave_address))
    }

    pub fn write_multiple_coils(
        &self,
        slave_address: u8,
        start_address: u16,
        on: &[bool],
    ) -> Result<u64> {
        let telegram = request::generate_write_multiple_coils(slave_address, start_address, on)?;
        Ok(self.submit_default(telegram))
    }

    pub fn write_multiple_registers(
        &self,
        slave_address: u8,
        start_address: u16,
        values: &[u16],
    ) -> Result<u64> {
        let telegram =
            request::generate_write_multiple_registers(slave_address, start_address, values)?;
        Ok(self.submit_default(telegram))
    }

    pub fn report_slave_id(&self, slave_address: u8) -> u64 {
        self.submit_default(request::generate_report_slave_id(slave_address))
    }

    pub fn mask_write_register(
        &self,
        slave_address: u8,
        data_address: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> u64 {
        self.submit_default(request::generate_mask_write_register(
            slave_address,
            data_address,
            and_mask,
            or_mask,
        ))
    }

    pub fn read_fifo_queue(&self, slave_address: u8, fifo_pointer_address: u16) -> u64 {
        self.submit_default(request::generate_read_fifo_queue(
            slave_address,
            fifo_pointer_address,
        ))
    }

    /// Queue an arbitrary PDU and return the telegram id.
    pub fn send_raw_request(&self, slave_address: u8, function_code: u8, payload: Vec<u8>) -> u64 {
        self.submit_default(request::generate_raw(slave_address, function_code, payload))
    }

    /// Queue an arbitrary PDU and block the calling thread until its reply
    /// frame arrives (up to 10 s). Subscribes before submitting, so the
    /// reply cannot be missed. Must not be called from the engine thread or
    /// an event-stream consumer that the caller is also responsible for
    /// draining.
    pub fn send_raw_request_blocking(
        &self,
        slave_address: u8,
        function_code: u8,
        payload: Vec<u8>,
    ) -> Result<Bytes> {
        let events = self.subscribe();
        let id = self.send_raw_request(slave_address, function_code, payload);
        let deadline = Instant::now() + BLOCKING_REPLY_TIMEOUT;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                bail!("telegram {id}: no response within {BLOCKING_REPLY_TIMEOUT:?}");
            }
            match events.recv_timeout(remaining) {
                Ok(BusEvent::ResponseRawComplete { id: got, frame }) if got == id => {
                    return Ok(frame);
                }
                Ok(BusEvent::TransactionLost { id: got }) if got == id => {
                    bail!("telegram {id} lost on the bus");
                }
                Ok(_) => continue,
                Err(_) => {
                    return Err(anyhow!(
                        "telegram {id}: no response within {BLOCKING_REPLY_TIMEOUT:?}"
                    ));
                }
            }
        }
    }

    /// Stop the engine and join its thread. Also runs on drop.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(EngineCommand::Stop);
        if let Ok(mut thread_handle) = self.thread_handle.lock() {
            if let Some(handle) = thread_handle.take() {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => log::warn!("engine loop ended with error: {err}"),
                    Err(err) => log::warn!("engine thread join error: {err:?}"),
                }
            }
        }
    }
}

impl Drop for ModbusMaster {
    fn drop(&mut self) {
        self.close();
    }
}
