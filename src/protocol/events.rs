use std::sync::Mutex;

use bytes::Bytes;
use flume::{Receiver, Sender};

use super::telegram::ExceptionCode;

/// Everything the engine reports upstream. Decoded events carry the start
/// address of the originating request because Modbus replies do not echo it.
///
/// Per telegram id the order is `ResponseRawComplete`, then the decoded event
/// or `Exception`, then `TransactionFinished`; a timeout replaces the first
/// two with `TransactionLost`.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// CRC-valid reply frame, exactly as read from the wire.
    ResponseRawComplete { id: u64, frame: Bytes },
    /// PDU body of a non-exception reply, before per-function decoding.
    ResponseRaw {
        id: u64,
        slave_address: u8,
        function_code: u8,
        pdu: Bytes,
    },
    /// The bus is done with the current telegram; the next send follows after
    /// the TX guard interval.
    TransactionFinished,
    /// No CRC-valid reply arrived before the request timeout.
    TransactionLost { id: u64 },
    /// The slave answered with an exception PDU.
    Exception { id: u64, code: ExceptionCode },
    CoilsRead {
        id: u64,
        slave_address: u8,
        start_address: u16,
        values: Vec<bool>,
    },
    DiscreteInputsRead {
        id: u64,
        slave_address: u8,
        start_address: u16,
        values: Vec<bool>,
    },
    HoldingRegistersRead {
        id: u64,
        slave_address: u8,
        start_address: u16,
        values: Vec<u16>,
    },
    InputRegistersRead {
        id: u64,
        slave_address: u8,
        start_address: u16,
        values: Vec<u16>,
    },
}

/// Fan-out point for bus events. Every subscriber gets its own unbounded
/// channel and every event is cloned to all of them; subscribers that went
/// away are pruned on the next emit.
#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<Sender<BusEvent>>>,
}

impl EventHub {
    pub fn subscribe(&self) -> Receiver<BusEvent> {
        let (tx, rx) = flume::unbounded();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    pub fn emit(&self, event: BusEvent) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}
