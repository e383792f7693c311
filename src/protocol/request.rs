//! Telegram constructors for the request side of every supported function
//! code. Each builder lays out the PDU payload and caches the request context
//! (start address, item count) on the telegram so the response parser can
//! interpret the reply.

use anyhow::{ensure, Result};

use super::telegram::Telegram;

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_READ_EXCEPTION_STATUS: u8 = 0x07;
pub const FC_DIAGNOSTICS: u8 = 0x08;
pub const FC_GET_COMM_EVENT_COUNTER: u8 = 0x0B;
pub const FC_GET_COMM_EVENT_LOG: u8 = 0x0C;
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
pub const FC_REPORT_SLAVE_ID: u8 = 0x11;
pub const FC_MASK_WRITE_REGISTER: u8 = 0x16;
pub const FC_READ_FIFO_QUEUE: u8 = 0x18;

// Quantity limits from the Modbus application protocol.
const MAX_READ_BITS: u16 = 2000;
const MAX_READ_WORDS: u16 = 125;
const MAX_WRITE_BITS: usize = 1968;
const MAX_WRITE_WORDS: usize = 123;

fn span_payload(start_address: u16, count: u16) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4);
    payload.extend_from_slice(&start_address.to_be_bytes());
    payload.extend_from_slice(&count.to_be_bytes());
    payload
}

fn read_telegram(
    slave_address: u8,
    function_code: u8,
    start_address: u16,
    count: u16,
) -> Telegram {
    let mut telegram = Telegram::new(
        slave_address,
        function_code,
        span_payload(start_address, count),
    );
    telegram.requested_start_address = start_address;
    telegram.requested_count = count;
    telegram
}

pub fn generate_read_coils(slave_address: u8, start_address: u16, count: u16) -> Result<Telegram> {
    ensure!(
        (1..=MAX_READ_BITS).contains(&count),
        "coil count {count} out of range 1..={MAX_READ_BITS}"
    );
    Ok(read_telegram(slave_address, FC_READ_COILS, start_address, count))
}

pub fn generate_read_discrete_inputs(
    slave_address: u8,
    start_address: u16,
    count: u16,
) -> Result<Telegram> {
    ensure!(
        (1..=MAX_READ_BITS).contains(&count),
        "discrete input count {count} out of range 1..={MAX_READ_BITS}"
    );
    Ok(read_telegram(
        slave_address,
        FC_READ_DISCRETE_INPUTS,
        start_address,
        count,
    ))
}

pub fn generate_read_holding_registers(
    slave_address: u8,
    start_address: u16,
    count: u16,
) -> Result<Telegram> {
    ensure!(
        (1..=MAX_READ_WORDS).contains(&count),
        "register count {count} out of range 1..={MAX_READ_WORDS}"
    );
    Ok(read_telegram(
        slave_address,
        FC_READ_HOLDING_REGISTERS,
        start_address,
        count,
    ))
}

pub fn generate_read_input_registers(
    slave_address: u8,
    start_address: u16,
    count: u16,
) -> Result<Telegram> {
    ensure!(
        (1..=MAX_READ_WORDS).contains(&count),
        "register count {count} out of range 1..={MAX_READ_WORDS}"
    );
    Ok(read_telegram(
        slave_address,
        FC_READ_INPUT_REGISTERS,
        start_address,
        count,
    ))
}

/// Coil ON is encoded as 0xFF00, OFF as 0x0000.
pub fn generate_write_single_coil(slave_address: u8, data_address: u16, on: bool) -> Telegram {
    let mut payload = Vec::with_capacity(4);
    payload.extend_from_slice(&data_address.to_be_bytes());
    payload.extend_from_slice(if on { &[0xFF, 0x00] } else { &[0x00, 0x00] });
    let mut telegram = Telegram::new(slave_address, FC_WRITE_SINGLE_COIL, payload);
    telegram.requested_data_address = data_address;
    telegram
}

pub fn generate_write_single_register(
    slave_address: u8,
    data_address: u16,
    value: u16,
) -> Telegram {
    let mut payload = Vec::with_capacity(4);
    payload.extend_from_slice(&data_address.to_be_bytes());
    payload.extend_from_slice(&value.to_be_bytes());
    let mut telegram = Telegram::new(slave_address, FC_WRITE_SINGLE_REGISTER, payload);
    telegram.requested_data_address = data_address;
    telegram
}

pub fn generate_read_exception_status(slave_address: u8) -> Telegram {
    Telegram::new(slave_address, FC_READ_EXCEPTION_STATUS, Vec::new())
}

/// Diagnostics (fc 8) with a 16-bit sub-function word and optional data.
pub fn generate_diagnostics(slave_address: u8, sub_function: u16, data: &[u8]) -> Telegram {
    let mut payload = Vec::with_capacity(2 + data.len());
    payload.extend_from_slice(&sub_function.to_be_bytes());
    payload.extend_from_slice(data);
    Telegram::new(slave_address, FC_DIAGNOSTICS, payload)
}

pub fn generate_get_comm_event_counter(slave_address: u8) -> Telegram {
    Telegram::new(slave_address, FC_GET_COMM_EVENT_COUNTER, Vec::new())
}

pub fn generate_get_comm_event_log(slave_address: u8) -> Telegram {
    Telegram::new(slave_address, FC_GET_COMM_EVENT_LOG, Vec::new())
}

/// Coil states are packed LSB-first within each byte; the last byte is padded
/// with zero bits.
pub fn generate_write_multiple_coils(
    slave_address: u8,
    start_address: u16,
    on: &[bool],
) -> Result<Telegram> {
    ensure!(
        (1..=MAX_WRITE_BITS).contains(&on.len()),
        "coil count {} out of range 1..={MAX_WRITE_BITS}",
        on.len()
    );
    let count = on.len() as u16;
    let byte_count = on.len().div_ceil(8);

    let mut payload = span_payload(start_address, count);
    payload.push(byte_count as u8);
    let mut packed = 0u8;
    for (index, &state) in on.iter().enumerate() {
        if state {
            packed |= 1 << (index % 8);
        }
        if index % 8 == 7 {
            payload.push(packed);
            packed = 0;
        }
    }
    if on.len() % 8 != 0 {
        payload.push(packed);
    }

    let mut telegram = Telegram::new(slave_address, FC_WRITE_MULTIPLE_COILS, payload);
    telegram.requested_start_address = start_address;
    telegram.requested_count = count;
    Ok(telegram)
}

pub fn generate_write_multiple_registers(
    slave_address: u8,
    start_address: u16,
    values: &[u16],
) -> Result<Telegram> {
    ensure!(
        (1..=MAX_WRITE_WORDS).contains(&values.len()),
        "register count {} out of range 1..={MAX_WRITE_WORDS}",
        values.len()
    );
    let count = values.len() as u16;

    let mut payload = span_payload(start_address, count);
    payload.push((values.len() * 2) as u8);
    for value in values {
        payload.extend_from_slice(&value.to_be_bytes());
    }

    let mut telegram = Telegram::new(slave_address, FC_WRITE_MULTIPLE_REGISTERS, payload);
    telegram.requested_start_address = start_address;
    telegram.requested_count = count;
    Ok(telegram)
}

pub fn generate_report_slave_id(slave_address: u8) -> Telegram {
    Telegram::new(slave_address, FC_REPORT_SLAVE_ID, Vec::new())
}

pub fn generate_mask_write_register(
    slave_address: u8,
    data_address: u16,
    and_mask: u16,
    or_mask: u16,
) -> Telegram {
    let mut payload = Vec::with_capacity(6);
    payload.extend_from_slice(&data_address.to_be_bytes());
    payload.extend_from_slice(&and_mask.to_be_bytes());
    payload.extend_from_slice(&or_mask.to_be_bytes());
    let mut telegram = Telegram::new(slave_address, FC_MASK_WRITE_REGISTER, payload);
    telegram.requested_data_address = data_address;
    telegram
}

pub fn generate_read_fifo_queue(slave_address: u8, fifo_pointer_address: u16) -> Telegram {
    Telegram::new(
        slave_address,
        FC_READ_FIFO_QUEUE,
        fifo_pointer_address.to_be_bytes().to_vec(),
    )
}

/// Arbitrary function code with a caller-supplied payload.
pub fn generate_raw(slave_address: u8, function_code: u8, payload: Vec<u8>) -> Telegram {
    Telegram::new(slave_address, function_code, payload)
}
