use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// Telegram ids are unique across all buses of the process. 0 is reserved for
// "no telegram", so the counter starts at 1 and skips 0 on wrap.
static NEXT_TELEGRAM_ID: AtomicU64 = AtomicU64::new(1);

fn allocate_id() -> u64 {
    loop {
        let id = NEXT_TELEGRAM_ID.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

/// One queued Modbus request together with everything the response parser
/// needs to interpret the reply.
///
/// `repeat_count` is the remaining attempt budget: it is decremented on every
/// transmission and the telegram is retired once it reaches zero. Raising it
/// above 1 marks the telegram for automatic re-send when the slave does not
/// answer.
#[derive(Debug, Clone)]
pub struct Telegram {
    id: u64,
    pub slave_address: u8,
    pub function_code: u8,
    pub payload: Vec<u8>,
    pub repeat_count: i32,
    /// Start address of a read or multi-write request, echoed into the
    /// decoded events (responses do not carry it).
    pub requested_start_address: u16,
    /// Item count of a read request; the bit/word extractors need it because
    /// response PDUs only carry a byte count.
    pub requested_count: u16,
    /// Data address of a single-item write (fc 5/6/0x16).
    pub requested_data_address: u16,
}

impl Telegram {
    pub fn new(slave_address: u8, function_code: u8, payload: Vec<u8>) -> Self {
        Self {
            id: allocate_id(),
            slave_address,
            function_code,
            payload,
            repeat_count: 1,
            requested_start_address: 0,
            requested_count: 0,
            requested_data_address: 0,
        }
    }

    /// Unique nonzero id, stable for the telegram's lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Broadcast telegrams (slave address 0) get no reply on an RTU bus.
    pub fn needs_answer(&self) -> bool {
        self.slave_address != 0
    }

    /// Raise the attempt budget so the telegram is re-sent on loss.
    pub fn with_repeat(mut self, attempts: i32) -> Self {
        self.repeat_count = attempts.max(1);
        self
    }
}

/// Exception code carried in byte 0 of an exception PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetDeviceFailedToRespond,
    Unknown(u8),
}

impl From<u8> for ExceptionCode {
    fn from(code: u8) -> Self {
        match code {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::ServerDeviceFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::ServerDeviceBusy,
            0x08 => Self::MemoryParityError,
            0x0A => Self::GatewayPathUnavailable,
            0x0B => Self::GatewayTargetDeviceFailedToRespond,
            other => Self::Unknown(other),
        }
    }
}

impl ExceptionCode {
    pub fn code(&self) -> u8 {
        match self {
            Self::IllegalFunction => 0x01,
            Self::IllegalDataAddress => 0x02,
            Self::IllegalDataValue => 0x03,
            Self::ServerDeviceFailure => 0x04,
            Self::Acknowledge => 0x05,
            Self::ServerDeviceBusy => 0x06,
            Self::MemoryParityError => 0x08,
            Self::GatewayPathUnavailable => 0x0A,
            Self::GatewayTargetDeviceFailedToRespond => 0x0B,
            Self::Unknown(other) => *other,
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalFunction => write!(f, "ILLEGAL_FUNCTION"),
            Self::IllegalDataAddress => write!(f, "ILLEGAL_DATA_ADDRESS"),
            Self::IllegalDataValue => write!(f, "ILLEGAL_DATA_VALUE"),
            Self::ServerDeviceFailure => write!(f, "SERVER_DEVICE_FAILURE"),
            Self::Acknowledge => write!(f, "ACKNOWLEDGE"),
            Self::ServerDeviceBusy => write!(f, "SERVER_DEVICE_BUSY"),
            Self::MemoryParityError => write!(f, "MEMORY_PARITY_ERROR"),
            Self::GatewayPathUnavailable => write!(f, "GATEWAY_PATH_UNAVAILABLE"),
            Self::GatewayTargetDeviceFailedToRespond => {
                write!(f, "GATEWAY_TARGET_DEVICE_FAILED_TO_RESPOND")
            }
            Self::Unknown(code) => write!(f, "UNKNOWN(0x{code:02X})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_nonzero() {
        let telegrams: Vec<Telegram> = (0..64)
            .map(|_| Telegram::new(1, 0x03, vec![]))
            .collect();
        for (i, a) in telegrams.iter().enumerate() {
            assert_ne!(a.id(), 0);
            for b in &telegrams[i + 1..] {
                assert_ne!(a.id(), b.id());
            }
        }
    }

    #[test]
    fn broadcast_needs_no_answer() {
        assert!(!Telegram::new(0, 0x06, vec![]).needs_answer());
        assert!(Telegram::new(1, 0x06, vec![]).needs_answer());
    }

    #[test]
    fn repeat_budget_floor_is_one() {
        assert_eq!(Telegram::new(1, 0x03, vec![]).with_repeat(3).repeat_count, 3);
        assert_eq!(Telegram::new(1, 0x03, vec![]).with_repeat(0).repeat_count, 1);
    }

    #[test]
    fn exception_code_round_trip() {
        for raw in [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x08, 0x0A, 0x0B, 0x7F] {
            assert_eq!(ExceptionCode::from(raw).code(), raw);
        }
        assert_eq!(ExceptionCode::from(0x0C), ExceptionCode::Unknown(0x0C));
        assert_eq!(ExceptionCode::from(0x02).to_string(), "ILLEGAL_DATA_ADDRESS");
    }
}
