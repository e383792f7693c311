pub mod crc;
pub mod daemon;
pub mod decoder;
pub mod events;
pub mod frame;
pub mod link;
pub mod master;
pub mod queue;
pub mod request;
pub mod telegram;

pub use daemon::MasterConfig;
pub use events::BusEvent;
pub use master::ModbusMaster;
pub use telegram::{ExceptionCode, Telegram};
