mod cli;

use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use clap::ArgMatches;
use flume::Receiver;

use ffubus::protocol::{BusEvent, MasterConfig, ModbusMaster};

fn main() -> Result<()> {
    ffubus::init_logging();
    let matches = cli::parse_args();

    match matches.subcommand() {
        Some(("list-ports", _)) => list_ports(),
        Some((name, sub)) => run_bus_command(name, sub),
        None => unreachable!("subcommand is required"),
    }
}

fn list_ports() -> Result<()> {
    let ports = serialport::available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }
    for port in ports {
        println!("{}", port.port_name);
    }
    Ok(())
}

fn run_bus_command(name: &str, sub: &ArgMatches) -> Result<()> {
    let port = sub
        .get_one::<String>("port")
        .ok_or_else(|| anyhow!("--port is required"))?;
    let baud: u32 = parse_number(required(sub, "baud")?)? as u32;
    let slave = parse_number(required(sub, "slave")?)? as u8;
    let timeout_ms = parse_number(required(sub, "timeout-ms")?)?;
    let repeat = parse_number(required(sub, "repeat")?)? as i32;

    let config = MasterConfig {
        request_timeout: Duration::from_millis(timeout_ms),
        ..MasterConfig::default()
    };
    let master = ModbusMaster::open(port, baud, config)?;
    master.set_telegram_repeat_count(repeat);
    let events = master.subscribe();

    // Worst case every attempt times out; leave a little slack on top.
    let wait = Duration::from_millis(timeout_ms * repeat.max(1) as u64 + 1000);

    let id = match name {
        "read-coils" => master.read_coils(slave, address(sub)?, count(sub)?)?,
        "read-discrete-inputs" => master.read_discrete_inputs(slave, address(sub)?, count(sub)?)?,
        "read-holding" => master.read_holding_registers(slave, address(sub)?, count(sub)?)?,
        "read-input" => master.read_input_registers(slave, address(sub)?, count(sub)?)?,
        "write-coil" => {
            let on = match required(sub, "value")?.as_str() {
                "on" | "1" | "true" => true,
                "off" | "0" | "false" => false,
                other => bail!("coil value must be on or off, got '{other}'"),
            };
            master.write_single_coil(slave, address(sub)?, on)
        }
        "write-register" => {
            let value = parse_number(required(sub, "value")?)? as u16;
            master.write_single_register(slave, address(sub)?, value)
        }
        "write-registers" => {
            let values = required(sub, "values")?
                .split(',')
                .map(|item| parse_number(item.trim()).map(|v| v as u16))
                .collect::<Result<Vec<u16>>>()?;
            master.write_multiple_registers(slave, address(sub)?, &values)?
        }
        "raw" => {
            let function = parse_number(required(sub, "function")?)? as u8;
            let payload = parse_hex_bytes(required(sub, "payload")?)?;
            master.send_raw_request(slave, function, payload)
        }
        other => bail!("unknown subcommand '{other}'"),
    };

    await_outcome(&events, id, wait, slave == 0)
}

fn await_outcome(events: &Receiver<BusEvent>, id: u64, wait: Duration, broadcast: bool) -> Result<()> {
    let deadline = Instant::now() + wait;
    let mut raw_reply: Option<String> = None;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = events
            .recv_timeout(remaining)
            .map_err(|_| anyhow!("telegram {id}: no outcome within {wait:?}"))?;
        match event {
            BusEvent::CoilsRead { id: got, values, .. }
            | BusEvent::DiscreteInputsRead { id: got, values, .. }
                if got == id =>
            {
                let bits: Vec<&str> = values.iter().map(|&b| if b { "1" } else { "0" }).collect();
                println!("{}", bits.join(" "));
                return Ok(());
            }
            BusEvent::HoldingRegistersRead { id: got, values, .. }
            | BusEvent::InputRegistersRead { id: got, values, .. }
                if got == id =>
            {
                for value in values {
                    println!("{value} (0x{value:04X})");
                }
                return Ok(());
            }
            BusEvent::Exception { id: got, code } if got == id => {
                bail!("slave answered with exception {code}");
            }
            BusEvent::TransactionLost { id: got } if got == id => {
                bail!("telegram lost: no reply from the bus");
            }
            BusEvent::ResponseRawComplete { id: got, frame } if got == id => {
                raw_reply = Some(hex(&frame));
            }
            BusEvent::TransactionFinished => {
                // No decoded event followed the raw completion (echo reply
                // or undecoded function code); the hex dump is the result.
                if let Some(reply) = raw_reply.take() {
                    println!("reply: {reply}");
                    return Ok(());
                }
                if broadcast {
                    println!("broadcast sent, no reply expected");
                    return Ok(());
                }
            }
            _ => {}
        }
    }
}

fn required<'a>(sub: &'a ArgMatches, name: &str) -> Result<&'a String> {
    sub.get_one::<String>(name)
        .ok_or_else(|| anyhow!("--{name} is required"))
}

fn address(sub: &ArgMatches) -> Result<u16> {
    Ok(parse_number(required(sub, "address")?)? as u16)
}

fn count(sub: &ArgMatches) -> Result<u16> {
    Ok(parse_number(required(sub, "count")?)? as u16)
}

/// Parse a decimal or 0x-prefixed hex number.
fn parse_number(text: impl AsRef<str>) -> Result<u64> {
    let text = text.as_ref();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex_digits) => u64::from_str_radix(hex_digits, 16),
        None => text.parse(),
    };
    parsed.map_err(|_| anyhow!("invalid number '{text}'"))
}

/// Parse hex bytes with or without separators: "00 10" or "0010".
fn parse_hex_bytes(text: &str) -> Result<Vec<u8>> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() % 2 != 0 {
        bail!("hex payload has an odd number of digits");
    }
    (0..compact.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&compact[i..i + 2], 16)
                .map_err(|_| anyhow!("invalid hex byte '{}'", &compact[i..i + 2]))
        })
        .collect()
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}
