use clap::{Arg, ArgMatches, Command};

/// Parse command line arguments into ArgMatches.
pub fn parse_args() -> ArgMatches {
    build_command().get_matches()
}

fn bus_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("port")
                .long("port")
                .short('p')
                .required(true)
                .help("Serial port of the RS-485 adapter, e.g. /dev/ttyUSB0"),
        )
        .arg(
            Arg::new("baud")
                .long("baud")
                .short('b')
                .default_value("9600")
                .help("Baud rate (line discipline is fixed at 8N2)"),
        )
        .arg(
            Arg::new("slave")
                .long("slave")
                .short('s')
                .required(true)
                .help("Slave address (0 broadcasts, no reply expected)"),
        )
        .arg(
            Arg::new("timeout-ms")
                .long("timeout-ms")
                .default_value("5000")
                .help("Request timeout in milliseconds"),
        )
        .arg(
            Arg::new("repeat")
                .long("repeat")
                .default_value("1")
                .help("Attempt budget per telegram (re-send on loss)"),
        )
}

fn span_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("address")
                .long("address")
                .short('a')
                .required(true)
                .help("Start address (decimal or 0x-prefixed hex)"),
        )
        .arg(
            Arg::new("count")
                .long("count")
                .short('c')
                .default_value("1")
                .help("Number of items to read"),
        )
}

pub fn build_command() -> Command {
    Command::new("ffubus")
        .about("Modbus RTU master console for FFU control buses")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(Command::new("list-ports").about("List available serial ports"))
        .subcommand(span_args(bus_args(
            Command::new("read-coils").about("Read coils (fc 1)"),
        )))
        .subcommand(span_args(bus_args(
            Command::new("read-discrete-inputs").about("Read discrete inputs (fc 2)"),
        )))
        .subcommand(span_args(bus_args(
            Command::new("read-holding").about("Read holding registers (fc 3)"),
        )))
        .subcommand(span_args(bus_args(
            Command::new("read-input").about("Read input registers (fc 4)"),
        )))
        .subcommand(
            bus_args(Command::new("write-coil").about("Write a single coil (fc 5)"))
                .arg(
                    Arg::new("address")
                        .long("address")
                        .short('a')
                        .required(true)
                        .help("Coil address"),
                )
                .arg(
                    Arg::new("value")
                        .long("value")
                        .short('v')
                        .required(true)
                        .help("on|off"),
                ),
        )
        .subcommand(
            bus_args(Command::new("write-register").about("Write a single register (fc 6)"))
                .arg(
                    Arg::new("address")
                        .long("address")
                        .short('a')
                        .required(true)
                        .help("Register address"),
                )
                .arg(
                    Arg::new("value")
                        .long("value")
                        .short('v')
                        .required(true)
                        .help("Register value"),
                ),
        )
        .subcommand(
            bus_args(
                Command::new("write-registers").about("Write multiple registers (fc 16)"),
            )
            .arg(
                Arg::new("address")
                    .long("address")
                    .short('a')
                    .required(true)
                    .help("Start address"),
            )
            .arg(
                Arg::new("values")
                    .long("values")
                    .short('v')
                    .required(true)
                    .help("Comma-separated register values, e.g. 100,0x200,3"),
            ),
        )
        .subcommand(
            bus_args(Command::new("raw").about("Send an arbitrary PDU and dump the reply"))
                .arg(
                    Arg::new("function")
                        .long("function")
                        .short('f')
                        .required(true)
                        .help("Function code"),
                )
                .arg(
                    Arg::new("payload")
                        .long("payload")
                        .default_value("")
                        .help("Payload as hex bytes, e.g. \"00 10 00 02\""),
                ),
        )
}
