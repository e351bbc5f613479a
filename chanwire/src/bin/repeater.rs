//! Discovery relay daemon.
//!
//! Binds the repeater port and forwards beacons to the clients on this host
//! that registered with it. Exits with status 1 if the port is taken.
//!
//! # Usage
//!
//! ```sh
//! chanwire-repeater --port 5065
//! ```

use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::AtomicBool;

use chanwire::protocol::DEFAULT_REPEATER_PORT;
use chanwire::repeater::{Repeater, RepeaterError};

/// Environment override for the port.
const PORT_VAR: &str = "CHANWIRE_REPEATER_PORT";

fn main() {
    chanwire::init_tracing();
    if let Err(e) = run() {
        eprintln!("chanwire-repeater: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), RepeaterError> {
    let args: Vec<String> = std::env::args().collect();
    let port = parse_args(&args)?;

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let mut repeater = Repeater::bind(addr)?;
    eprintln!("chanwire-repeater: listening on {}", repeater.local_addr());

    // Runs until the process is terminated.
    let never = AtomicBool::new(false);
    repeater.run(&never)
}

fn invalid(message: String) -> RepeaterError {
    RepeaterError::Io(io::Error::new(ErrorKind::InvalidInput, message))
}

/// Port from `--port`, else the environment, else the protocol default.
fn parse_args(args: &[String]) -> Result<u16, RepeaterError> {
    let mut port = match std::env::var(PORT_VAR) {
        Ok(value) => value
            .parse()
            .map_err(|e| invalid(format!("{PORT_VAR}={value}: {e}")))?,
        Err(_) => DEFAULT_REPEATER_PORT,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                let Some(value) = args.get(i) else {
                    return Err(invalid("missing value for --port".into()));
                };
                port = value
                    .parse()
                    .map_err(|e| invalid(format!("--port {value}: {e}")))?;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg => return Err(invalid(format!("unknown argument: {arg}"))),
        }
        i += 1;
    }
    Ok(port)
}

fn print_usage() {
    eprintln!(
        r#"chanwire-repeater - beacon relay for clients on this host

USAGE:
    chanwire-repeater [OPTIONS]

OPTIONS:
    -p, --port <PORT>   UDP port to bind (default: 5065, or $CHANWIRE_REPEATER_PORT)
    -h, --help          Print this help message

ENVIRONMENT:
    RUST_LOG            Log filter when built with --features tracing
"#
    );
}
