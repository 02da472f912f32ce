use log::LevelFilter;

use crate::remote::format::DEFAULT_PORT;


/// What `aoremoteclient` was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run as a worker: connect back to the coordinator and serve requests.
    Connect {
        coordinator: String,
        port: u16,
        /// Name reported in the handshake; the local host name when absent.
        hostname: Option<String>,
    },
    /// Run as a coordinator: read quality tables from every shard.
    Collect {
        observation: String,
        config: Option<String>,
    },
    Version,
}

/// A parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub command: Command,
    pub log_level: LevelFilter,
}


/// Parse CLI arguments, WITHOUT the program name.
///
/// `--log-level` is accepted anywhere after the subcommand.
pub fn parse_args(args: &[&str]) -> Result<Invocation, String> {
    if args.is_empty() {
        return Err("No command specified. Usage: aoremoteclient <connect|collect|version>".into());
    }

    let mut log_level = LevelFilter::Info;
    let mut rest: Vec<&str> = Vec::with_capacity(args.len());
    let mut i = 1;
    while i < args.len() {
        if args[i] == "--log-level" {
            i += 1;
            log_level = parse_level(&take_arg(args, i, "--log-level")?)?;
        } else {
            rest.push(args[i]);
        }
        i += 1;
    }

    let command = match args[0] {
        "connect" => parse_connect(&rest)?,
        "collect" => parse_collect(&rest)?,
        "version" | "--version" => Command::Version,
        other => return Err(format!("Unknown command: '{}'", other)),
    };
    Ok(Invocation { command, log_level })
}


// ---------------------------------------------------------------------------
// Sub-parsers
// ---------------------------------------------------------------------------

/// `aoremoteclient connect <coordinator> [--port <n>] [--hostname <name>]`
fn parse_connect(args: &[&str]) -> Result<Command, String> {
    if args.is_empty() || args[0].starts_with("--") {
        return Err("Usage: aoremoteclient connect <coordinator> [--port <n>] [--hostname <name>]".into());
    }
    let coordinator = args[0].to_string();
    let mut port = DEFAULT_PORT;
    let mut hostname = None;

    let rest = &args[1..];
    let mut i = 0;
    while i < rest.len() {
        match rest[i] {
            "--port" => {
                i += 1;
                let value = take_arg(rest, i, "--port")?;
                port = value
                    .parse()
                    .map_err(|_| format!("Invalid port: '{}'", value))?;
            }
            "--hostname" => {
                i += 1;
                hostname = Some(take_arg(rest, i, "--hostname")?);
            }
            other => return Err(format!("Unknown flag for connect: '{}'", other)),
        }
        i += 1;
    }
    Ok(Command::Connect { coordinator, port, hostname })
}

/// `aoremoteclient collect <observation> [--config <file>]`
fn parse_collect(args: &[&str]) -> Result<Command, String> {
    if args.is_empty() || args[0].starts_with("--") {
        return Err("Usage: aoremoteclient collect <observation> [--config <file>]".into());
    }
    let observation = args[0].to_string();
    let mut config = None;

    let rest = &args[1..];
    let mut i = 0;
    while i < rest.len() {
        match rest[i] {
            "--config" => {
                i += 1;
                config = Some(take_arg(rest, i, "--config")?);
            }
            other => return Err(format!("Unknown flag for collect: '{}'", other)),
        }
        i += 1;
    }
    Ok(Command::Collect { observation, config })
}

fn parse_level(value: &str) -> Result<LevelFilter, String> {
    match value {
        "off" => Ok(LevelFilter::Off),
        "error" => Ok(LevelFilter::Error),
        "warn" => Ok(LevelFilter::Warn),
        "info" => Ok(LevelFilter::Info),
        "debug" => Ok(LevelFilter::Debug),
        "trace" => Ok(LevelFilter::Trace),
        _ => Err(format!("Invalid log level: '{}'", value)),
    }
}

fn take_arg(args: &[&str], index: usize, flag: &str) -> Result<String, String> {
    if index >= args.len() {
        return Err(format!("{} requires a value", flag));
    }
    Ok(args[index].into())
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
