//! relay-soak entry point.
//!
//! ## CLI Subcommands
//!
//! - `relay-soak` or `relay-soak run` - Run the soak loop (default)
//! - `relay-soak ports` - List serial adapters and resolved roles
//! - `relay-soak relay on|off|identify` - Manual relay control
//! - `relay-soak config show|defaults|validate` - Configuration tools

use std::process::ExitCode;

use relay_soak::cli::{self, config_cmd, relay_cmd, CommonArgs, RelayAction};
use relay_soak::config;
use relay_soak::telemetry::{init_logging, init_metrics, LogConfig};
use relay_soak::Harness;

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    // A leading option means the default command: `relay-soak --config soak.toml`.
    let (command, rest) = match args.get(1).map(|s| s.as_str()) {
        None => ("run", &args[1..]),
        Some(flag) if flag.starts_with('-') && !is_meta_flag(flag) => ("run", &args[1..]),
        Some(command) => (command, &args[2..]),
    };

    match command {
        "run" | "" => {
            let Some(parsed) = parse_or_usage(command, rest) else {
                return ExitCode::from(2u8);
            };
            ExitCode::from(run_soak(&parsed).await)
        }
        "ports" => {
            let Some(parsed) = parse_or_usage(command, rest) else {
                return ExitCode::from(2u8);
            };
            init_console_logging();
            let cfg = match config::load_unvalidated(parsed.config.as_deref()) {
                Ok(cfg) => cfg,
                Err(e) => {
                    eprintln!("Configuration error: {}", e);
                    return ExitCode::from(2u8);
                }
            };
            ExitCode::from(cli::run_list(&cfg.ports, parsed.json) as u8)
        }
        "relay" => {
            let Some(parsed) = parse_or_usage(command, rest) else {
                return ExitCode::from(2u8);
            };
            let action = parsed.positional.first().map(|s| s.as_str()).unwrap_or("off");
            let Some(action) = RelayAction::parse(action) else {
                eprintln!("Unknown relay action: {}", action);
                print_command_help("relay");
                return ExitCode::FAILURE;
            };
            init_console_logging();
            let cfg = match config::load(parsed.config.as_deref()) {
                Ok(cfg) => cfg,
                Err(e) => {
                    eprintln!("Configuration error: {}", e);
                    return ExitCode::from(2u8);
                }
            };
            let code = relay_cmd::run(&cfg.ports, &cfg.relay, action).await;
            ExitCode::from(code as u8)
        }
        "config" => {
            let Some(parsed) = parse_or_usage(command, rest) else {
                return ExitCode::from(2u8);
            };
            let path = parsed.config.as_deref();
            let subcommand = parsed.positional.first().map(|s| s.as_str()).unwrap_or("show");
            let code = match subcommand {
                "show" => config_cmd::run_show(path),
                "defaults" => config_cmd::run_defaults(),
                "validate" => config_cmd::run_validate(path),
                _ => {
                    eprintln!("Unknown config subcommand: {}", subcommand);
                    print_command_help("config");
                    return ExitCode::FAILURE;
                }
            };
            ExitCode::from(code as u8)
        }
        "help" | "--help" | "-h" => {
            if let Some(subcommand) = args.get(2) {
                print_command_help(subcommand);
            } else {
                print_usage();
            }
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("relay-soak {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

fn is_meta_flag(flag: &str) -> bool {
    matches!(flag, "--help" | "-h" | "--version" | "-V")
}

fn parse_or_usage(command: &str, rest: &[String]) -> Option<CommonArgs> {
    match cli::parse_args(rest) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            eprintln!("{}", e);
            print_command_help(command);
            None
        }
    }
}

fn init_console_logging() {
    if let Err(e) = init_logging(&LogConfig::from_env()) {
        eprintln!("Logging setup failed: {}", e);
    }
}

/// Run the soak loop until the cycle budget is spent, a fatal condition
/// aborts it, or the operator interrupts it.
async fn run_soak(args: &CommonArgs) -> u8 {
    init_console_logging();
    init_metrics();

    let cfg = match config::load(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return 2;
        }
    };

    let harness = match Harness::connect(cfg, None) {
        Ok(harness) => harness,
        Err(e) => {
            eprintln!("Startup failed: {}", e);
            return e.exit_code();
        }
    };

    // Signal handling: the first Ctrl-C stops at the next state boundary.
    let stop = harness.stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received");
            stop.request_stop();
        }
    });

    if let Some(paths) = harness.stats.log_paths() {
        tracing::info!(
            full = %paths.full.display(),
            error = %paths.error.display(),
            raw = %paths.raw.display(),
            "session logs"
        );
    }

    let outcome = harness.run().await;
    println!("{}", outcome.summary);
    if let Some(burst) = &outcome.burst {
        println!("aborted: {}", burst);
    } else if outcome.exit_code() != 0 {
        println!("aborted: {}", outcome.reason);
    }
    if !outcome.relay_released {
        eprintln!("WARNING: final relay release failed; check the relay manually");
    }
    outcome.exit_code()
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "relay-soak - Relay power-cycle endurance harness v{}

USAGE:
    relay-soak [COMMAND] [OPTIONS]

COMMANDS:
    run          Run the soak loop (default when no command given)
    ports        List serial adapters and the roles they resolve to
    relay        Switch the relay manually (on, off, identify)
    config       Manage configuration (show, defaults, validate)
    version      Show version information
    help         Show this help message

OPTIONS:
    -c, --config FILE  Load configuration from a TOML file
    --json             JSON output (ports)
    -h, --help         Show help for command
    -V, --version      Show version information

EXAMPLES:
    relay-soak                             # Run with defaults
    relay-soak run --config soak.toml      # Run with a config file
    relay-soak ports                       # Which adapter is the relay?
    relay-soak relay off                   # Release the relay
    relay-soak config defaults > soak.toml # Start a config file

ENVIRONMENT:
    RELAY_SOAK_CONFIG       Config file path (when --config is not given)
    RELAY_SOAK_CYCLES       Cycle budget (0 = unlimited)
    RELAY_SOAK_RELAY_PORT   Pin the relay port (skips description matching)
    RELAY_SOAK_DEVICE_PORT  Pin the DUT port (skips description matching)
    RELAY_SOAK_LOG_DIR      Directory for the session log files
    RELAY_SOAK_LOG          Console log filter (debug, info, warn, error)
    RELAY_SOAK_LOG_FORMAT   Console log format (pretty, json)

EXIT CODES:
    0  Completed or interrupted cleanly
    1  Aborted (fault burst, device lost, relay fault)
    2  Configuration error
    3  Serial port error
",
        version
    );
}

/// Print detailed help for a specific command.
fn print_command_help(command: &str) {
    match command {
        "run" => {
            eprintln!(
                "relay-soak run - Run the soak loop

USAGE:
    relay-soak run [OPTIONS]

OPTIONS:
    -c, --config FILE  Load configuration from a TOML file

DESCRIPTION:
    Resolves the relay and DUT serial adapters, releases the relay and
    power-cycles the DUT until the cycle budget is spent. Every DUT log
    line is classified against the keyword rules; a fault burst aborts
    the run with the relay released.

    Ctrl-C stops at the next phase boundary. The relay is always left
    released and the session logs are flushed before exit.

EXIT CODES:
    0  Completed or interrupted
    1  Aborted
    2  Configuration error
    3  Serial port error

EXAMPLES:
    relay-soak run
    relay-soak run --config soak.toml
    RELAY_SOAK_CYCLES=50 relay-soak run
"
            );
        }
        "ports" => {
            eprintln!(
                "relay-soak ports - List serial adapters

USAGE:
    relay-soak ports [OPTIONS]

OPTIONS:
    -c, --config FILE  Use the matching rules from a config file
    --json             Output in JSON format

EXIT CODES:
    0  Both roles resolved
    3  A role could not be resolved

EXAMPLES:
    relay-soak ports
    relay-soak ports --json
"
            );
        }
        "relay" => {
            eprintln!(
                "relay-soak relay - Manual relay control

USAGE:
    relay-soak relay <ACTION> [OPTIONS]

ACTIONS:
    on        Energize the DUT
    off       Release the relay (default)
    identify  Query the board model via the handshake command

OPTIONS:
    -c, --config FILE  Load configuration from a TOML file

EXIT CODES:
    0  Command acknowledged
    1  Relay command failed
    3  Relay port not found or not openable

EXAMPLES:
    relay-soak relay off
    relay-soak relay identify
"
            );
        }
        "config" => {
            eprintln!(
                "relay-soak config - Manage configuration

USAGE:
    relay-soak config <SUBCOMMAND> [OPTIONS]

SUBCOMMANDS:
    show           Show the effective configuration (file + environment)
    validate       Validate the effective configuration
    defaults       Show the built-in defaults

OPTIONS:
    -c, --config FILE  Configuration file path

EXAMPLES:
    relay-soak config show --config soak.toml
    relay-soak config validate --config soak.toml
    relay-soak config defaults
"
            );
        }
        _ => {
            eprintln!(
                "No detailed help available for '{}'. Use 'relay-soak help' for general usage.",
                command
            );
        }
    }
}
