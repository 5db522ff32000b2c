pub mod capture;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Arg, Command};

use arg_gateway::config::{find_own_gate, read_config, read_known_gates, read_private_key, ConfigError};
use arg_gateway::gateway::Gateway;
use arg_gateway::logging::{Level, Logger};
use arg_gateway::{exitcode, log_alert};

use capture::NullCapture;

fn make_help() -> String {
    r###"arg 0.1.0
Address-hopping routing gateway

Usage: arg [-d] <conf_path> [<gate_name>]

Arguments:
  conf_path                Path to the gateway's configuration file
  gate_name                Override the gate name the conf file declares

Options:
  -d, --debug               Log at debug level instead of alert level
  -h, --help                 Show this help

The configuration file's directory is also scanned for <name>.pub key
files (one per known peer, including this gateway's own) and must
contain a matching <name>.priv file for this gateway's own name.
"###
    .to_string()
}

fn build_command() -> Command {
    Command::new("arg")
        .disable_help_flag(true)
        .disable_version_flag(true)
        .arg(Arg::new("debug").short('d').long("debug").action(clap::ArgAction::SetTrue))
        .arg(Arg::new("help").short('h').long("help").action(clap::ArgAction::SetTrue))
        .arg(Arg::new("conf_path").index(1))
        .arg(Arg::new("gate_name").index(2))
}

/// Negate a configuration error's legacy code so it reaches the shell as
/// the positive exit status process conventions expect.
fn config_exit_code(e: &ConfigError) -> i32 {
    -e.as_legacy_code()
}

fn main() {
    let matches = build_command().get_matches();

    if matches.get_flag("help") {
        print!("{}", make_help());
        std::process::exit(exitcode::OK);
    }

    let Some(conf_path) = matches.get_one::<String>("conf_path") else {
        eprintln!("Missing required argument <conf_path>. Use -h for help.");
        std::process::exit(exitcode::ERR_USAGE);
    };

    let level = if matches.get_flag("debug") { Level::Debug } else { Level::Alert };
    let logger = Arc::new(Logger::new(level));

    let mut config = match read_config(Path::new(conf_path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("arg: {}", e);
            std::process::exit(exitcode::ERR_IOERR);
        }
    };
    if let Some(override_name) = matches.get_one::<String>("gate_name") {
        config.our_gate_name = override_name.clone();
    }

    let known_gates = match read_known_gates(&config.dir) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("arg: {}", e);
            std::process::exit(config_exit_code(&e));
        }
    };

    let our_private_key = match read_private_key(&config.dir, &config.our_gate_name) {
        Ok(k) => k,
        Err(e) => {
            eprintln!("arg: {}", e);
            std::process::exit(config_exit_code(&e));
        }
    };

    if let Err(e) = find_own_gate(&known_gates, &config.our_gate_name) {
        eprintln!("arg: {}", e);
        std::process::exit(config_exit_code(&e));
    }

    log_alert!(logger, "starting gate '{}' ({} known peers)", config.our_gate_name, known_gates.len());

    let capture = NullCapture::new(&config.internal_device, &config.external_device);
    let gateway = Gateway::new(&config, known_gates, our_private_key, capture, logger);
    gateway.start();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_flag.store(true, Ordering::Relaxed)) {
        eprintln!("arg: failed to install SIGINT handler: {}", e);
        std::process::exit(exitcode::ERR_IOERR);
    }

    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }
    gateway.shutdown();
    std::process::exit(exitcode::OK);
}
