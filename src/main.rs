use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use nix::sys::signal::Signal;
use slog_scope::error;

use gandalf::cli::{Cli, Command};
use gandalf::daemon::{self, RunOptions};
use gandalf::error::Result;
use gandalf::logging;
use gandalf::status;

fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Command::Run {
            mappings,
            status_port,
            tunnel_timeout,
            daemonize,
            log_file,
            exit_on_os_error,
        } => {
            let options = RunOptions {
                mappings,
                status_port,
                tunnel_timeout: match tunnel_timeout {
                    0 => None,
                    secs => Some(Duration::from_secs(secs)),
                },
                exit_on_os_error,
            };
            run_daemon(options, daemonize, log_file, cli.verbose)
        }

        // One-shot peer commands; no tokio needed.
        Command::Reload => {
            logging::init_terminal(cli.verbose);
            finish("reload", daemon::signal_running_daemon(Signal::SIGUSR1))
        }
        Command::Shutdown => {
            logging::init_terminal(cli.verbose);
            finish("shutdown", daemon::signal_running_daemon(Signal::SIGUSR2))
        }
        Command::Status { port } => {
            logging::init_terminal(cli.verbose);
            finish("status", cmd_status(port))
        }
    };

    std::process::exit(code);
}

fn run_daemon(
    options: RunOptions,
    daemonize: bool,
    log_file: Option<PathBuf>,
    verbose: bool,
) -> i32 {
    if daemonize {
        let Some(log_path) = log_file else {
            eprintln!("--daemonize requires --log-file");
            return 1;
        };
        match daemonize::Daemonize::new().working_directory("/").execute() {
            daemonize::Outcome::Parent(Ok(_)) => return 0,
            daemonize::Outcome::Parent(Err(e)) => {
                eprintln!("failed to daemonize: {}", e);
                return 1;
            }
            daemonize::Outcome::Child(Err(e)) => {
                eprintln!("failed to initialize daemon child: {}", e);
                return 1;
            }
            daemonize::Outcome::Child(Ok(_)) => {
                if let Err(e) = logging::init_file(&log_path, verbose) {
                    // stderr already points at /dev/null here; nothing
                    // better to do than exit.
                    eprintln!("failed to open log file: {}", e);
                    return 1;
                }
            }
        }
    } else if let Some(log_path) = log_file {
        if let Err(e) = logging::init_file(&log_path, verbose) {
            eprintln!("failed to open log file: {}", e);
            return 1;
        }
    } else {
        logging::init_terminal(verbose);
    }

    install_panic_hook();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("tokio_runtime_build_failed"; "error" => e.to_string());
            return 1;
        }
    };
    finish("run", rt.block_on(daemon::run(options)))
}

fn cmd_status(port: u16) -> Result<()> {
    let body = status::fetch(port)?;
    let value: serde_json::Value = serde_json::from_str(&body)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn finish(command: &str, result: Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            error!("command_failed"; "command" => command, "error" => e.to_string());
            e.exit_code()
        }
    }
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!("unexpected_panic"; "panic" => info.to_string());
        default_hook(info);
        std::process::exit(1);
    }));
}
