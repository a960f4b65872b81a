use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Default port for the `status` subcommand when none is given.
pub const DEFAULT_STATUS_PORT: u16 = 8088;

#[derive(Parser)]
#[command(
    name = "gandalf",
    about = "TCP relay daemon for USB-attached mobile devices",
    version = env!("GANDALF_BUILD_VERSION"),
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the relay daemon
    Run {
        /// Tunnel mapping file (JSON array; `#` lines are comments).
        /// Without a mapping file the daemon only prints device events.
        #[arg(short, long)]
        mappings: Option<PathBuf>,

        /// Serve a read-only JSON status endpoint on 127.0.0.1:<port>
        #[arg(short, long)]
        status_port: Option<u16>,

        /// Close idle tunnels after this many seconds (0 = never)
        #[arg(short, long, default_value_t = 0)]
        tunnel_timeout: u64,

        /// Detach from the terminal and run in the background
        #[arg(short, long)]
        daemonize: bool,

        /// Log file; required with --daemonize, optional otherwise
        #[arg(short, long)]
        log_file: Option<PathBuf>,

        /// Stop the daemon on listener OS errors instead of only logging them
        #[arg(long)]
        exit_on_os_error: bool,
    },

    /// Tell the running daemon to reload its mapping file (SIGUSR1)
    Reload,

    /// Gracefully stop the running daemon (SIGUSR2)
    Shutdown,

    /// Fetch and print the status JSON of the running daemon
    Status {
        /// Port the daemon's status endpoint listens on
        #[arg(short, long, default_value_t = DEFAULT_STATUS_PORT)]
        port: u16,
    },
}
