//! QuorumKV server replica executable.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use quorumkv::{logger_init, pf_error, QuorumKvError, QuorumKvReplica};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// My replica ID: index of my peer address in the replica list.
    #[arg(short, long)]
    id: u8,

    /// Client-facing API address to bind.
    #[arg(short, long)]
    api_addr: SocketAddr,

    /// Peer-facing address to bind.
    #[arg(short, long)]
    p2p_addr: SocketAddr,

    /// Peer-facing addresses of all replicas in ID order
    /// (e.g., '-r host0:port -r host1:port -r host2:port').
    #[arg(short = 'r', long = "replica")]
    replicas: Vec<SocketAddr>,

    /// Configuration parameters in TOML format; '+' separates lines
    /// (e.g., "wal_dir='/tmp/qkv0'+read_repair_mode='synchronous'").
    #[arg(short, long, default_value_t = String::from(""))]
    config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 16)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(QuorumKvError)` on any error.
    fn sanitize(&self) -> Result<(), QuorumKvError> {
        if self.replicas.is_empty() || self.replicas.len() > u8::MAX as usize {
            return Err(QuorumKvError::msg(format!(
                "invalid number of replicas {}",
                self.replicas.len()
            )));
        }
        if self.id as usize >= self.replicas.len() {
            return Err(QuorumKvError::msg(format!(
                "invalid replica ID {} / {}",
                self.id,
                self.replicas.len()
            )));
        }
        if self.replicas[self.id as usize] != self.p2p_addr {
            return Err(QuorumKvError::msg(format!(
                "p2p_addr {} differs from replica {}'s address {}",
                self.p2p_addr, self.id, self.replicas[self.id as usize]
            )));
        }
        if self.api_addr == self.p2p_addr {
            return Err(QuorumKvError::msg(format!(
                "api_addr == p2p_addr {}",
                self.api_addr
            )));
        }
        if self.threads < 2 {
            return Err(QuorumKvError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }

        // check for duplicate replica addresses
        let mut addr_set = HashSet::new();
        for addr in self.replicas.iter() {
            if !addr_set.insert(addr) {
                return Err(QuorumKvError::msg(format!(
                    "duplicate replica address {} given",
                    addr
                )));
            }
        }
        Ok(())
    }

    /// Config string with '+' turned into newlines, or `None` if empty.
    fn config_str(&self) -> Option<String> {
        if self.config.is_empty() {
            None
        } else {
            Some(self.config.replace('+', "\n"))
        }
    }
}

/// Actual main function of QuorumKV server replica.
fn server_main() -> Result<(), QuorumKvError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;
    let config_str = args.config_str();

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("s"; "error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name(format!("tokio-worker-replica{}", args.id))
            .build()?;

        // enter tokio runtime, setup the server replica, and start the main
        // event loop logic
        runtime.block_on(async move {
            let mut replica = QuorumKvReplica::new_and_setup(
                args.id,
                args.api_addr,
                args.p2p_addr,
                args.replicas,
                config_str.as_deref(),
            )
            .await?;

            replica.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), QuorumKvError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of QuorumKV server replica.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = server_main() {
        pf_error!("s"; "server_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
