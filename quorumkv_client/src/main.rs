//! QuorumKV one-shot client executable.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use quorumkv::{logger_init, pf_error, KvClient, QuorumKvError, SetValueResult};
use tokio::runtime::Builder;
use tokio::time::Duration;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Client-facing API address of the coordinator replica.
    #[arg(short, long)]
    server: SocketAddr,

    /// Deadline of the request in millisecs.
    #[arg(short, long, default_value_t = 10000)]
    timeout_ms: u64,

    #[command(subcommand)]
    op: Op,
}

/// Client operation.
#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Op {
    /// Reads the latest value of a key.
    Get { key: String },

    /// Writes a value under a key.
    Set { key: String, value: String },
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(QuorumKvError)` on any error.
    fn sanitize(&self) -> Result<(), QuorumKvError> {
        if self.timeout_ms == 0 {
            return Err(QuorumKvError::msg(format!(
                "invalid timeout_ms {}",
                self.timeout_ms
            )));
        }
        Ok(())
    }
}

/// Actual main function of QuorumKV client.
fn client_main() -> Result<bool, QuorumKvError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    let runtime = Builder::new_current_thread()
        .enable_all()
        .thread_name("tokio-worker-client")
        .build()?;

    runtime.block_on(async move {
        let mut client = KvClient::new(args.server)
            .with_timeout(Duration::from_millis(args.timeout_ms));

        match args.op {
            Op::Get { key } => {
                let value = client.get_value(&key).await?;
                match value.value {
                    Some(v) => println!("{} @ {}", v, value.version),
                    None => println!("<empty>"),
                }
                Ok(true)
            }

            Op::Set { key, value } => {
                let result = client.set_value(&key, &value).await?;
                println!("{}", result);
                Ok(result == SetValueResult::Success)
            }
        }
    })
}

/// Main function of QuorumKV client.
fn main() -> ExitCode {
    logger_init();

    match client_main() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(ref e) => {
            pf_error!("c"; "client_main exited: {}", e);
            ExitCode::FAILURE
        }
    }
}
