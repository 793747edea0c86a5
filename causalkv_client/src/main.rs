//! Causalkv one-shot client executable.

use std::process::ExitCode;

use causalkv::{logger_init, pf_error, Address, CausalKvError, KvClient};
use clap::{Parser, Subcommand};
use tokio::runtime::Builder;
use tokio::time::{self, Duration};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Replica address 'host:port' to talk to.
    #[arg(short, long)]
    server: String,

    /// Reply timeout duration in millisecs.
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

/// Operation to perform.
#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Read the value of a key.
    Get { key: String },

    /// Write the value of a key.
    Put { key: String, value: String },
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(server)` on success or
    /// `Err(CausalKvError)` on any error.
    fn sanitize(&self) -> Result<Address, CausalKvError> {
        if self.timeout_ms == 0 {
            Err(CausalKvError::msg(format!(
                "invalid timeout duration {} ms",
                self.timeout_ms
            )))
        } else {
            self.server.parse()
        }
    }
}

/// Actual main function of causalkv client.
fn client_main() -> Result<(), CausalKvError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let server = args.sanitize()?;
    let timeout = Duration::from_millis(args.timeout_ms);

    let runtime = Builder::new_current_thread().enable_all().build()?;
    runtime.block_on(async move {
        let client = KvClient::new(server);
        let result = match args.command {
            Command::Get { key } => {
                time::timeout(timeout, client.read(&key)).await.map(|r| {
                    r.map(|value| match value {
                        Some(value) => println!("{} = {}", key, value),
                        None => println!("{} not found", key),
                    })
                })
            }
            Command::Put { key, value } => time::timeout(
                timeout,
                client.write(&key, &value),
            )
            .await
            .map(|r| r.map(|()| println!("{} <- {}", key, value))),
        };
        result.map_err(|_| {
            CausalKvError::msg(format!(
                "no reply from {} within {} ms",
                client.server(),
                timeout.as_millis()
            ))
        })?
    })
}

/// Main function of causalkv client.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = client_main() {
        pf_error!("c"; "client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
