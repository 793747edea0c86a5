//! Causalkv replica node executable.

use std::io::{self, BufRead};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use causalkv::{
    logger_init, pf_error, pf_warn, Address, CausalKvError, ReplicaNode,
};
use clap::Parser;
use log::{self, LevelFilter};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Tracker host.
    tracker_host: String,

    /// Tracker port.
    tracker_port: u16,

    /// Host this replica is reachable at.
    replica_host: String,

    /// Port this replica listens on.
    /// This port must be available at process launch.
    replica_port: u16,

    /// Replica configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 8)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok((me, tracker))` on
    /// success or `Err(CausalKvError)` on any error.
    fn sanitize(&self) -> Result<(Address, Address), CausalKvError> {
        if self.tracker_host.is_empty() {
            Err(CausalKvError::msg("empty tracker host"))
        } else if self.replica_host.is_empty() {
            Err(CausalKvError::msg("empty replica host"))
        } else if self.replica_port <= 1024 {
            Err(CausalKvError::msg(format!(
                "invalid replica_port {}",
                self.replica_port
            )))
        } else if self.tracker_port == 0 {
            Err(CausalKvError::msg(format!(
                "invalid tracker_port {}",
                self.tracker_port
            )))
        } else if self.threads < 2 {
            Err(CausalKvError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok((
                Address::new(self.replica_host.clone(), self.replica_port),
                Address::new(self.tracker_host.clone(), self.tracker_port),
            ))
        }
    }
}

/// Sends on the termination channel, logging failures.
fn signal_term(me: &Address, tx_term: &watch::Sender<bool>) {
    if let Err(e) = tx_term.send(true) {
        pf_error!(me; "error sending to term channel: {}", e);
    }
}

/// Actual main function of causalkv replica.
fn replica_main() -> Result<(), CausalKvError> {
    // read in and parse command line arguments
    let mut args = CliArgs::parse();
    let (me, tracker) = args.sanitize()?;

    // parse optional config string if given
    let config_str = if args.config.is_empty() {
        None
    } else {
        args.config = args.config.replace('+', "\n");
        Some(args.config.clone())
    };

    // set up termination signals handler: Ctrl-C, or typing "1" + Enter
    let (tx_term, rx_term) = watch::channel(false);
    let tx_term = Arc::new(tx_term);
    {
        let (me, tx_term) = (me.clone(), tx_term.clone());
        ctrlc::set_handler(move || signal_term(&me, &tx_term))?;
    }
    {
        let (me, tx_term) = (me.clone(), tx_term.clone());
        thread::spawn(move || {
            for line in io::stdin().lock().lines() {
                match line {
                    Ok(line) if line.trim() == "1" => {
                        signal_term(&me, &tx_term);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        pf_warn!(me; "error reading stdin: {}", e);
                        break;
                    }
                }
            }
        });
    }

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-replica")
            .build()?;

        // enter tokio runtime, join the network, and start serving
        runtime.block_on(async move {
            let node = ReplicaNode::new_and_setup(
                me,
                tracker,
                config_str.as_deref(),
            )
            .await?;

            node.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), CausalKvError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of causalkv replica.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = replica_main() {
        pf_error!("r"; "replica_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
