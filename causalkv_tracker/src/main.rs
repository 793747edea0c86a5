//! Causalkv membership tracker executable.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use causalkv::{logger_init, pf_error, CausalKvError, Tracker};
use clap::Parser;
use log::{self, LevelFilter};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Local IP to use for binding the listening socket.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Replica-facing port.
    /// This port must be available at process launch.
    #[arg(short, long, default_value_t = 52600)]
    port: u16,

    /// Tracker configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(bind_addr)` on success
    /// or `Err(CausalKvError)` on any error.
    fn sanitize(&self) -> Result<SocketAddr, CausalKvError> {
        if self.port <= 1024 {
            Err(CausalKvError::msg(format!("invalid port {}", self.port)))
        } else if self.threads < 2 {
            Err(CausalKvError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(SocketAddr::from((self.bind_ip, self.port)))
        }
    }
}

/// Actual main function of causalkv tracker.
fn tracker_main() -> Result<(), CausalKvError> {
    // read in and parse command line arguments
    let mut args = CliArgs::parse();
    let bind_addr = args.sanitize()?;

    // parse optional config string if given
    let config_str = if args.config.is_empty() {
        None
    } else {
        args.config = args.config.replace('+', "\n");
        Some(args.config.clone())
    };

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("t"; "error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-tracker")
            .build()?;

        // enter tokio runtime, setup the tracker, and start the main event
        // loop logic
        runtime.block_on(async move {
            let tracker =
                Tracker::new_and_setup(bind_addr, config_str.as_deref())
                    .await?;

            tracker.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), CausalKvError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of causalkv tracker.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = tracker_main() {
        pf_error!("t"; "tracker_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
