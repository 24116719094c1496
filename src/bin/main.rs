use std::{error::Error, sync::Arc};

use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use lifectl::{
    cli::{Cli, Commands, parse_args},
    command::ProcessTag,
    config::load_config,
    drain::{OutputSink, TracingSink},
    lifecycle::ProcessLifecycle,
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    match args.command {
        Commands::Start { config, follow } => {
            let lifecycle = build_lifecycle(config.as_deref(), follow)?;
            if follow {
                register_signal_handler(lifecycle.clone())?;
            }
            lifecycle.start();
            if follow {
                let report = lifecycle.join_drains();
                info!(
                    "Output of '{}' closed (stdout: {:?} lines, stderr: {:?} lines)",
                    lifecycle.tag(),
                    report.stdout,
                    report.stderr
                );
            }
        }
        Commands::Stop { config } => {
            build_lifecycle(config.as_deref(), false)?.stop();
        }
        Commands::Kill { config } => {
            build_lifecycle(config.as_deref(), false)?.kill();
        }
        Commands::Status { config, json } => {
            let lifecycle = build_lifecycle(config.as_deref(), false)?;
            print_status(lifecycle.tag(), lifecycle.is_running(), json)?;
        }
    }

    Ok(())
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn build_lifecycle(
    config_path: Option<&str>,
    follow: bool,
) -> Result<ProcessLifecycle, Box<dyn Error>> {
    let config = load_config(config_path)?;
    let sink = if follow {
        let tag = ProcessTag::new(config.process.tag.clone());
        Some(Arc::new(TracingSink::new(tag)) as Arc<dyn OutputSink>)
    } else {
        None
    };
    Ok(config.build_lifecycle(sink)?)
}

#[derive(Serialize)]
struct StatusReport<'a> {
    tag: &'a str,
    running: bool,
}

fn print_status(tag: &ProcessTag, running: bool, json: bool) -> Result<(), Box<dyn Error>> {
    if json {
        let report = StatusReport {
            tag: tag.as_str(),
            running,
        };
        println!("{}", serde_json::to_string(&report)?);
    } else if running {
        println!("{tag}: running");
    } else {
        println!("{tag}: stopped");
    }
    Ok(())
}

/// Stops the controlled process on Ctrl-C while following its output.
fn register_signal_handler(lifecycle: ProcessLifecycle) -> Result<(), Box<dyn Error>> {
    ctrlc::set_handler(move || {
        warn!("Interrupted; stopping '{}'", lifecycle.tag());
        lifecycle.stop();
        if lifecycle.is_running() {
            error!("'{}' is still running after stop", lifecycle.tag());
            std::process::exit(1);
        }
        std::process::exit(0);
    })?;

    Ok(())
}
