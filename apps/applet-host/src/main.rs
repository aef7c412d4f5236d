use anyhow::Context;
use applet_host::cli::{Cli, Command};
use applet_host::config::HostConfig;
use applet_host::harness;
use applet_host::telemetry::logging as logctl;
use clap::Parser;
use tracing::debug;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).context("logging initialization failed")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let config = HostConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    debug!(?config, "configuration loaded");

    match cli.command {
        Command::CheckId(args) => {
            let report = harness::check_id(&config, &args.iid)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{report}");
            }
        }
        Command::Properties => print!("{}", harness::property_table()),
        Command::Simulate(args) => {
            let report = harness::simulate(&config, &args).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{report}");
            }
        }
        #[cfg(feature = "session-bus")]
        Command::Host(args) => {
            let shutdown = async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %err, "cannot listen for interrupts");
                    std::future::pending::<()>().await;
                }
            };
            let json = args.json;
            let exit = harness::host(&config, &args, shutdown, |update| {
                if json {
                    match serde_json::to_string(&update) {
                        Ok(line) => println!("{line}"),
                        Err(err) => tracing::warn!(error = %err, "failed to encode update"),
                    }
                } else {
                    println!("{update}");
                }
            })
            .await?;
            if exit == harness::HostExit::Broken {
                anyhow::bail!("applet {} stopped responding", args.iid);
            }
        }
    }
    Ok(())
}
