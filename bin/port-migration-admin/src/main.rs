// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use port_migration::sdn::ovn::OvnSdnClient;
use port_migration::PortBindingSwitcher;
use port_migration_config::Config;
use slog::{info, o, Drain, Level, Logger};

#[derive(Debug, Parser)]
#[clap(about, version)]
/// Inspect and repair logical port chassis bindings by hand
struct Opt {
    /// TOML configuration file
    #[clap(short, long, action)]
    config: Option<PathBuf>,

    /// OVN northbound database address, overriding the configuration
    #[clap(long, action)]
    northbound: Option<String>,

    /// OVN southbound database address, overriding the configuration
    #[clap(long, action)]
    southbound: Option<String>,

    /// Deadline for each database call, in milliseconds
    #[clap(long, action)]
    timeout_ms: Option<u64>,

    /// Enable debugging
    #[clap(short, long, action)]
    debug: bool,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the chassis a port is bound to
    Chassis {
        #[clap(action)]
        port: String,
    },

    /// Pre-stage a port on a destination chassis
    Prepare {
        #[clap(action)]
        port: String,

        #[clap(action)]
        dest: String,
    },

    /// Move a port's binding and verify that it took
    Switch {
        #[clap(action)]
        port: String,

        /// Chassis the port is expected to be leaving
        #[clap(long, action)]
        from: String,

        #[clap(long, action)]
        to: String,
    },

    /// Return a port to a chassis and drop migration hints
    Rollback {
        #[clap(action)]
        port: String,

        #[clap(long, action)]
        to: String,
    },

    /// Drop migration hints from a port
    Cleanup {
        #[clap(action)]
        port: String,
    },
}

/// Create a top-level logger that outputs to stderr
fn create_logger(opt: &Opt) -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let level = if opt.debug { Level::Debug } else { Level::Info };
    let drain = slog::LevelFilter(drain, level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    Logger::root(drain, o!())
}

fn load_config(opt: &Opt) -> anyhow::Result<Config> {
    let mut config = match &opt.config {
        Some(path) => port_migration_config::parse(path).with_context(|| {
            format!("failed to load config from {}", path.display())
        })?,
        None => Config::default(),
    };
    if let Some(addr) = &opt.northbound {
        config.sdn.northbound = addr.clone();
    }
    if let Some(addr) = &opt.southbound {
        config.sdn.southbound = addr.clone();
    }
    if let Some(ms) = opt.timeout_ms {
        config.sdn.call_timeout_ms = ms;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    let log = create_logger(&opt);
    let config = load_config(&opt)?;

    info!(log, "connecting to OVN";
          "northbound" => &config.sdn.northbound,
          "southbound" => &config.sdn.southbound);
    let sdn = OvnSdnClient::new(
        config.sdn.northbound.clone(),
        config.sdn.southbound.clone(),
        &log,
    );
    let switcher = PortBindingSwitcher::new(
        Arc::new(sdn),
        config.sdn.call_timeout(),
        &log,
    );

    match opt.cmd {
        Command::Chassis { port } => {
            let chassis = switcher
                .current_binding(&port)
                .await
                .with_context(|| format!("failed to look up port {port}"))?;
            println!("{chassis}");
        }
        Command::Prepare { port, dest } => {
            switcher
                .prepare_destination(&port, &dest)
                .await
                .context("failed to add shadow binding")?;
            switcher
                .request_claim(&port, &dest)
                .await
                .context("failed to set requested chassis")?;
        }
        Command::Switch { port, from, to } => {
            switcher.switch_binding(&port, &from, &to).await?;
            println!("{port} bound to {to}");
        }
        Command::Rollback { port, to } => {
            switcher.rollback(&port, &to).await;
            let chassis = switcher.current_binding(&port).await?;
            println!("{port} bound to {chassis}");
        }
        Command::Cleanup { port } => switcher.cleanup(&port).await,
    }

    Ok(())
}
