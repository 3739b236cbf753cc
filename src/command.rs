use crate::api::{ApiRouter, EnforcerApiHandler};
use crate::enforcer::{Enforcer, NUM_LEVELS};
use crate::web;
use clap::Parser;
use log::{error, info};
use log::LevelFilter;
use std::sync::{Arc, Mutex};
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::Notify;

#[derive(Debug, Parser)]
#[clap(name = "netenforcer")]
#[clap(version = env!("CARGO_PKG_VERSION"))]
#[clap(about = "Priority and rate limit enforcement for egress traffic via Linux TC")]
pub struct Options {
    #[clap(
        short = 'd',
        long = "dev",
        default_value = "eth0",
        help = "Egress network interface to enforce on"
    )]
    pub dev: String,

    #[clap(
        short = 'b',
        long = "max-rate",
        default_value = "125000000",
        help = "Link capacity in bytes per second"
    )]
    pub max_rate: u64,

    #[clap(
        short = 'n',
        long = "num-priorities",
        default_value = "7",
        help = "Number of priority levels (0 is highest)"
    )]
    pub num_priorities: u32,

    #[clap(
        short = 'p',
        long = "port",
        default_value = "7070",
        help = "RPC server listening port"
    )]
    pub port: u16,
}

fn log_startup_info(options: &Options) {
    info!("Interface:       {}", options.dev);
    info!("Link capacity:   {} bytes/sec", options.max_rate);
    info!("Priority levels: {}", options.num_priorities);
    info!("Rate limit levels: {}", NUM_LEVELS);
    info!("RPC port:        {}", options.port);
}

pub async fn run(options: Options) -> Result<(), anyhow::Error> {
    // Set up logging
    env_logger::Builder::new()
        .filter(None, LevelFilter::Info)
        .target(env_logger::Target::Stdout)
        .init();

    if options.num_priorities == 0 {
        return Err(anyhow::anyhow!("Number of priorities must be at least 1"));
    }
    if options.max_rate < 100 {
        // Each priority level reserves 1% of the link
        return Err(anyhow::anyhow!(
            "Max rate {} is too small, must be at least 100 bytes per second",
            options.max_rate
        ));
    }

    log_startup_info(&options);

    let enforcer = Arc::new(Mutex::new(Enforcer::new(&options)));

    // Install the root qdisc hierarchy before accepting any policy
    enforcer.lock().unwrap().install_root();
    info!("Installed root qdisc hierarchy on {}", options.dev);

    // SIGINT/SIGTERM both stop the server loop so teardown runs below
    let shutdown_notify = Arc::new(Notify::new());
    {
        let shutdown_notify = Arc::clone(&shutdown_notify);
        tokio::spawn(async move {
            let mut sigterm = match unix_signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    return;
                }
            };
            tokio::select! {
                _ = signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            info!("Exiting...");
            shutdown_notify.notify_one();
        });
    }

    let handler = EnforcerApiHandler::new(Arc::clone(&enforcer));
    let router = ApiRouter::new(handler);
    // A bind failure propagates and the process exits non-zero
    web::start_server(options.port, router, Arc::clone(&shutdown_notify)).await?;

    // Remove the root qdisc; the kernel cascades everything we installed
    enforcer.lock().unwrap().teardown();
    info!("Removed root qdisc on {}", options.dev);

    Ok(())
}
