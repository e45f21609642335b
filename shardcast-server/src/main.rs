mod config;

use std::sync::atomic::Ordering;

use anyhow::Context;
use clap::Parser;
use log::info;

use shardcast_core::config::ProxyConfig;
use shardcast_core::reactor::ProxyRuntime;
use shardcast_io::platform;

use crate::config::Args;

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    info!("starting shardcast proxy");

    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading config {}", args.config.display()))?;
    let proxy_config: ProxyConfig =
        serde_json::from_str(&raw).context("parsing proxy configuration")?;

    platform::ignore_sigpipe();
    if let Some(core) = args.pin_core {
        platform::pin_thread_to_core(core);
    }

    let mut runtime = ProxyRuntime::new(proxy_config).context("building proxy runtime")?;
    runtime
        .listen_cas(&args.cas_path)
        .context("binding cas listener")?;
    match &args.broker_path {
        Some(path) => runtime
            .connect_broker(path)
            .context("connecting to broker")?,
        None => runtime
            .listen_clients(&args.client_addr)
            .context("binding client listener")?,
    }

    // Signals only flip the flag; all teardown runs on the reactor thread.
    let shutdown = runtime.shutdown_flag();
    ctrlc::set_handler(move || {
        shutdown.store(true, Ordering::Relaxed);
    })
    .context("installing signal handler")?;

    runtime.run().context("reactor loop")?;
    Ok(())
}
