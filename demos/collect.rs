//! Collects every layer from a list of devices through a jump host.
//!
//! ```text
//! NETCOLLECT_JUMP_HOST=bastion.example.net NETCOLLECT_JUMP_USER=collector \
//! NETCOLLECT_JUMP_PASSWORD=... NETCOLLECT_USER=netops NETCOLLECT_PASSWORD=... \
//! RUST_LOG=info cargo run --example collect -- pe1=10.0.0.1:ios-xr ce1=10.0.1.1:ios-xe
//! ```
//!
//! `NETCOLLECT_CONFIG` may point at a TOML config, `NETCOLLECT_CATALOG` at a
//! TOML command catalog, and `NETCOLLECT_ENABLE` carries the enable secret.
//! `--layers health,bgp` restricts the run; Ctrl-C cancels it.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use log::{info, warn};
use netcollect::catalog::{CommandCatalog, Layer};
use netcollect::config::CollectorConfig;
use netcollect::coordinator::{CollectionCoordinator, RunContext};
use netcollect::device::{CredentialStore, Credentials, Device};
use netcollect::session::{JumpHost, JumpHostConfig, SshConnector};
use tokio_util::sync::CancellationToken;

fn env(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{name} is not set"))
}

/// `hostname=address[:platform]`
fn parse_device(arg: &str) -> Result<Device> {
    let Some((hostname, target)) = arg.split_once('=') else {
        bail!("expected hostname=address[:platform], got '{arg}'");
    };
    let (address, platform) = match target.split_once(':') {
        Some((address, platform)) => (address, Some(platform)),
        None => (target, None),
    };
    Ok(Device::new(hostname, address, platform))
}

fn parse_layers(list: &str) -> Result<Vec<Layer>> {
    list.split(',')
        .map(|name| {
            name.trim()
                .parse::<Layer>()
                .with_context(|| format!("unknown layer '{name}'"))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let mut devices = Vec::new();
    let mut layers = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--layers" {
            let list = args.next().context("--layers needs a value")?;
            layers = Some(parse_layers(&list)?);
        } else {
            devices.push(parse_device(&arg)?);
        }
    }
    if devices.is_empty() {
        bail!("no devices given");
    }

    let config = match std::env::var("NETCOLLECT_CONFIG") {
        Ok(path) => CollectorConfig::load(&path).with_context(|| format!("loading {path}"))?,
        Err(_) => CollectorConfig::default(),
    };

    let jump = Arc::new(JumpHost::new(JumpHostConfig::new(
        env("NETCOLLECT_JUMP_HOST")?,
        Credentials::new(env("NETCOLLECT_JUMP_USER")?, env("NETCOLLECT_JUMP_PASSWORD")?),
    )));
    let mut device_credentials =
        Credentials::new(env("NETCOLLECT_USER")?, env("NETCOLLECT_PASSWORD")?);
    if let Ok(secret) = std::env::var("NETCOLLECT_ENABLE") {
        device_credentials = device_credentials.with_enable_secret(secret);
    }
    let connector = SshConnector::new(jump.clone(), Arc::new(CredentialStore::new(device_credentials)))
        .with_connect_timeout(config.connect_timeout());

    let mut context = RunContext::new(config, Arc::new(connector))?;
    if let Ok(path) = std::env::var("NETCOLLECT_CATALOG") {
        let catalog = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
        context = context.with_catalog(CommandCatalog::from_toml_str(&catalog)?);
    }
    let mut coordinator = CollectionCoordinator::new(context);
    if let Some(layers) = layers {
        coordinator = coordinator.with_layers(layers);
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling pending work");
            on_interrupt.cancel();
        }
    });

    let mut progress = coordinator.subscribe_progress();
    let reporter = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let snapshot = progress.borrow().clone();
            info!("{}/{} layer tasks settled", snapshot.settled, snapshot.tasks.len());
        }
    });

    let run = coordinator.run(devices, cancel).await?;
    jump.disconnect().await;
    drop(coordinator);
    let _ = reporter.await;

    println!("run {} {}", run.run_id, run.status);
    println!("  directory: {}", run.run_dir.display());
    println!(
        "  devices reachable: {}/{}",
        run.stats.devices_reachable, run.stats.devices_attempted
    );
    for device in &run.devices {
        println!(
            "  {} ({}): {}/{} layers complete{}",
            device.hostname,
            device.platform,
            device.complete_layers(),
            device.layers.len(),
            device
                .failure
                .map(|kind| format!(", failed: {kind}"))
                .unwrap_or_default()
        );
    }
    println!("  command success rate: {:.3}", run.stats.command_success_rate);
    if let Some(fatal) = &run.fatal_error {
        println!("  fatal: {fatal}");
    }
    Ok(())
}
