// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use slog::{info, o, warn, Drain, Level, Logger};
use truenas_client::api::PowerAction;
use truenas_client::{Client, Gateway, TrueNasApi, DEFAULT_TIMEOUT};
use truenas_config_toml::Config;
use truenas_vm::{
    DeviceReconciler, Provisioner, ReconcileOutcome, ReconcileReport,
    StatusReader, TransitionEngine, Warning,
};

#[derive(Debug, Parser)]
#[clap(about, version)]
/// A CLI tool to manage VMs on a TrueNAS Scale host
struct Opt {
    /// TOML configuration file
    #[clap(short, long, action)]
    config: Option<PathBuf>,

    /// TrueNAS base URL, e.g. https://nas.example.com
    #[clap(short, long, env = "TRUENAS_URL", action)]
    url: Option<String>,

    /// TrueNAS API key
    #[clap(long, env = "TRUENAS_API_KEY", hide_env_values = true, action)]
    api_key: Option<String>,

    /// Enable debugging
    #[clap(short, long, action)]
    debug: bool,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the full record of a VM
    Get {
        #[clap(action)]
        vm: u64,
    },

    /// Print the current power state of a VM
    State {
        #[clap(action)]
        vm: u64,
    },

    /// Drive a VM to a power state (RUNNING, STOPPED or SUSPENDED)
    Reconcile {
        #[clap(action)]
        vm: u64,

        #[clap(action)]
        desired: String,
    },

    /// Issue a single power operation, without waiting for it to take effect
    Power {
        #[clap(action)]
        vm: u64,

        /// start, stop, poweroff, suspend, resume or restart
        #[clap(action)]
        action: PowerAction,
    },

    /// Attach the devices declared in the config file
    Attach {
        /// VM to attach to, instead of the config file's [vm].id
        #[clap(long, action)]
        vm: Option<u64>,
    },

    /// Attach the declared devices, then reconcile the declared power state
    Apply,

    /// Manage a single device by ID
    Device {
        #[clap(subcommand)]
        cmd: DeviceCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DeviceCommand {
    /// Print a device record
    Get {
        #[clap(action)]
        id: u64,
    },

    /// Remove a device from its VM
    Delete {
        #[clap(action)]
        id: u64,
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
    match &opt.config {
        Some(path) => truenas_config_toml::parse(path).with_context(|| {
            anyhow!("failed to load config from {}", path.display())
        }),
        None => Ok(Config::default()),
    }
}

/// Flags and environment take precedence over the config file.
fn create_client(
    opt: &Opt,
    config: &Config,
    log: &Logger,
) -> anyhow::Result<Client> {
    let url = opt
        .url
        .clone()
        .or_else(|| config.connection.base_url.clone())
        .ok_or_else(|| {
            anyhow!(
                "no TrueNAS URL: pass --url, set TRUENAS_URL, \
                 or set connection.base_url"
            )
        })?;
    let api_key = match &opt.api_key {
        Some(key) => key.clone(),
        None => config.connection.resolve_api_key()?.ok_or_else(|| {
            anyhow!(
                "no API key: pass --api-key, set TRUENAS_API_KEY, \
                 or set connection.api_key"
            )
        })?,
    };
    let timeout = config.connection.timeout().unwrap_or(DEFAULT_TIMEOUT);

    Client::with_timeout(&url, &api_key, timeout, log.new(o!()))
        .context("failed to create TrueNAS client")
}

fn configured_vm(config: &Config) -> anyhow::Result<u64> {
    config
        .vm
        .as_ref()
        .map(|vm| vm.id)
        .ok_or_else(|| anyhow!("config file has no [vm] table"))
}

fn create_engine(
    gateway: Arc<dyn Gateway>,
    config: &Config,
    log: &Logger,
) -> anyhow::Result<TransitionEngine> {
    let policy = config.transition.policy()?;
    Ok(TransitionEngine::new(gateway, log.clone()).with_policy(policy))
}

fn print_warnings(log: &Logger, warnings: &[Warning]) {
    for warning in warnings {
        warn!(log, "{}", warning);
    }
}

fn print_report(log: &Logger, vm: u64, report: &ReconcileReport) {
    print_warnings(log, &report.warnings);
    match &report.outcome {
        ReconcileOutcome::AlreadyInState => {
            println!("VM {} already in desired state", vm)
        }
        ReconcileOutcome::Converged { attempts } => {
            println!("VM {} reached desired state (attempt {})", vm, attempts)
        }
        ReconcileOutcome::Abandoned => {
            println!("VM {} left unchanged", vm)
        }
        ReconcileOutcome::Exhausted { attempts, .. } => {
            println!("VM {} did not converge after {} attempts", vm, attempts)
        }
    }
}

async fn run(
    cmd: Command,
    config: &Config,
    gateway: Arc<dyn Gateway>,
    log: &Logger,
) -> anyhow::Result<()> {
    match cmd {
        Command::Get { vm } => {
            let record = gateway
                .vm_get(vm)
                .await
                .with_context(|| anyhow!("failed to get VM {}", vm))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::State { vm } => {
            let state = StatusReader::new(gateway)
                .current_state(vm)
                .await
                .with_context(|| anyhow!("failed to read state of VM {}", vm))?;
            println!("{}", state);
        }
        Command::Reconcile { vm, desired } => {
            let engine = create_engine(gateway, config, log)?;
            let report = engine.reconcile(vm, &desired).await?;
            print_report(log, vm, &report);
        }
        Command::Power { vm, action } => {
            gateway
                .vm_power(vm, action)
                .await
                .with_context(|| anyhow!("failed to {} VM {}", action, vm))?;
            info!(log, "power operation accepted";
                  "vm_id" => vm, "action" => %action);
        }
        Command::Attach { vm } => {
            let vm = match vm {
                Some(vm) => vm,
                None => configured_vm(config)?,
            };
            let attached = DeviceReconciler::new(gateway, log.clone())
                .attach_devices(vm, &config.devices)
                .await?;
            for device in attached {
                println!(
                    "{} device {} (order {})",
                    device.dtype, device.id, device.order
                );
            }
        }
        Command::Apply => {
            let vm = configured_vm(config)?;
            let desired = config
                .vm
                .as_ref()
                .map(|vm| vm.desired_state())
                .transpose()?
                .unwrap_or(truenas_vm::DEFAULT_DESIRED_STATE);
            let engine = create_engine(gateway.clone(), config, log)?;
            let report = Provisioner::with_engine(gateway, engine, log.clone())
                .provision(vm, &config.devices, &desired.to_string())
                .await?;
            for device in &report.devices {
                println!(
                    "{} device {} (order {})",
                    device.dtype, device.id, device.order
                );
            }
            print_report(log, vm, &report.reconcile);
        }
        Command::Device { cmd: DeviceCommand::Get { id } } => {
            let record = DeviceReconciler::new(gateway, log.clone())
                .get_device(id)
                .await
                .with_context(|| anyhow!("failed to get device {}", id))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Device { cmd: DeviceCommand::Delete { id } } => {
            DeviceReconciler::new(gateway, log.clone())
                .delete_device(id)
                .await
                .with_context(|| anyhow!("failed to delete device {}", id))?;
            info!(log, "device deleted"; "device_id" => id);
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    let log = create_logger(&opt);

    let config = load_config(&opt)?;
    let gateway: Arc<dyn Gateway> =
        Arc::new(create_client(&opt, &config, &log)?);

    // Dropping the in-flight operation on Ctrl-C leaves the VM wherever it
    // got to; nothing is rolled back.
    tokio::select! {
        res = run(opt.cmd, &config, gateway, &log) => res,
        _ = tokio::signal::ctrl_c() => {
            warn!(log, "interrupted, VM left in its current state");
            Err(anyhow!("interrupted"))
        }
    }
}
