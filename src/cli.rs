//! Command line interface
//!
//! Thin adapter over the library: builds the backends, registry, selection
//! state, and orchestrator, then maps each subcommand onto one workflow.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};

use itarget_app::{
    JsonFileStore, Progress, TargetCommands, TargetRegistry, TargetSelection,
};
use itarget_backend::{CancelToken, DeviceBackend, SimulatorBackend, ToolAvailability};
use itarget_core::prelude::*;
use itarget_core::{LaunchParams, Target};

use crate::picker::TerminalPicker;

/// Manage and debug-launch apps on iOS simulators and devices
#[derive(Parser, Debug)]
#[command(name = "itarget", version)]
pub struct Cli {
    /// Target udid; resolves and selects this target instead of the stored
    /// selection
    #[arg(long, global = true, value_name = "UDID")]
    pub udid: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug)]
pub struct LaunchOpts {
    /// Argument passed to the app (repeatable)
    #[arg(long = "arg", value_name = "ARG", allow_hyphen_values = true)]
    args: Vec<String>,

    /// Environment variable for the app as KEY=VALUE (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Start suspended, waiting for a debugger to attach
    #[arg(long)]
    wait_for_debugger: bool,

    /// Redirect app stdout to this path (simulator targets)
    #[arg(long, value_name = "PATH")]
    stdout_path: Option<PathBuf>,

    /// Redirect app stderr to this path (simulator targets)
    #[arg(long, value_name = "PATH")]
    stderr_path: Option<PathBuf>,
}

impl LaunchOpts {
    fn to_params(&self) -> LaunchParams {
        LaunchParams {
            args: self.args.clone(),
            env: self.env.iter().cloned().collect::<HashMap<_, _>>(),
            stdout_path: self.stdout_path.clone(),
            stderr_path: self.stderr_path.clone(),
            wait_for_debugger: self.wait_for_debugger,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List all available targets
    List {
        /// Print the target list as JSON
        #[arg(long)]
        json: bool,
    },

    /// Interactively pick the selected target
    Pick,

    /// Show the currently selected target
    Selected,

    /// Boot the simulator
    Boot,

    /// Shut the simulator down
    Shutdown,

    /// Install an app bundle
    Install {
        /// Path to the .app bundle
        bundle: PathBuf,
    },

    /// Launch an installed app
    Launch {
        /// Bundle identifier of the app
        bundle_id: String,

        /// Local .app bundle path; required for device targets
        #[arg(long, value_name = "PATH")]
        bundle: Option<PathBuf>,

        #[command(flatten)]
        opts: LaunchOpts,
    },

    /// Install an app bundle and launch it
    InstallLaunch {
        /// Path to the .app bundle
        bundle: PathBuf,

        /// Bundle identifier of the app
        bundle_id: String,

        #[command(flatten)]
        opts: LaunchOpts,
    },

    /// Print the pid of a running app
    Pid {
        /// Bundle identifier of the app
        bundle_id: String,
    },

    /// Print the path of an installed app on a device
    AppPath {
        /// Bundle identifier of the app
        bundle_id: String,
    },

    /// Start a debugserver on a device and keep it alive until interrupted
    Debugserver,
}

fn parse_env_pair(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("'{}' is not a KEY=VALUE pair", raw))
}

type Selection = TargetSelection<JsonFileStore, TerminalPicker>;
type Commands = TargetCommands<JsonFileStore, TerminalPicker>;

/// Device backend configured from the environment. The companion relay
/// adapter exports the socket path; the override library ships next to the
/// relay and is pointed at explicitly.
fn build_device_backend() -> DeviceBackend {
    let mut backend = match std::env::var_os("ITARGET_IOS_DEPLOY") {
        Some(tool) => DeviceBackend::with_tool(tool),
        None => DeviceBackend::new(),
    };
    if let Some(dylib) = std::env::var_os("ITARGET_USBMUXD_DYLIB") {
        backend = backend.override_dylib(dylib);
    }
    if let Ok(socket) = std::env::var("ITARGET_COMPANION_SOCKET") {
        backend.set_companion_socket_path(Some(socket));
    }
    backend
}

/// A cancel token wired to ctrl-c, for the cancellable operations.
fn ctrl_c_token() -> CancelToken {
    let token = CancelToken::new();
    let signalled = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signalled.cancel();
        }
    });
    token
}

fn print_step(progress: Progress) {
    if let Progress::Step { message } = progress {
        eprintln!("==> {}", message);
    }
}

fn print_target(target: &Target) {
    println!(
        "{:<10} {:<28} {:<40} {}",
        target.kind(),
        target.name(),
        target.udid(),
        target.runtime(),
    );
}

pub async fn run(cli: Cli) -> Result<()> {
    let tools = ToolAvailability::check().await;
    if let Some(message) = tools.simulator_unavailable_message() {
        warn!("{}", message);
    }
    if let Some(message) = tools.device_unavailable_message() {
        warn!("{}", message);
    }

    let simulators = SimulatorBackend::new();
    let devices = build_device_backend();

    let registry = Arc::new(TargetRegistry::new(simulators.clone(), devices.clone()));
    let selection: Arc<Selection> = Arc::new(TargetSelection::new(
        Arc::clone(&registry),
        JsonFileStore::new(),
        TerminalPicker,
    ));
    let commands: Commands =
        TargetCommands::new(simulators.clone(), devices.clone(), Arc::clone(&selection));

    // --udid resolves through the registry and adopts the selection; without
    // it the orchestrator falls back to the stored selection or a pick.
    let explicit: Option<Target> = match &cli.udid {
        Some(udid) => Some(
            selection
                .get_from_udid(udid)
                .await?
                .ok_or_else(|| Error::target_not_found(udid))?,
        ),
        None => None,
    };

    match cli.command {
        Command::List { json } => {
            let targets = registry.list_targets().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&targets)?);
            } else {
                for target in &targets {
                    print_target(target);
                }
            }
        }

        Command::Pick => match selection.pick().await? {
            Some(target) => print_target(&target),
            None => eprintln!("No target selected."),
        },

        Command::Selected => match selection.selected() {
            Some(target) => print_target(&target),
            None => eprintln!("No target selected."),
        },

        Command::Boot => {
            let target = resolve(explicit, &selection).await?;
            match target {
                Target::Simulator(simulator) => simulators.boot(&simulator).await?,
                Target::Device(device) => {
                    return Err(Error::target_mismatch("Simulator", device.udid))
                }
            }
        }

        Command::Shutdown => {
            let target = resolve(explicit, &selection).await?;
            match target {
                Target::Simulator(simulator) => simulators.shutdown(&simulator).await?,
                Target::Device(device) => {
                    return Err(Error::target_mismatch("Simulator", device.udid))
                }
            }
        }

        Command::Install { bundle } => {
            let target = resolve(explicit, &selection).await?;
            match target {
                Target::Simulator(_) => {
                    commands
                        .simulator_install(Some(target), &bundle, print_step)
                        .await?;
                }
                Target::Device(_) => {
                    let path = install_on_device(&commands, target, &bundle).await?;
                    println!("{}", path);
                }
            }
        }

        Command::Launch {
            bundle_id,
            bundle,
            opts,
        } => {
            let target = resolve(explicit, &selection).await?;
            let params = opts.to_params();
            let pid = match &target {
                Target::Simulator(_) => {
                    commands
                        .simulator_launch(Some(target), &bundle_id, &params, print_step)
                        .await?
                }
                Target::Device(_) => {
                    let bundle = bundle.ok_or_else(|| {
                        Error::invalid_arguments("--bundle <PATH> is required to launch on a device")
                    })?;
                    commands
                        .device_launch(Some(target), &bundle, &params)
                        .await?
                }
            };
            println!("{}", pid);
        }

        Command::InstallLaunch {
            bundle,
            bundle_id,
            opts,
        } => {
            let target = resolve(explicit, &selection).await?;
            let params = opts.to_params();
            let pid = match &target {
                Target::Simulator(_) => {
                    commands
                        .simulator_install_and_launch(
                            Some(target),
                            &bundle,
                            &bundle_id,
                            &params,
                            print_step,
                        )
                        .await?
                }
                Target::Device(_) => {
                    install_on_device(&commands, target.clone(), &bundle).await?;
                    commands
                        .device_launch(Some(target), &bundle, &params)
                        .await?
                }
            };
            println!("{}", pid);
        }

        Command::Pid { bundle_id } => {
            let target = resolve(explicit, &selection).await?;
            let pid = match &target {
                Target::Simulator(_) => {
                    commands.simulator_get_pid(Some(target), &bundle_id).await?
                }
                Target::Device(_) => commands.device_get_pid(Some(target), &bundle_id).await?,
            };
            println!("{}", pid);
        }

        Command::AppPath { bundle_id } => {
            let target = resolve(explicit, &selection).await?;
            match commands.device_app_path(Some(target), &bundle_id).await? {
                Some(path) => println!("{}", path),
                None => eprintln!("{} is not installed.", bundle_id),
            }
        }

        Command::Debugserver => {
            let target = resolve(explicit, &selection).await?;
            let cancel = ctrl_c_token();
            let port = commands.device_debugserver(Some(target), &cancel).await?;
            println!("{}", port);

            eprintln!("Debugserver listening on port {}. Press ctrl-c to stop.", port);
            let _ = tokio::signal::ctrl_c().await;
            commands.debugserver_cleanup(port);
        }
    }

    Ok(())
}

async fn resolve(explicit: Option<Target>, selection: &Arc<Selection>) -> Result<Target> {
    match explicit {
        Some(target) => Ok(target),
        None => selection.get_or_pick().await,
    }
}

async fn install_on_device(
    commands: &Commands,
    target: Target,
    bundle: &std::path::Path,
) -> Result<String> {
    let cancel = ctrl_c_token();
    let mut percent = 0i64;
    commands
        .device_install(Some(target), bundle, &cancel, |progress| {
            if let Progress::Install { increment, message } = progress {
                percent += increment;
                if let Some(message) = message {
                    eprintln!("[{:>3}%] {}", percent, message);
                }
            }
        })
        .await
}
