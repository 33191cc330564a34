use nix::{errno::Errno, sys::signal, unistd::Pid};
use std::{error::Error, os::unix::io::IntoRawFd, path::PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use toolboxd::{
    adapter::ServiceStatus,
    cli::{Cli, Commands, parse_args},
    config::{default_config_path, load_config},
    ipc::{self, ControlCommand, ControlError, ControlResponse},
    runtime::RuntimeLayout,
    supervisor::{Supervisor, resolve_layout},
    worker,
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    if let (Some(service), Some(subconfig)) = (args.service_type, args.subconfig.as_deref()) {
        worker::run(service, subconfig, args.config.clone())?;
        return Ok(());
    }

    let Some(command) = args.command.as_ref() else {
        return Err("no command given; see --help".into());
    };

    match command {
        Commands::Run { daemonize } => {
            let config_path = resolve_config_path(&args)?;
            if supervisor_running(&layout_for(&args)) {
                warn!("toolboxd supervisor already running; aborting duplicate start");
                return Ok(());
            }
            let state_dir = args
                .state_dir
                .as_deref()
                .map(std::path::absolute)
                .transpose()?;
            if *daemonize {
                daemonize_toolboxd()?;
            }
            info!("Starting toolboxd supervisor with config {:?}", config_path);
            let mut supervisor = Supervisor::new(config_path, state_dir)?;
            if let Err(err) = supervisor.run() {
                error!("Supervisor exited with error: {err}");
                return Err(err.into());
            }
        }
        Commands::Status { json } => {
            let layout = layout_for(&args);
            match send_control_command(&layout, ControlCommand::Status)? {
                ControlResponse::Status(entries) if *json => {
                    println!("{}", serde_json::to_string_pretty(&entries)?);
                }
                ControlResponse::Status(entries) => print_status(&entries),
                other => warn!("Unexpected status response: {other:?}"),
            }
        }
        Commands::Shutdown => {
            let layout = layout_for(&args);
            print_response(send_control_command(&layout, ControlCommand::Shutdown)?);
        }
        other => {
            let Some((action, target)) = other.action() else {
                return Ok(());
            };
            let layout = layout_for(&args);
            let response =
                send_control_command(&layout, ControlCommand::for_action(action, target))?;
            print_response(response);
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

fn resolve_config_path(args: &Cli) -> Result<PathBuf, Box<dyn Error>> {
    let candidate = args.config.clone().unwrap_or_else(default_config_path);
    if candidate.is_absolute() {
        return Ok(candidate);
    }

    let resolved = std::env::current_dir()?.join(&candidate);
    Ok(resolved.canonicalize().unwrap_or(resolved))
}

/// Layout of the supervisor this invocation talks to. The config file is
/// consulted for `state_dir` only when no override is given.
fn layout_for(args: &Cli) -> RuntimeLayout {
    if let Some(state_dir) = args.state_dir.as_deref() {
        return RuntimeLayout::rooted_at(state_dir);
    }
    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let config_state_dir = load_config(Some(config_path.to_string_lossy().as_ref()))
        .ok()
        .and_then(|config| config.state_dir);
    resolve_layout(None, config_state_dir.as_deref())
}

fn supervisor_running(layout: &RuntimeLayout) -> bool {
    match ipc::read_supervisor_pid(layout) {
        Ok(Some(pid)) => match signal::kill(Pid::from_raw(pid as i32), None) {
            Ok(_) => true,
            Err(Errno::ESRCH) => {
                ipc::cleanup_runtime(layout);
                false
            }
            Err(err) => {
                warn!("Failed to query supervisor pid {pid}: {err}");
                false
            }
        },
        Ok(None) | Err(_) => false,
    }
}

fn send_control_command(
    layout: &RuntimeLayout,
    command: ControlCommand,
) -> Result<ControlResponse, Box<dyn Error>> {
    match ipc::send_command(layout, &command) {
        Ok(response) => Ok(response),
        Err(ControlError::NotAvailable) => {
            ipc::cleanup_runtime(layout);
            Err("toolboxd supervisor is not running".into())
        }
        Err(err) => Err(err.into()),
    }
}

fn print_response(response: ControlResponse) {
    match response {
        ControlResponse::Message(message) => println!("{message}"),
        ControlResponse::Ok => {}
        ControlResponse::Status(entries) => print_status(&entries),
        ControlResponse::Error(message) => eprintln!("{message}"),
    }
}

fn print_status(entries: &[ServiceStatus]) {
    println!("{:<20} {:>8}  STATE", "SERVICE", "PID");
    for entry in entries {
        let pid = entry
            .pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".into());
        println!("{:<20} {:>8}  {}", entry.key.to_string(), pid, entry.state);
    }
}

fn daemonize_toolboxd() -> std::io::Result<()> {
    if unsafe { libc::fork() } > 0 {
        std::process::exit(0);
    }

    unsafe {
        libc::setsid();
    }

    if unsafe { libc::fork() } > 0 {
        std::process::exit(0);
    }

    std::env::set_current_dir("/")?;
    let devnull = std::fs::File::open("/dev/null")?;
    let fd = devnull.into_raw_fd();
    unsafe {
        let _ = libc::dup2(fd, libc::STDIN_FILENO);
        let _ = libc::dup2(fd, libc::STDOUT_FILENO);
        let _ = libc::dup2(fd, libc::STDERR_FILENO);
        libc::close(fd);
    }

    Ok(())
}
