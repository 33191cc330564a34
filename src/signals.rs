//! Process-wide signal dispatch.
//!
//! Each signal has an ordered list of operations, an exit code and a terminal
//! flag. Signals are dispatched one at a time on the listener thread. Terminal
//! signals start a graceful shutdown on its own thread so that a second
//! terminal signal can still be received and force the exit.
use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use nix::sys::signal::Signal;
use signal_hook::iterator::{Handle, Signals};
use tracing::{debug, error, info, warn};

use crate::{
    constants::{DEFAULT_SIGNAL_EXIT_CODE, SHUTDOWN_ESCALATION_WINDOW},
    error::ServiceError,
};

/// Zero-argument operation bound to a signal.
pub type SignalOp = Arc<dyn Fn() -> Result<(), ServiceError> + Send + Sync>;

/// Terminates the process with the given code.
pub type ExitFn = Arc<dyn Fn(i32) + Send + Sync>;

#[derive(Clone, Default)]
struct SignalBinding {
    operations: Vec<(String, SignalOp)>,
    exit_code: i32,
    terminal: bool,
}

pub struct SignalCoordinator {
    bindings: Mutex<BTreeMap<i32, SignalBinding>>,
    drain: Mutex<Vec<(String, SignalOp)>>,
    escalation: Duration,
    exit: ExitFn,
    shutting_down: AtomicBool,
    exited: AtomicBool,
}

impl Default for SignalCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalCoordinator {
    pub fn new() -> Self {
        Self {
            bindings: Mutex::new(BTreeMap::new()),
            drain: Mutex::new(Vec::new()),
            escalation: SHUTDOWN_ESCALATION_WINDOW,
            exit: Arc::new(|code| std::process::exit(code)),
            shutting_down: AtomicBool::new(false),
            exited: AtomicBool::new(false),
        }
    }

    /// Replaces the function used to leave the process.
    pub fn with_exit<F>(mut self, exit: F) -> Self
    where
        F: Fn(i32) + Send + Sync + 'static,
    {
        self.exit = Arc::new(exit);
        self
    }

    /// Window between the start of a graceful shutdown and the forced exit.
    pub fn with_escalation(mut self, window: Duration) -> Self {
        self.escalation = window;
        self
    }

    /// Appends an operation to the list bound to `signal`.
    pub fn bind<F>(&self, signal: Signal, name: &str, op: F)
    where
        F: Fn() -> Result<(), ServiceError> + Send + Sync + 'static,
    {
        let mut bindings = self
            .bindings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let binding = bindings.entry(signal as i32).or_insert_with(|| SignalBinding {
            exit_code: DEFAULT_SIGNAL_EXIT_CODE,
            ..SignalBinding::default()
        });
        binding.operations.push((name.to_string(), Arc::new(op)));
    }

    /// Marks `signal` as terminal: after its operations run, a graceful
    /// shutdown starts and the process exits with `exit_code`.
    pub fn terminal(&self, signal: Signal, exit_code: i32) {
        let mut bindings = self
            .bindings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let binding = bindings.entry(signal as i32).or_default();
        binding.terminal = true;
        binding.exit_code = exit_code;
    }

    /// Registers an operation run by the graceful shutdown, in order.
    pub fn on_drain<F>(&self, name: &str, op: F)
    where
        F: Fn() -> Result<(), ServiceError> + Send + Sync + 'static,
    {
        self.drain
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((name.to_string(), Arc::new(op)));
    }

    /// Signals that have at least one binding.
    pub fn bound_signals(&self) -> Vec<Signal> {
        self.bindings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .filter_map(|raw| Signal::try_from(*raw).ok())
            .collect()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Runs the operations bound to `signal` in registration order and returns
    /// how many failed. A failure never stops the remaining operations.
    pub fn dispatch(self: &Arc<Self>, signal: Signal) -> usize {
        let binding = self
            .bindings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(signal as i32))
            .cloned();
        let Some(binding) = binding else {
            debug!("No operations bound to {signal}");
            return 0;
        };

        info!("Received {signal}");
        let failed = run_operations(&signal.to_string(), &binding.operations);

        if binding.terminal {
            self.begin_shutdown(signal, binding.exit_code);
        }
        failed
    }

    fn begin_shutdown(self: &Arc<Self>, signal: Signal, code: i32) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            warn!("Received {signal} during shutdown; exiting immediately");
            self.exit_now(code);
            return;
        }

        info!(
            "Graceful shutdown started by {signal}; forcing exit in {:?}",
            self.escalation
        );

        let drain = self
            .drain
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let coordinator = Arc::clone(self);
        let drained = thread::Builder::new()
            .name("shutdown".into())
            .spawn(move || {
                run_operations("shutdown", &drain);
                info!("Graceful shutdown complete");
                coordinator.exit_now(code);
            });
        if let Err(err) = drained {
            error!("Failed to start graceful shutdown: {err}");
            self.exit_now(code);
            return;
        }

        let coordinator = Arc::clone(self);
        let window = self.escalation;
        let timer = thread::Builder::new()
            .name("shutdown-timer".into())
            .spawn(move || {
                thread::sleep(window);
                if !coordinator.exited.load(Ordering::SeqCst) {
                    warn!("Graceful shutdown exceeded {window:?}; forcing exit");
                    coordinator.exit_now(code);
                }
            });
        if let Err(err) = timer {
            warn!("Failed to start shutdown escalation timer: {err}");
        }
    }

    fn exit_now(&self, code: i32) {
        if !self.exited.swap(true, Ordering::SeqCst) {
            (self.exit)(code);
        }
    }

    /// Installs OS handlers for every bound signal and dispatches them on a
    /// dedicated thread, in arrival order.
    pub fn listen(self: &Arc<Self>) -> Result<SignalListener, ServiceError> {
        let raw: Vec<i32> = self
            .bound_signals()
            .into_iter()
            .map(|signal| signal as i32)
            .collect();
        let mut signals = Signals::new(&raw).map_err(ServiceError::SignalSetupError)?;
        let handle = signals.handle();

        let coordinator = Arc::clone(self);
        let join = thread::Builder::new()
            .name("signals".into())
            .spawn(move || {
                for raw in signals.forever() {
                    match Signal::try_from(raw) {
                        Ok(signal) => {
                            coordinator.dispatch(signal);
                        }
                        Err(err) => warn!("Ignoring unknown signal {raw}: {err}"),
                    }
                }
                debug!("Signal listener stopped");
            })
            .map_err(|source| ServiceError::ServiceStartError {
                service: "signal-listener".into(),
                source,
            })?;

        Ok(SignalListener {
            handle,
            join: Some(join),
        })
    }
}

fn run_operations(scope: &str, operations: &[(String, SignalOp)]) -> usize {
    let mut failed = 0;
    for (name, op) in operations {
        match op() {
            Ok(()) => debug!("Operation '{name}' for {scope} completed"),
            Err(err) => {
                error!("Operation '{name}' for {scope} failed: {err}");
                failed += 1;
            }
        }
    }
    failed
}

/// Running signal listener. Dropping it uninstalls the dispatch loop.
pub struct SignalListener {
    handle: Handle,
    join: Option<thread::JoinHandle<()>>,
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
