//! The listener loop: one dedicated thread owning every device handle.
//!
//! The thread runs a current-thread tokio runtime driving a `LocalSet`, so
//! seize callbacks, notification handling and capture all happen on the same
//! thread without locks. Startup is a two-step handshake:
//!
//! 1. [`ListenerLoop::wait_initialized`] blocks until the thread has built its
//!    loop and published a [`LoopHandle`] for posting commands.
//! 2. [`ListenerLoop::run`] lets the thread enter the loop. Commands posted
//!    before that are queued and handled in order once it runs.
//!
//! [`ListenerLoop::stop`] asks the loop to finish, joins the thread, and
//! leaves every device released.

use std::sync::Arc;
use std::thread::JoinHandle;

use keybridge_hid::HidPlatform;
use keybridge_types::{DeviceFilter, IdentityHash};
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;
use tracing::{debug, info, warn};

use crate::channel::EventWriter;
use crate::error::EngineError;
use crate::manager::CaptureManager;
use crate::registry::{ExclusionPolicy, SharedRegistered};
use crate::watcher::Watcher;

const THREAD_NAME: &str = "keybridge-listener";

enum Command {
    /// Capture what the registered set now holds and watch `scope`.
    Register(DeviceFilter),
    OpenDevices(oneshot::Sender<Vec<IdentityHash>>),
    Stop,
}

/// Settings the loop needs beyond the platform and the channel.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub exclusion: ExclusionPolicy,
    pub adopt_new_devices: bool,
}

/// Posts commands into a listener loop from any thread.
#[derive(Clone)]
pub struct LoopHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl LoopHandle {
    /// Ask the loop to capture every present registered device and watch
    /// `scope` for arrivals.
    pub fn register(&self, scope: DeviceFilter) -> Result<(), EngineError> {
        self.tx
            .send(Command::Register(scope))
            .map_err(|_| EngineError::ListenerStopped)
    }

    /// Identities currently open on the loop. Blocks until the loop answers,
    /// so it must not be called before [`ListenerLoop::run`].
    pub fn open_devices(&self) -> Result<Vec<IdentityHash>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::OpenDevices(reply_tx))
            .map_err(|_| EngineError::ListenerStopped)?;
        reply_rx.blocking_recv().map_err(|_| EngineError::ListenerStopped)
    }

    fn stop(&self) {
        let _ = self.tx.send(Command::Stop);
    }
}

pub struct ListenerLoop {
    init_rx: Option<oneshot::Receiver<Result<LoopHandle, String>>>,
    run_tx: Option<oneshot::Sender<()>>,
    handle: Option<LoopHandle>,
    thread: Option<JoinHandle<()>>,
}

impl ListenerLoop {
    /// Start the listener thread. It initializes, then waits for
    /// [`ListenerLoop::run`].
    pub fn spawn<P: HidPlatform>(
        platform: Arc<P>,
        registered: SharedRegistered,
        writer: EventWriter,
        options: ListenerOptions,
    ) -> Result<Self, EngineError> {
        let (init_tx, init_rx) = oneshot::channel();
        let (run_tx, run_rx) = oneshot::channel();
        let thread = std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || listener_main(platform, registered, writer, options, init_tx, run_rx))
            .map_err(|e| EngineError::ListenerStart(e.to_string()))?;
        Ok(Self {
            init_rx: Some(init_rx),
            run_tx: Some(run_tx),
            handle: None,
            thread: Some(thread),
        })
    }

    /// Block until the loop is initialized and return its handle.
    pub fn wait_initialized(&mut self) -> Result<LoopHandle, EngineError> {
        if let Some(handle) = &self.handle {
            return Ok(handle.clone());
        }
        let init_rx = self.init_rx.take().ok_or(EngineError::ListenerStopped)?;
        let handle = init_rx
            .blocking_recv()
            .map_err(|_| EngineError::ListenerStart("listener thread exited".into()))?
            .map_err(EngineError::ListenerStart)?;
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    /// Let the loop start dispatching.
    pub fn run(&mut self) -> Result<(), EngineError> {
        let run_tx = self.run_tx.take().ok_or(EngineError::ListenerStopped)?;
        run_tx.send(()).map_err(|()| EngineError::ListenerStopped)
    }

    pub fn handle(&self) -> Option<&LoopHandle> {
        self.handle.as_ref()
    }

    /// Stop the loop and join its thread. In-flight callbacks complete
    /// first. Safe to call at any point of the handshake.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop();
        }
        // A thread still waiting for the run signal exits when it is dropped.
        self.run_tx.take();
        self.init_rx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("listener thread panicked");
            }
        }
    }
}

impl Drop for ListenerLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn listener_main<P: HidPlatform>(
    platform: Arc<P>,
    registered: SharedRegistered,
    writer: EventWriter,
    options: ListenerOptions,
    init_tx: oneshot::Sender<Result<LoopHandle, String>>,
    run_rx: oneshot::Receiver<()>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = init_tx.send(Err(e.to_string()));
            return;
        }
    };

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    if init_tx.send(Ok(LoopHandle { tx: cmd_tx })).is_err() {
        return;
    }
    debug!("listener initialized");

    if run_rx.blocking_recv().is_err() {
        debug!("listener stopped before running");
        return;
    }

    let local = LocalSet::new();
    local.block_on(&runtime, run_loop(platform, registered, writer, options, cmd_rx));
    // Dropping the set drops the device tasks and the last channel writers.
    drop(local);
    info!("listener loop stopped");
}

async fn run_loop<P: HidPlatform>(
    platform: Arc<P>,
    registered: SharedRegistered,
    writer: EventWriter,
    options: ListenerOptions,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let (note_tx, mut notes) = mpsc::unbounded_channel();
    let mut manager = CaptureManager::new(Arc::clone(&platform), writer, registered);
    let mut watcher = Watcher::new(platform, note_tx, options.exclusion, options.adopt_new_devices);
    info!("listener loop running");

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Register(scope)) => {
                    let captured = manager.sweep();
                    watcher.arm(&scope);
                    for hash in captured {
                        watcher.track(hash);
                    }
                }
                Some(Command::OpenDevices(reply)) => {
                    let _ = reply.send(manager.open_identities());
                }
                Some(Command::Stop) | None => break,
            },
            Some(notification) = notes.recv() => watcher.handle(notification, &mut manager),
        }
    }

    watcher.disarm();
    let summary = manager.release_all();
    info!(released = summary.released, failed = summary.failed, "released devices");
}
