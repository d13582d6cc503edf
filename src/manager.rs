//! Controller orchestration.
//!
//! The [Manager] owns every controller server: it claims adapters, spawns
//! one server thread per controller, and routes API calls to the right
//! task queue. Commands arrive over a channel and are dispatched as they
//! come in; the [ManagerClient] is the cheap-to-clone API surface the CLI
//! and library callers use.

use std::collections::HashMap;
use std::error::Error;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::bluetooth::l2cap::{AddrParseError, BdAddr};
use crate::bluetooth::{self, BluetoothError};
use crate::constants::{DEFAULT_FREQUENCY, SWITCH_ALIAS};
use crate::controller::command::ControllerCommand;
use crate::controller::input::{Button, InputPacket, Stick};
use crate::controller::server::{ControllerServer, ServerOptions};
use crate::controller::state::{ControllerState, ControllerStatus, StateHandle, StateMap};
use crate::controller::ControllerKind;

/// Blocking API calls poll shared state at one Pro Controller cycle
const POLL_INTERVAL: Duration = Duration::from_millis(1000 / 120);
/// Controller creation settles on a slower poll
const CREATE_POLL_INTERVAL: Duration = Duration::from_millis(1000 / 30);
/// Maximum duration to wait for the manager to answer a command. Hitting
/// this typically indicates a deadlock somewhere in the code.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("specified adapter is unavailable: {0}")]
    AdapterUnavailable(String),
    #[error("specified adapter is in use: {0}")]
    AdapterInUse(String),
    #[error("no bluetooth adapters are available")]
    NoAdapterAvailable,
    #[error("controller {0} does not exist")]
    UnknownController(u32),
    #[error("controller crashed: {0}")]
    ControllerCrashed(String),
    #[error("manager is no longer running")]
    ManagerStopped,
    #[error("timed out waiting for the manager")]
    Timeout,
    #[error(transparent)]
    Bluetooth(#[from] BluetoothError),
    #[error(transparent)]
    InvalidAddress(#[from] AddrParseError),
    #[error("failed to start controller thread: {0}")]
    SpawnFailed(io::Error),
}

/// Parameters for [ManagerClient::create_controller].
#[derive(Debug, Clone)]
pub struct CreateController {
    pub kind: ControllerKind,
    /// D-Bus path of the adapter to claim; first free adapter when None
    pub adapter_path: Option<String>,
    pub colour_body: Option<[u8; 3]>,
    pub colour_buttons: Option<[u8; 3]>,
    /// Previously paired Switch addresses to reconnect to
    pub reconnect: Vec<BdAddr>,
    pub frequency: u32,
}

impl CreateController {
    pub fn new(kind: ControllerKind) -> Self {
        Self {
            kind,
            adapter_path: None,
            colour_body: None,
            colour_buttons: None,
            reconnect: Vec::new(),
            frequency: DEFAULT_FREQUENCY,
        }
    }
}

/// [ManagerCommand]s define all the ways to interact with the [Manager]
/// over its channel.
#[derive(Debug)]
pub enum ManagerCommand {
    CreateController {
        request: CreateController,
        responder: mpsc::Sender<Result<u32, ManagerError>>,
    },
    RemoveController {
        index: u32,
        responder: mpsc::Sender<Result<(), ManagerError>>,
    },
    QueueMacro {
        index: u32,
        text: String,
        id: String,
        responder: mpsc::Sender<Result<(), ManagerError>>,
    },
    StopMacro {
        index: u32,
        id: String,
        responder: mpsc::Sender<Result<(), ManagerError>>,
    },
    ClearMacros {
        index: u32,
        responder: mpsc::Sender<Result<(), ManagerError>>,
    },
    ClearAllMacros,
}

/// Handle on one running controller server thread.
struct ControllerHandle {
    tasks: mpsc::Sender<ControllerCommand>,
    shutdown: Arc<AtomicBool>,
    adapter_path: String,
}

/// Creates a connected manager/client pair. Spawn [Manager::run] and hand
/// the [ManagerClient] to whoever drives controllers.
pub fn new(conn: zbus::Connection) -> (Manager, ManagerClient) {
    let (tx, rx) = mpsc::channel(64);
    let state = StateMap::new();
    let client = ManagerClient {
        tx,
        state: state.clone(),
        dbus: conn.clone(),
    };
    let manager = Manager {
        dbus: conn,
        rx,
        state,
        bluetooth_lock: Arc::new(Mutex::new(())),
        controllers: HashMap::new(),
        adapters_in_use: HashMap::new(),
        controller_counter: 0,
    };
    (manager, client)
}

/// Owns controller servers and processes [ManagerCommand]s.
pub struct Manager {
    dbus: zbus::Connection,
    rx: mpsc::Receiver<ManagerCommand>,
    state: StateMap,
    /// Serializes adapter setup and pairing across all servers
    bluetooth_lock: Arc<Mutex<()>>,
    controllers: HashMap<u32, ControllerHandle>,
    /// adapter path -> controller index
    adapters_in_use: HashMap<String, u32>,
    /// Next controller index; strictly increasing, never reused
    controller_counter: u32,
}

impl Manager {
    /// Processes commands until every client handle is dropped.
    pub async fn run(&mut self) -> Result<(), Box<dyn Error>> {
        // The BlueZ input plugin claims the HID PSMs; move it out of the
        // way before the first server tries to bind them.
        let setup = tokio::task::spawn_blocking(|| bluetooth::set_input_plugin_disabled(true));
        if let Err(err) = setup.await? {
            log::warn!("Could not reconfigure bluetoothd (are we root?): {err}");
        }

        while let Some(command) = self.rx.recv().await {
            match command {
                ManagerCommand::CreateController { request, responder } => {
                    let result = self.create_controller(request).await;
                    let _ = responder.try_send(result);
                }
                ManagerCommand::RemoveController { index, responder } => {
                    let _ = responder.try_send(self.remove_controller(index));
                }
                ManagerCommand::QueueMacro {
                    index,
                    text,
                    id,
                    responder,
                } => {
                    let result = self
                        .send_task(index, ControllerCommand::Macro { text, id })
                        .await;
                    let _ = responder.try_send(result);
                }
                ManagerCommand::StopMacro {
                    index,
                    id,
                    responder,
                } => {
                    let result = self
                        .send_task(index, ControllerCommand::StopMacro { id })
                        .await;
                    let _ = responder.try_send(result);
                }
                ManagerCommand::ClearMacros { index, responder } => {
                    let result = self.send_task(index, ControllerCommand::ClearMacros).await;
                    let _ = responder.try_send(result);
                }
                ManagerCommand::ClearAllMacros => {
                    let indices: Vec<u32> = self.controllers.keys().copied().collect();
                    for index in indices {
                        let _ = self.send_task(index, ControllerCommand::ClearMacros).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Frees the adapters of servers that have since crashed.
    fn reap_crashed(&mut self) {
        let crashed: Vec<u32> = self
            .controllers
            .keys()
            .copied()
            .filter(|index| {
                matches!(
                    self.state.get(*index).map(|state| state.status),
                    Some(ControllerStatus::Crashed)
                )
            })
            .collect();
        for index in crashed {
            if let Some(handle) = self.controllers.remove(&index) {
                log::debug!(
                    "Releasing adapter {} of crashed controller {index}",
                    handle.adapter_path
                );
                self.adapters_in_use.remove(&handle.adapter_path);
            }
        }
    }

    async fn create_controller(
        &mut self,
        request: CreateController,
    ) -> Result<u32, ManagerError> {
        self.reap_crashed();

        let known = bluetooth::list_adapters(&self.dbus).await?;
        let adapter_path = match &request.adapter_path {
            Some(path) => {
                if !known.contains(path) {
                    return Err(ManagerError::AdapterUnavailable(path.clone()));
                }
                if self.adapters_in_use.contains_key(path) {
                    return Err(ManagerError::AdapterInUse(path.clone()));
                }
                path.clone()
            }
            None => known
                .into_iter()
                .find(|path| !self.adapters_in_use.contains_key(path))
                .ok_or(ManagerError::NoAdapterAvailable)?,
        };

        let index = self.controller_counter;
        self.controller_counter += 1;

        self.state.insert(
            index,
            ControllerState::new(
                request.kind,
                request.colour_body.unwrap_or([0x82; 3]),
                request.colour_buttons.unwrap_or([0x0F; 3]),
                adapter_path.clone(),
            ),
        );

        let (task_tx, task_rx) = mpsc::channel(32);
        let shutdown = Arc::new(AtomicBool::new(false));
        let options = ServerOptions {
            kind: request.kind,
            adapter_path: adapter_path.clone(),
            colour_body: request.colour_body,
            colour_buttons: request.colour_buttons,
            frequency: request.frequency,
            reconnect: request.reconnect.clone(),
        };
        let state_handle = StateHandle::new(self.state.clone(), index);
        let bluetooth_lock = self.bluetooth_lock.clone();
        let server_shutdown = shutdown.clone();

        log::info!(
            "Creating {} (controller {index}) on {adapter_path}",
            request.kind
        );
        std::thread::Builder::new()
            .name(format!("nxpad-controller-{index}"))
            .spawn(move || {
                let reconnect = options.reconnect.clone();
                match ControllerServer::new(
                    &options,
                    state_handle.clone(),
                    task_rx,
                    bluetooth_lock,
                    server_shutdown,
                ) {
                    Ok(server) => server.run(reconnect),
                    Err(err) => {
                        log::error!("Controller {} failed to initialize: {err}", state_handle.index());
                        state_handle.set_error(err.to_string());
                        state_handle.set_status(ControllerStatus::Crashed);
                    }
                }
            })
            .map_err(ManagerError::SpawnFailed)?;

        self.adapters_in_use.insert(adapter_path.clone(), index);
        self.controllers.insert(
            index,
            ControllerHandle {
                tasks: task_tx,
                shutdown,
                adapter_path,
            },
        );
        Ok(index)
    }

    fn remove_controller(&mut self, index: u32) -> Result<(), ManagerError> {
        if let Some(handle) = self.controllers.remove(&index) {
            handle.shutdown.store(true, Ordering::Relaxed);
            self.adapters_in_use.remove(&handle.adapter_path);
            self.state.set_status(index, ControllerStatus::Removed);
            return Ok(());
        }
        // Crashed-and-reaped controllers can still be removed from view
        if self.state.contains(index) {
            self.state.set_status(index, ControllerStatus::Removed);
            return Ok(());
        }
        Err(ManagerError::UnknownController(index))
    }

    async fn send_task(
        &mut self,
        index: u32,
        command: ControllerCommand,
    ) -> Result<(), ManagerError> {
        let handle = self
            .controllers
            .get(&index)
            .ok_or(ManagerError::UnknownController(index))?;
        handle
            .tasks
            .send(command)
            .await
            .map_err(|_| ManagerError::UnknownController(index))
    }
}

/// A client for driving the [Manager] over its channel.
#[derive(Debug, Clone)]
pub struct ManagerClient {
    tx: mpsc::Sender<ManagerCommand>,
    state: StateMap,
    dbus: zbus::Connection,
}

impl ManagerClient {
    /// Sends a command to the manager, using a timeout to catch deadlocks.
    async fn send(&self, command: ManagerCommand) -> Result<(), ManagerError> {
        use tokio::sync::mpsc::error::SendTimeoutError;
        match self.tx.send_timeout(command, DEFAULT_TIMEOUT).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(command)) => {
                log::error!(
                    "POSSIBLE DEADLOCK: timed out after {DEFAULT_TIMEOUT:?} sending command to manager: {command:?}"
                );
                Err(ManagerError::Timeout)
            }
            Err(SendTimeoutError::Closed(_)) => Err(ManagerError::ManagerStopped),
        }
    }

    /// Waits for a response from the manager, with the same deadlock guard.
    async fn recv<T>(mut rx: mpsc::Receiver<T>) -> Result<T, ManagerError> {
        match tokio::time::timeout(DEFAULT_TIMEOUT, rx.recv()).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(ManagerError::ManagerStopped),
            Err(_) => {
                log::error!(
                    "POSSIBLE DEADLOCK: timed out after {DEFAULT_TIMEOUT:?} waiting for a manager response"
                );
                Err(ManagerError::Timeout)
            }
        }
    }

    /// Creates a controller and blocks until its server has claimed the
    /// adapter: status connecting, reconnecting, or crashed.
    pub async fn create_controller(
        &self,
        request: CreateController,
    ) -> Result<u32, ManagerError> {
        let (responder, rx) = mpsc::channel(1);
        self.send(ManagerCommand::CreateController { request, responder })
            .await?;
        let index = Self::recv(rx).await??;

        loop {
            if let Some(state) = self.state.get(index) {
                match state.status {
                    ControllerStatus::Connecting
                    | ControllerStatus::Reconnecting
                    | ControllerStatus::Connected
                    | ControllerStatus::Crashed => break,
                    _ => (),
                }
            }
            tokio::time::sleep(CREATE_POLL_INTERVAL).await;
        }
        Ok(index)
    }

    /// Removes a controller, releasing its adapter and stopping its server.
    pub async fn remove_controller(&self, index: u32) -> Result<(), ManagerError> {
        let (responder, rx) = mpsc::channel(1);
        self.send(ManagerCommand::RemoveController { index, responder })
            .await?;
        Self::recv(rx).await?
    }

    /// Queues macro text on a controller and returns its generated id.
    /// With `block` set, waits until the macro finishes or is stopped.
    pub async fn macro_input(
        &self,
        index: u32,
        text: impl Into<String>,
        block: bool,
    ) -> Result<String, ManagerError> {
        if !self.state.contains(index) {
            return Err(ManagerError::UnknownController(index));
        }
        let id = generate_macro_id();
        let (responder, rx) = mpsc::channel(1);
        self.send(ManagerCommand::QueueMacro {
            index,
            text: text.into(),
            id: id.clone(),
            responder,
        })
        .await?;
        Self::recv(rx).await??;

        if block {
            self.wait_for_macro(index, &id).await?;
        }
        Ok(id)
    }

    /// Blocks until the given macro id lands in finished_macros. Errors
    /// out if the controller crashes while waiting.
    pub async fn wait_for_macro(&self, index: u32, id: &str) -> Result<(), ManagerError> {
        loop {
            let state = self
                .state
                .get(index)
                .ok_or(ManagerError::UnknownController(index))?;
            if state.finished_macros.iter().any(|finished| finished == id) {
                return Ok(());
            }
            match state.status {
                ControllerStatus::Crashed => {
                    return Err(ManagerError::ControllerCrashed(
                        state.errors.unwrap_or_default(),
                    ))
                }
                ControllerStatus::Removed => {
                    return Err(ManagerError::UnknownController(index))
                }
                _ => (),
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Presses a set of buttons for `down` seconds, then releases them for
    /// `up` seconds.
    pub async fn press_buttons(
        &self,
        index: u32,
        buttons: &[Button],
        down: f64,
        up: f64,
        block: bool,
    ) -> Result<String, ManagerError> {
        let tokens: Vec<&str> = buttons.iter().map(Button::token).collect();
        let text = format!("{} {down}s\n{up}s", tokens.join(" "));
        self.macro_input(index, text, block).await
    }

    /// Tilts a stick to (x, y), each in [-100, 100], for `tilted` seconds
    /// before releasing it for `released` seconds.
    pub async fn tilt_stick(
        &self,
        index: u32,
        stick: Stick,
        x: i32,
        y: i32,
        tilted: f64,
        released: f64,
        block: bool,
    ) -> Result<String, ManagerError> {
        let text = format!(
            "{stick}@{}{} {tilted}s\n{released}s",
            format_axis(x),
            format_axis(y)
        );
        self.macro_input(index, text, block).await
    }

    /// Stops a queued or running macro. The id is reported finished either
    /// way, so blocked waiters always wake.
    pub async fn stop_macro(&self, index: u32, id: &str, block: bool) -> Result<(), ManagerError> {
        if !self.state.contains(index) {
            return Err(ManagerError::UnknownController(index));
        }
        let (responder, rx) = mpsc::channel(1);
        self.send(ManagerCommand::StopMacro {
            index,
            id: id.to_string(),
            responder,
        })
        .await?;
        Self::recv(rx).await??;
        if block {
            self.wait_for_macro(index, id).await?;
        }
        Ok(())
    }

    /// Drops all queued and running macros on one controller.
    ///
    /// WARNING: blocked `macro_input`/`wait_for_macro` callers waiting on a
    /// cleared macro are NOT woken; no finished ids are recorded.
    pub async fn clear_macros(&self, index: u32) -> Result<(), ManagerError> {
        if !self.state.contains(index) {
            return Err(ManagerError::UnknownController(index));
        }
        let (responder, rx) = mpsc::channel(1);
        self.send(ManagerCommand::ClearMacros { index, responder })
            .await?;
        Self::recv(rx).await?
    }

    /// Drops all queued and running macros on every controller.
    pub async fn clear_all_macros(&self) -> Result<(), ManagerError> {
        self.send(ManagerCommand::ClearAllMacros).await
    }

    /// Overwrites the live-input slot of a controller. The packet is
    /// applied every cycle until replaced; write the idle packet (the
    /// default) to release control back to macros.
    pub fn set_controller_input(
        &self,
        index: u32,
        packet: InputPacket,
    ) -> Result<(), ManagerError> {
        if !self.state.contains(index) {
            return Err(ManagerError::UnknownController(index));
        }
        self.state.set_direct_input(index, Some(packet));
        Ok(())
    }

    /// Blocks until the controller is connected to a Switch; errors out if
    /// it crashes first.
    pub async fn wait_for_connection(&self, index: u32) -> Result<(), ManagerError> {
        loop {
            let state = self
                .state
                .get(index)
                .ok_or(ManagerError::UnknownController(index))?;
            match state.status {
                ControllerStatus::Connected => return Ok(()),
                ControllerStatus::Crashed => {
                    return Err(ManagerError::ControllerCrashed(
                        state.errors.unwrap_or_default(),
                    ))
                }
                ControllerStatus::Removed => {
                    return Err(ManagerError::UnknownController(index))
                }
                _ => tokio::time::sleep(POLL_INTERVAL).await,
            }
        }
    }

    /// Read-only view of one controller's state.
    pub fn get_state(&self, index: u32) -> Option<ControllerState> {
        self.state.get(index)
    }

    /// Read-only view of the whole state map.
    pub fn state(&self) -> &StateMap {
        &self.state
    }

    /// D-Bus paths of all Bluetooth adapters on the system.
    pub async fn get_available_adapters(&self) -> Result<Vec<String>, ManagerError> {
        Ok(bluetooth::list_adapters(&self.dbus).await?)
    }

    /// Addresses of previously connected Nintendo Switch consoles.
    pub async fn get_switch_addresses(&self) -> Result<Vec<String>, ManagerError> {
        Ok(bluetooth::find_devices_by_alias(&self.dbus, SWITCH_ALIAS).await?)
    }
}

/// 24 random bytes as 48 hex characters; collisions are not a concern.
fn generate_macro_id() -> String {
    let bytes: [u8; 24] = rand::random();
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn format_axis(value: i32) -> String {
    if value >= 0 {
        format!("+{value:03}")
    } else {
        format!("-{:03}", value.abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macro_ids_are_48_hex_chars() {
        let id = generate_macro_id();
        assert_eq!(id.len(), 48);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_macro_id());
    }

    #[test]
    fn axis_formatting_matches_macro_grammar() {
        assert_eq!(format_axis(100), "+100");
        assert_eq!(format_axis(0), "+000");
        assert_eq!(format_axis(-5), "-005");
        assert_eq!(format_axis(-100), "-100");
    }
}
