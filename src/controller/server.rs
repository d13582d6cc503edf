//! The per-controller real-time server.
//!
//! One server owns one Bluetooth adapter and one emulated controller. It
//! runs on a dedicated OS thread: the report cadence (60-120Hz with
//! absolute tick deadlines) does not tolerate sharing a scheduler with
//! other controllers. The manager communicates with it through a task
//! queue drained once per cycle and a shared state entry it publishes to.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::bluetooth::l2cap::{
    BdAddr, L2capListener, L2capStream, SendError, PSM_HID_CONTROL, PSM_HID_INTERRUPT,
};
use crate::bluetooth::{BluetoothError, BtSession};
use crate::constants::{GAMEPAD_CLASS, REPORT_SIZE};

use super::command::ControllerCommand;
use super::debug::{format_controller_report, format_switch_report};
use super::input::{repair_frames, InputParser};
use super::protocol::ControllerProtocol;
use super::state::{ControllerStatus, StateHandle};
use super::{setup_adapter, ControllerIdentity, ControllerKind};

/// Resend an unchanged report body after this many ticks. Keeps the link
/// alive without flooding the Grip/Order menu, which drops controllers
/// that spam identical packets.
const KEEPALIVE_TICKS: u32 = 132;

/// Cadence while waiting for the Switch's first message during pairing
const PAIRING_IDLE_INTERVAL: Duration = Duration::from_secs(1);
/// Cadence once the Switch has started talking; pairing responds best at 15Hz
const PAIRING_ACTIVE_INTERVAL: Duration = Duration::from_millis(1000 / 15);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Bluetooth(#[from] BluetoothError),
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to send report: {0}")]
    Send(#[from] SendError),
    #[error("could not reconnect to any of the given addresses")]
    ReconnectFailed,
    /// Not a failure: the manager asked the server to stop
    #[error("controller removed")]
    Shutdown,
}

/// Everything a server needs to come up, handed over by the manager.
pub struct ServerOptions {
    pub kind: ControllerKind,
    pub adapter_path: String,
    pub colour_body: Option<[u8; 3]>,
    pub colour_buttons: Option<[u8; 3]>,
    pub frequency: u32,
    /// Previously paired Switch addresses to try before advertising
    pub reconnect: Vec<BdAddr>,
}

pub struct ControllerServer {
    identity: ControllerIdentity,
    frequency: u32,
    adapter_path: String,
    session: BtSession,
    protocol: ControllerProtocol,
    parser: InputParser,
    state: StateHandle,
    tasks: mpsc::Receiver<ControllerCommand>,
    bluetooth_lock: Arc<Mutex<()>>,
    shutdown: Arc<AtomicBool>,
    switch_address: Option<BdAddr>,
    reconnect_counter: u32,
    tick: u32,
    /// Body (bytes 3..) of the last sent report, for the coalesced-send rule
    cached_body: Option<Vec<u8>>,
}

impl ControllerServer {
    pub fn new(
        options: &ServerOptions,
        state: StateHandle,
        tasks: mpsc::Receiver<ControllerCommand>,
        bluetooth_lock: Arc<Mutex<()>>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, ServerError> {
        let session = BtSession::new(Some(&options.adapter_path))?;
        let identity = ControllerIdentity::new(
            options.kind,
            session.address()?,
            options.colour_body,
            options.colour_buttons,
        );
        Ok(Self {
            identity,
            frequency: options.frequency,
            adapter_path: options.adapter_path.clone(),
            session,
            protocol: ControllerProtocol::new(identity),
            parser: InputParser::new(),
            state,
            tasks,
            bluetooth_lock,
            shutdown,
            switch_address: None,
            reconnect_counter: 0,
            tick: 1,
            cached_body: None,
        })
    }

    fn kind(&self) -> ControllerKind {
        self.identity.kind
    }

    /// Drives the controller until it is removed or an unrecoverable error
    /// occurs, publishing the outcome through the shared state.
    pub fn run(mut self, reconnect: Vec<BdAddr>) {
        self.state.set_status(ControllerStatus::Initializing);
        match self.serve(reconnect) {
            Ok(()) | Err(ServerError::Shutdown) => {
                log::info!("Controller {} stopped", self.state.index());
                self.state.set_status(ControllerStatus::Removed);
            }
            Err(err) => {
                log::error!("Controller {} crashed: {err}", self.state.index());
                self.state.set_error(err.to_string());
                self.state.set_status(ControllerStatus::Crashed);
            }
        }
    }

    fn serve(&mut self, reconnect: Vec<BdAddr>) -> Result<(), ServerError> {
        let (itr, ctrl) = {
            // Serialize adapter setup and pairing across controllers;
            // concurrent setup saturates the host stack.
            let lock = self.bluetooth_lock.clone();
            let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            setup_adapter(&self.session, self.kind())?;
            if reconnect.is_empty() {
                self.connect()?
            } else {
                match self.reconnect(&reconnect) {
                    Ok(pair) => pair,
                    Err(ServerError::Shutdown) => return Err(ServerError::Shutdown),
                    Err(err) => {
                        log::debug!("Reconnect failed ({err}), advertising instead");
                        self.connect()?
                    }
                }
            }
        };

        self.note_peer(&itr);
        self.state.set_status(ControllerStatus::Connected);
        self.mainloop(itr, ctrl)
    }

    fn note_peer(&mut self, itr: &L2capStream) {
        if let Ok(peer) = itr.peer_addr() {
            self.switch_address = Some(peer);
            self.state.set_last_connection(peer.to_string());
        }
    }

    fn check_shutdown(&self) -> Result<(), ServerError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(ServerError::Shutdown);
        }
        Ok(())
    }

    /// Advertises as a controller and waits for any Switch to pair.
    /// Retries forever; consoles regularly abort half-way through a
    /// connection attempt.
    fn connect(&mut self) -> Result<(L2capStream, L2capStream), ServerError> {
        loop {
            self.check_shutdown()?;
            self.state.set_status(ControllerStatus::Connecting);
            match self.try_connect() {
                Ok(pair) => return Ok(pair),
                Err(ServerError::Shutdown) => return Err(ServerError::Shutdown),
                Err(err) => log::debug!("Connection attempt failed: {err}"),
            }
        }
    }

    fn try_connect(&mut self) -> Result<(L2capStream, L2capStream), ServerError> {
        let address = self.session.address()?;
        let ctrl_listener = L2capListener::bind(address, PSM_HID_CONTROL)?;
        let itr_listener = L2capListener::bind(address, PSM_HID_INTERRUPT)?;
        itr_listener.listen()?;
        ctrl_listener.listen()?;

        self.session.set_discoverable(true)?;
        // The class resets to its default when written before the adapter
        // goes discoverable, so this one must come second.
        self.session.set_class(GAMEPAD_CLASS)?;

        let watchdog = Watchdog::spawn(self.adapter_path.clone(), self.shutdown.clone());
        let accepted = self.accept_pair(&itr_listener, &ctrl_listener);
        watchdog.stop();
        let (itr, ctrl) = accepted?;

        // One empty input report solicits the Switch's first message
        self.protocol.process(None);
        let msg = self.protocol.take_report();
        send_blocking(&itr, &msg)?;
        itr.set_nonblocking(true)?;

        self.pairing_loop(&itr)?;
        Ok((itr, ctrl))
    }

    fn accept_pair(
        &self,
        itr_listener: &L2capListener,
        ctrl_listener: &L2capListener,
    ) -> Result<(L2capStream, L2capStream), ServerError> {
        let itr = loop {
            self.check_shutdown()?;
            if let Some((stream, peer)) = itr_listener.accept_timeout(Duration::from_millis(500))? {
                log::debug!("Accepted interrupt connection from {peer}");
                break stream;
            }
        };
        let ctrl = loop {
            self.check_shutdown()?;
            if let Some((stream, _)) = ctrl_listener.accept_timeout(Duration::from_millis(500))? {
                break stream;
            }
        };
        Ok((itr, ctrl))
    }

    /// Exchanges reports with the Switch until pairing completes: player
    /// lights set and vibration enabled.
    fn pairing_loop(&mut self, itr: &L2capStream) -> Result<(), ServerError> {
        let mut received_first_message = false;
        loop {
            self.check_shutdown()?;
            let reply = recv_report(itr);
            if let Some(data) = reply.as_deref() {
                received_first_message = true;
                if data.len() > 40 {
                    log::trace!("{}", format_switch_report(data));
                }
            }

            self.protocol.process(reply.as_deref());
            let msg = self.protocol.take_report();
            if reply.is_some() {
                log::trace!("{}", format_controller_report(&msg));
            }
            match itr.send(&msg) {
                Ok(()) | Err(SendError::WouldBlock) => (),
                Err(err) => return Err(err.into()),
            }

            if reply.is_some_and(|data| data.len() > 45) && self.protocol.is_paired() {
                return Ok(());
            }

            // The Switch answers slowly while pairing; don't outpace it
            thread::sleep(if received_first_message {
                PAIRING_ACTIVE_INTERVAL
            } else {
                PAIRING_IDLE_INTERVAL
            });
        }
    }

    /// Dials back out to previously paired Switches, first success wins.
    fn reconnect(&mut self, addresses: &[BdAddr]) -> Result<(L2capStream, L2capStream), ServerError> {
        self.state.set_status(ControllerStatus::Reconnecting);
        for &address in addresses {
            self.check_shutdown()?;
            match open_client_pair(address) {
                Ok((itr, ctrl)) => {
                    log::debug!("Reconnected to {address}");
                    self.protocol.process(None);
                    let msg = self.protocol.take_report();
                    send_blocking(&itr, &msg)?;
                    itr.set_nonblocking(true)?;
                    return Ok((itr, ctrl));
                }
                Err(err) => log::debug!("Reconnect to {address} failed: {err}"),
            }
        }
        Err(ServerError::ReconnectFailed)
    }

    /// The steady-state report loop. Each cycle: take one inbound report,
    /// apply queued tasks, merge parser input, send the assembled report,
    /// then wait out the tick. Tick boundaries are absolute; a slow cycle
    /// shortens the next wait instead of shifting the grid.
    fn mainloop(&mut self, mut itr: L2capStream, mut _ctrl: L2capStream) -> Result<(), ServerError> {
        let period = Duration::from_secs_f64(1.0 / self.frequency as f64);
        let mut deadline = Instant::now() + period;
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Ok(());
            }

            let reply = recv_report(&itr);
            if let Some(data) = reply.as_deref() {
                if data.len() > 40 {
                    log::trace!("{}", format_switch_report(data));
                }
            }

            self.drain_tasks();

            let direct = self.state.direct_input();
            self.protocol.process(reply.as_deref());
            let frame = self.parser.poll(direct.as_ref(), Instant::now());
            self.protocol.apply_frame(frame.as_ref());
            for id in self.parser.take_finished() {
                self.state.push_finished(id);
            }
            let msg = self.protocol.take_report();

            // Coalesced send: identical bodies are only repeated as a
            // periodic keep-alive.
            let body_changed = self.cached_body.as_deref() != Some(&msg[3..]);
            let send_result = if body_changed {
                let result = itr.send(&msg);
                self.cached_body = Some(msg[3..].to_vec());
                result
            } else if self.tick >= KEEPALIVE_TICKS {
                self.tick = 0;
                itr.send(&msg)
            } else {
                Ok(())
            };

            match send_result {
                Ok(()) => (),
                Err(SendError::WouldBlock) => continue,
                Err(err) => {
                    log::warn!("Lost connection to the Switch ({err}), recovering");
                    let (new_itr, new_ctrl) = self.recover()?;
                    itr = new_itr;
                    _ctrl = new_ctrl;
                    self.cached_body = None;
                    deadline = Instant::now() + period;
                    continue;
                }
            }

            deadline += period;
            wait_until(deadline);
            self.tick += 1;
        }
    }

    fn drain_tasks(&mut self) {
        while let Ok(command) = self.tasks.try_recv() {
            match command {
                ControllerCommand::Macro { text, id } => self.parser.buffer_macro(text, id),
                ControllerCommand::StopMacro { id } => self.parser.stop_macro(&id),
                ControllerCommand::ClearMacros => self.parser.clear_macros(),
            }
        }
    }

    fn reset_protocol(&mut self) {
        self.protocol = ControllerProtocol::new(self.identity);
    }

    /// Connection recovery: two reconnect attempts back to the last
    /// Switch, then fall back to advertising for any console. The fallback
    /// preloads the kind-specific re-pair button press the Switch expects
    /// from a forgotten controller.
    fn recover(&mut self) -> Result<(L2capStream, L2capStream), ServerError> {
        while self.reconnect_counter < 2 {
            self.check_shutdown()?;
            log::debug!("Attempting to reconnect to the last Switch");
            match self.try_recover_last() {
                Ok(pair) => {
                    self.reconnect_counter = 0;
                    self.state.set_status(ControllerStatus::Connected);
                    return Ok(pair);
                }
                Err(ServerError::Shutdown) => return Err(ServerError::Shutdown),
                Err(err) => {
                    self.reconnect_counter += 1;
                    log::debug!("Reconnect attempt failed: {err}");
                    thread::sleep(Duration::from_millis(500));
                }
            }
        }

        log::debug!("Reconnects exhausted, advertising for any Switch");
        self.reconnect_counter = 0;
        self.tick = 1;
        self.cached_body = None;
        self.reset_protocol();
        self.parser.preload_frames(repair_frames(self.kind()));

        let pair = {
            let lock = self.bluetooth_lock.clone();
            let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            self.connect()?
        };
        self.note_peer(&pair.0);
        self.state.set_status(ControllerStatus::Connected);
        Ok(pair)
    }

    fn try_recover_last(&mut self) -> Result<(L2capStream, L2capStream), ServerError> {
        let addresses: Vec<BdAddr> = self.switch_address.into_iter().collect();
        self.reset_protocol();
        let lock = self.bluetooth_lock.clone();
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let (itr, ctrl) = self.reconnect(&addresses)?;
        self.pairing_loop(&itr)?;
        Ok((itr, ctrl))
    }
}

fn open_client_pair(address: BdAddr) -> Result<(L2capStream, L2capStream), ServerError> {
    let ctrl = L2capStream::connect(address, PSM_HID_CONTROL)?;
    let itr = L2capStream::connect(address, PSM_HID_INTERRUPT)?;
    Ok((itr, ctrl))
}

/// Receive one report if ready. Transport hiccups read as "no data"; real
/// disconnects surface on the next send.
fn recv_report(itr: &L2capStream) -> Option<Vec<u8>> {
    let mut buf = [0u8; REPORT_SIZE];
    match itr.recv(&mut buf) {
        Ok(Some(len)) if len > 0 => Some(buf[..len].to_vec()),
        Ok(_) => None,
        Err(err) => {
            log::debug!("recv failed: {err}");
            None
        }
    }
}

/// Send, retrying would-block; used outside the paced mainloop.
fn send_blocking(stream: &L2capStream, msg: &[u8]) -> Result<(), ServerError> {
    loop {
        match stream.send(msg) {
            Ok(()) => return Ok(()),
            Err(SendError::WouldBlock) => thread::sleep(Duration::from_millis(1)),
            Err(err) => return Err(err.into()),
        }
    }
}

/// Sleeps the bulk of the wait and spins the tail so ticks land on their
/// absolute boundaries.
fn wait_until(deadline: Instant) {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        let remaining = deadline - now;
        if remaining > Duration::from_micros(500) {
            thread::sleep(remaining - Duration::from_micros(500));
        } else {
            std::hint::spin_loop();
        }
    }
}

/// Keeps the adapter advertisable while `connect` waits in accept.
///
/// bluetoothd resets adapter properties a beat after a restart, and a
/// Switch with a stale pairing record connects and drops in a tight loop.
/// The watchdog re-asserts the adapter properties every 100ms and removes
/// a cached peer after two such flaps.
struct Watchdog {
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Watchdog {
    fn spawn(adapter_path: String, server_shutdown: Arc<AtomicBool>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = thread::Builder::new()
            .name("nxpad-watchdog".to_string())
            .spawn(move || {
                if let Err(err) = watchdog_loop(&adapter_path, &flag, &server_shutdown) {
                    log::debug!("Connection watchdog exited: {err}");
                }
            });
        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(err) => {
                log::error!("Failed to start connection watchdog: {err}");
                None
            }
        };
        Self { running, handle }
    }

    fn stop(mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn watchdog_loop(
    adapter_path: &str,
    running: &AtomicBool,
    server_shutdown: &AtomicBool,
) -> Result<(), BluetoothError> {
    let session = BtSession::new(Some(adapter_path))?;
    let mut connected: HashSet<String> = HashSet::new();
    let mut flap_counts: HashMap<String, u32> = HashMap::new();

    while running.load(Ordering::Relaxed) && !server_shutdown.load(Ordering::Relaxed) {
        if !session.discoverable()? {
            // Wait out systemd's delayed property reset, then restore
            thread::sleep(Duration::from_millis(750));
            session.set_powered(true)?;
            session.set_pairable(true)?;
            session.set_pairable_timeout(0)?;
            session.set_discoverable(true)?;
            session.set_class(GAMEPAD_CLASS)?;
        }

        let present: HashSet<String> = session.connected_switches()?.into_iter().collect();
        let dropped: Vec<String> = connected.difference(&present).cloned().collect();
        for path in dropped {
            *flap_counts.entry(path.clone()).or_insert(0) += 1;
            connected.remove(&path);
        }
        connected.extend(present);

        for (path, count) in flap_counts.iter_mut() {
            if *count >= 2 {
                log::debug!("A Nintendo Switch keeps dropping its connection, removing {path}");
                if let Err(err) = session.remove_device(path) {
                    log::debug!("Failed to remove {path}: {err}");
                }
                *count = 0;
            }
        }

        thread::sleep(Duration::from_millis(100));
    }
    Ok(())
}
