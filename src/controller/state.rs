//! Observable controller state shared between servers and the manager.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use super::input::InputPacket;
use super::ControllerKind;

/// Lifecycle status of one controller server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerStatus {
    Initializing,
    Connecting,
    Reconnecting,
    Connected,
    Crashed,
    Removed,
}

/// Snapshot of one controller, readable by API callers at any time.
///
/// The owning server thread is the only writer while it lives; the manager
/// writes exactly once, to mark the entry removed.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerState {
    pub status: ControllerStatus,
    /// Ids of completed or stopped macros, in completion order
    pub finished_macros: Vec<String>,
    /// Formatted error of a crashed server
    pub errors: Option<String>,
    /// Live input slot, applied every cycle while non-idle
    pub direct_input: Option<InputPacket>,
    /// Address of the most recently connected Switch
    pub last_connection: Option<String>,
    pub kind: ControllerKind,
    pub colour_body: [u8; 3],
    pub colour_buttons: [u8; 3],
    pub adapter_path: String,
}

impl ControllerState {
    pub fn new(
        kind: ControllerKind,
        colour_body: [u8; 3],
        colour_buttons: [u8; 3],
        adapter_path: String,
    ) -> Self {
        Self {
            status: ControllerStatus::Initializing,
            finished_macros: Vec::new(),
            errors: None,
            direct_input: None,
            last_connection: None,
            kind,
            colour_body,
            colour_buttons,
            adapter_path,
        }
    }
}

/// The process-wide state map, index -> [ControllerState].
#[derive(Debug, Clone, Default)]
pub struct StateMap {
    inner: Arc<RwLock<HashMap<u32, ControllerState>>>,
}

impl StateMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, index: u32, state: ControllerState) {
        if let Ok(mut map) = self.inner.write() {
            map.insert(index, state);
        }
    }

    pub fn get(&self, index: u32) -> Option<ControllerState> {
        self.inner.read().ok()?.get(&index).cloned()
    }

    pub fn contains(&self, index: u32) -> bool {
        self.inner
            .read()
            .map(|map| map.contains_key(&index))
            .unwrap_or(false)
    }

    pub fn indices(&self) -> Vec<u32> {
        self.inner
            .read()
            .map(|map| map.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> HashMap<u32, ControllerState> {
        self.inner
            .read()
            .map(|map| map.clone())
            .unwrap_or_default()
    }

    fn update<F: FnOnce(&mut ControllerState)>(&self, index: u32, apply: F) {
        if let Ok(mut map) = self.inner.write() {
            if let Some(state) = map.get_mut(&index) {
                apply(state);
            }
        }
    }

    pub fn set_status(&self, index: u32, status: ControllerStatus) {
        self.update(index, |state| state.status = status);
    }

    pub fn set_error(&self, index: u32, error: String) {
        self.update(index, |state| state.errors = Some(error));
    }

    pub fn set_last_connection(&self, index: u32, address: String) {
        self.update(index, |state| state.last_connection = Some(address));
    }

    pub fn push_finished(&self, index: u32, id: String) {
        self.update(index, |state| state.finished_macros.push(id));
    }

    pub fn set_direct_input(&self, index: u32, packet: Option<InputPacket>) {
        self.update(index, |state| state.direct_input = packet);
    }

    pub fn direct_input(&self, index: u32) -> Option<InputPacket> {
        self.inner.read().ok()?.get(&index)?.direct_input
    }
}

/// A server's writer handle for its own entry in the [StateMap].
#[derive(Debug, Clone)]
pub struct StateHandle {
    map: StateMap,
    index: u32,
}

impl StateHandle {
    pub fn new(map: StateMap, index: u32) -> Self {
        Self { map, index }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn status(&self) -> Option<ControllerStatus> {
        self.map.get(self.index).map(|state| state.status)
    }

    pub fn set_status(&self, status: ControllerStatus) {
        self.map.set_status(self.index, status);
    }

    pub fn set_error(&self, error: String) {
        self.map.set_error(self.index, error);
    }

    pub fn set_last_connection(&self, address: String) {
        self.map.set_last_connection(self.index, address);
    }

    pub fn push_finished(&self, id: String) {
        self.map.push_finished(self.index, id);
    }

    pub fn direct_input(&self) -> Option<InputPacket> {
        self.map.direct_input(self.index)
    }
}
