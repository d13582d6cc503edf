//! Emulated Switch controller: protocol state machine, macro engine and the
//! per-controller real-time server.

pub mod command;
pub mod debug;
pub mod input;
pub mod protocol;
pub mod server;
pub mod state;

#[cfg(test)]
pub mod input_test;

use serde::{Deserialize, Serialize};

use crate::bluetooth::{BluetoothError, BtSession};
use crate::constants::{SDP_RECORD_PATH, SDP_UUID};

/// The SDP record advertising the controller HID service.
const SDP_RECORD: &str = include_str!("sdp_record.xml");

/// The kinds of controller that can be emulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerKind {
    JoyConL,
    JoyConR,
    ProController,
}

impl ControllerKind {
    /// Device id byte reported in the device-info subcommand reply.
    pub fn device_id(&self) -> u8 {
        match self {
            Self::JoyConL => 0x01,
            Self::JoyConR => 0x02,
            Self::ProController => 0x03,
        }
    }

    /// Connection-info nibble for byte 3 of every input report.
    pub fn connection_info(&self) -> u8 {
        match self {
            Self::JoyConL | Self::JoyConR => 0x0E,
            Self::ProController => 0x00,
        }
    }

    /// Adapter alias the Switch pairs against.
    pub fn alias(&self) -> &'static str {
        match self {
            Self::JoyConL => "Joy-Con (L)",
            Self::JoyConR => "Joy-Con (R)",
            Self::ProController => "Pro Controller",
        }
    }

    pub fn has_left_stick(&self) -> bool {
        !matches!(self, Self::JoyConR)
    }

    pub fn has_right_stick(&self) -> bool {
        !matches!(self, Self::JoyConL)
    }
}

impl std::fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.alias())
    }
}

/// Fixed identity of one emulated controller for the session.
#[derive(Debug, Clone, Copy)]
pub struct ControllerIdentity {
    pub kind: ControllerKind,
    pub address: crate::bluetooth::l2cap::BdAddr,
    pub colour_body: [u8; 3],
    pub colour_buttons: [u8; 3],
}

impl ControllerIdentity {
    pub fn new(
        kind: ControllerKind,
        address: crate::bluetooth::l2cap::BdAddr,
        colour_body: Option<[u8; 3]>,
        colour_buttons: Option<[u8; 3]>,
    ) -> Self {
        Self {
            kind,
            address,
            colour_body: colour_body.unwrap_or([0x82; 3]),
            colour_buttons: colour_buttons.unwrap_or([0x0F; 3]),
        }
    }
}

/// Configures an adapter to present itself as the given controller kind.
///
/// The device class is deliberately NOT set here: BlueZ silently reverts a
/// class written before the adapter goes discoverable, so the server writes
/// it after calling set_discoverable.
pub fn setup_adapter(session: &BtSession, kind: ControllerKind) -> Result<(), BluetoothError> {
    session.set_powered(true)?;
    session.set_pairable(true)?;
    session.set_pairable_timeout(0)?;
    session.set_discoverable_timeout(180)?;
    session.set_alias(kind.alias())?;

    // Re-registering an identical record makes BlueZ complain; the record
    // from a previous controller on this adapter is still good.
    if let Err(err) = session.register_profile(SDP_RECORD_PATH, SDP_UUID, SDP_RECORD) {
        log::debug!("SDP record registration failed (already present?): {err}");
    }
    Ok(())
}
