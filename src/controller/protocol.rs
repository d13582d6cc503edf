//! Switch HID protocol state machine.
//!
//! Parses Switch-to-controller output reports, answers subcommands
//! (device info, SPI flash reads, mode/IMU/vibration/player-light
//! configuration) and assembles the 50-byte controller-to-Switch input
//! reports. All replies are byte-exact with a real controller; the Switch
//! accepts nothing less.

use std::time::Instant;

use crate::bluetooth::l2cap::BdAddr;
use crate::constants::{INPUT_REPORT_HEADER, OUTPUT_REPORT_HEADER, REPORT_SIZE};

use super::input::InputFrame;
use super::{ControllerIdentity, ControllerKind};

/// Values the vibrator report byte cycles through on subcommand replies.
const VIBRATOR_BYTES: [u8; 4] = [0xA0, 0xB0, 0xC0, 0x90];

/// Canned six-axis samples for full reports while the IMU is enabled. The
/// console only needs plausible resting values.
const IMU_DATA: [u8; 36] = [
    0x75, 0xFD, 0xFD, 0xFF, 0x09, 0x10, 0x21, 0x00, 0xD5, 0xFF, 0xE0, 0xFF, 0x72, 0xFD, 0xF9,
    0xFF, 0x0A, 0x10, 0x22, 0x00, 0xD5, 0xFF, 0xE0, 0xFF, 0x76, 0xFD, 0xFC, 0xFF, 0x09, 0x10,
    0x23, 0x00, 0xD5, 0xFF, 0xE0, 0xFF,
];

/// Six-axis motion sensor factory calibration (SPI 0x6020): acceleration
/// origin, acceleration sensitivity, gyro origin, gyro sensitivity.
const SIX_AXIS_CAL: [u8; 24] = [
    0x32, 0x00, 0xFA, 0xFE, 0x38, 0x01, 0x00, 0x40, 0x00, 0x40, 0x00, 0x40, 0x03, 0x00, 0xEE,
    0xFF, 0xD9, 0xFF, 0x3B, 0x34, 0x3B, 0x34, 0x3B, 0x34,
];

/// Factory analog stick calibration blobs (SPI 0x603D).
const LEFT_STICK_FACTORY_CAL: [u8; 9] = [0xBA, 0xF5, 0x62, 0x6F, 0xC8, 0x77, 0xED, 0x95, 0x5B];
const RIGHT_STICK_FACTORY_CAL: [u8; 9] = [0x16, 0xD8, 0x7D, 0xF2, 0xB5, 0x5F, 0x86, 0x65, 0x5E];

/// Resting stick bytes. These match the centres encoded in the factory
/// calibration above.
const LEFT_STICK_CENTRE: [u8; 3] = [0x6F, 0xC8, 0x77];
const RIGHT_STICK_CENTRE: [u8; 3] = [0x16, 0xD8, 0x7D];

/// Fixed NFC/IR configuration blob plus its 0xC8 tail byte.
const NFC_IR_CONFIG: [u8; 8] = [0x01, 0x00, 0xFF, 0x00, 0x08, 0x00, 0x1B, 0x01];

/// Input report mode requested through subcommand 0x03.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// Full reports (0x30)
    Standard,
    /// NFC/IR mode (0x31)
    NfcIr,
    /// Simple HID mode (0x3F)
    SimpleHid,
}

/// One parsed Switch-to-controller message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchRequest {
    Subcommand(Subcommand),
    /// Nothing arrived this cycle
    Empty,
    /// Shorter than a full output report
    TooShort,
    /// First byte was not 0xA2
    BadHeader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subcommand {
    RequestDeviceInfo,
    SetShipment,
    SpiRead {
        addr_top: u8,
        addr_bottom: u8,
        read_length: u8,
    },
    SetInputMode(u8),
    TriggerButtons,
    ToggleImu(bool),
    EnableVibration,
    SetPlayerLights(u8),
    SetNfcIrState,
    SetNfcIrConfig,
    Unknown(u8),
}

impl SwitchRequest {
    /// Classifies raw interrupt-channel data. Byte 11 of a well-formed
    /// output report carries the subcommand id.
    pub fn parse(data: Option<&[u8]>) -> Self {
        let Some(data) = data else {
            return Self::Empty;
        };
        if data.is_empty() {
            return Self::Empty;
        }
        if data.len() < REPORT_SIZE {
            return Self::TooShort;
        }
        if data[0] != OUTPUT_REPORT_HEADER {
            return Self::BadHeader;
        }
        let args = &data[12..];
        let subcommand = match data[11] {
            0x02 => Subcommand::RequestDeviceInfo,
            0x08 => Subcommand::SetShipment,
            0x10 => Subcommand::SpiRead {
                addr_bottom: args[0],
                addr_top: args[1],
                read_length: args[4],
            },
            0x03 => Subcommand::SetInputMode(args[0]),
            0x04 => Subcommand::TriggerButtons,
            0x40 => Subcommand::ToggleImu(args[0] == 0x01),
            0x48 => Subcommand::EnableVibration,
            0x30 => Subcommand::SetPlayerLights(args[0]),
            0x22 => Subcommand::SetNfcIrState,
            0x21 => Subcommand::SetNfcIrConfig,
            other => Subcommand::Unknown(other),
        };
        Self::Subcommand(subcommand)
    }
}

/// Protocol state for one emulated controller.
pub struct ControllerProtocol {
    identity: ControllerIdentity,
    report: [u8; REPORT_SIZE],
    mode: Option<InputMode>,
    /// 0 while unassigned, 1..=4 once player lights are set
    player_number: u8,
    /// Gate for emitting live button/stick bytes. The Switch ignores input
    /// from a controller it has not identified yet.
    device_info_queried: bool,
    imu_enabled: bool,
    vibration_enabled: bool,
    timer: u8,
    timestamp: Option<Instant>,
    /// High nibble of report byte 3
    battery_level: u8,
    /// Low nibble of report byte 3
    connection_info: u8,
    vibrator_index: usize,
}

impl ControllerProtocol {
    pub fn new(identity: ControllerIdentity) -> Self {
        let mut report = [0u8; REPORT_SIZE];
        report[0] = INPUT_REPORT_HEADER;
        Self {
            report,
            mode: None,
            player_number: 0,
            device_info_queried: false,
            imu_enabled: false,
            vibration_enabled: false,
            timer: 0,
            timestamp: None,
            battery_level: 0x90,
            connection_info: identity.kind.connection_info(),
            vibrator_index: 0,
            identity,
        }
    }

    pub fn kind(&self) -> ControllerKind {
        self.identity.kind
    }

    pub fn address(&self) -> BdAddr {
        self.identity.address
    }

    pub fn device_info_queried(&self) -> bool {
        self.device_info_queried
    }

    pub fn player_number(&self) -> u8 {
        self.player_number
    }

    pub fn mode(&self) -> Option<InputMode> {
        self.mode
    }

    pub fn imu_enabled(&self) -> bool {
        self.imu_enabled
    }

    pub fn vibration_enabled(&self) -> bool {
        self.vibration_enabled
    }

    /// Pairing is complete once the Switch has both set the player lights
    /// and enabled vibration.
    pub fn is_paired(&self) -> bool {
        self.vibration_enabled && self.player_number > 0
    }

    /// Processes one inbound message (or its absence) and stages the
    /// matching reply in the report buffer.
    pub fn process(&mut self, data: Option<&[u8]>) {
        match SwitchRequest::parse(data) {
            SwitchRequest::Subcommand(subcommand) => self.handle_subcommand(subcommand),
            SwitchRequest::Empty | SwitchRequest::TooShort | SwitchRequest::BadHeader => {
                self.set_full_input_report()
            }
        }
    }

    fn handle_subcommand(&mut self, subcommand: Subcommand) {
        if let Subcommand::Unknown(id) = subcommand {
            // Never NACK: the Switch re-sends the subcommand on a NACK and
            // the exchange never converges. A plain full report moves on.
            log::debug!("Ignoring unknown subcommand 0x{id:02X}");
            self.set_full_input_report();
            return;
        }

        // The gate opens before the reply is staged: the device-info reply
        // itself already carries live input bytes.
        if subcommand == Subcommand::RequestDeviceInfo {
            self.device_info_queried = true;
        }

        self.begin_subcommand_reply();
        match subcommand {
            Subcommand::RequestDeviceInfo => self.reply_device_info(),
            Subcommand::SetShipment => self.reply_ack(0x80, 0x08),
            Subcommand::SpiRead {
                addr_top,
                addr_bottom,
                read_length,
            } => self.reply_spi_read(addr_top, addr_bottom, read_length),
            Subcommand::SetInputMode(raw) => self.reply_set_mode(raw),
            Subcommand::TriggerButtons => self.reply_ack(0x83, 0x04),
            Subcommand::ToggleImu(enabled) => {
                self.imu_enabled = enabled;
                self.reply_ack(0x80, 0x40);
            }
            Subcommand::EnableVibration => {
                self.vibration_enabled = true;
                self.reply_ack(0x82, 0x48);
            }
            Subcommand::SetPlayerLights(bitfield) => self.reply_set_player_lights(bitfield),
            Subcommand::SetNfcIrState => self.reply_ack(0x80, 0x22),
            Subcommand::SetNfcIrConfig => self.reply_nfc_ir_config(),
            Subcommand::Unknown(_) => unreachable!("handled above"),
        }
    }

    /// Merges the parser's live input into the staged report. Dropped
    /// entirely until the Switch has queried device info.
    pub fn apply_frame(&mut self, frame: Option<&InputFrame>) {
        if !self.device_info_queried {
            return;
        }
        let Some(frame) = frame else {
            return;
        };
        self.report[4..7].copy_from_slice(&frame.buttons);
        if self.identity.kind.has_left_stick() {
            if let Some(stick) = frame.left_stick {
                self.report[7..10].copy_from_slice(&stick);
            }
        }
        if self.identity.kind.has_right_stick() {
            if let Some(stick) = frame.right_stick {
                self.report[10..13].copy_from_slice(&stick);
            }
        }
    }

    /// Returns the staged report and resets the buffer for the next cycle.
    pub fn take_report(&mut self) -> [u8; REPORT_SIZE] {
        let report = self.report;
        self.report = [0u8; REPORT_SIZE];
        self.report[0] = INPUT_REPORT_HEADER;
        report
    }

    /// Stages a subcommand reply report (0x21).
    fn begin_subcommand_reply(&mut self) {
        self.report[1] = 0x21;
        // The vibrator byte shifts whenever a real controller answers a
        // subcommand; emulate that with a fixed rotation.
        self.vibrator_index = (self.vibrator_index + 1) % VIBRATOR_BYTES.len();
        self.write_standard_input(Instant::now());
    }

    /// Stages a plain full input report (0x30).
    fn set_full_input_report(&mut self) {
        self.report[1] = 0x30;
        self.write_standard_input(Instant::now());
        if self.imu_enabled {
            self.report[14..14 + IMU_DATA.len()].copy_from_slice(&IMU_DATA);
        }
    }

    fn write_standard_input(&mut self, now: Instant) {
        self.step_timer(now);
        self.report[3] = self.battery_level | self.connection_info;
        if self.device_info_queried {
            // Buttons stay neutral here; apply_frame overlays live input
            if self.identity.kind.has_left_stick() {
                self.report[7..10].copy_from_slice(&LEFT_STICK_CENTRE);
            }
            if self.identity.kind.has_right_stick() {
                self.report[10..13].copy_from_slice(&RIGHT_STICK_CENTRE);
            }
        }
        self.report[13] = VIBRATOR_BYTES[self.vibrator_index];
    }

    /// Advances the report timer byte. One tick is 5/4ms of wall time, so
    /// the elapsed tick count is elapsed milliseconds times four.
    pub(crate) fn step_timer(&mut self, now: Instant) {
        let Some(timestamp) = self.timestamp else {
            self.timestamp = Some(now);
            self.report[2] = 0x00;
            return;
        };
        let elapsed_ms = now.duration_since(timestamp).as_secs_f64() * 1000.0;
        let ticks = (elapsed_ms * 4.0) as u64;
        self.timer = self.timer.wrapping_add((ticks & 0xFF) as u8);
        self.report[2] = self.timer;
        self.timestamp = Some(now);
    }

    fn reply_ack(&mut self, ack: u8, subcommand_id: u8) {
        self.report[14] = ack;
        self.report[15] = subcommand_id;
    }

    fn reply_device_info(&mut self) {
        self.reply_ack(0x82, 0x02);
        // Firmware version
        self.report[16] = 0x03;
        self.report[17] = 0x8B;
        self.report[18] = self.identity.kind.device_id();
        // Unknown byte, always 2
        self.report[19] = 0x02;
        self.report[20..26].copy_from_slice(&self.identity.address.octets());
        // Unknown byte, always 1
        self.report[26] = 0x01;
        // Colours come from SPI rather than the defaults
        self.report[27] = 0x01;
    }

    fn reply_set_mode(&mut self, raw: u8) {
        self.reply_ack(0x80, 0x03);
        self.mode = match raw {
            0x30 => Some(InputMode::Standard),
            0x31 => Some(InputMode::NfcIr),
            0x3F => Some(InputMode::SimpleHid),
            _ => self.mode,
        };
    }

    fn reply_set_player_lights(&mut self, bitfield: u8) {
        self.reply_ack(0x80, 0x30);
        self.player_number = match bitfield {
            0x01 | 0x10 => 1,
            0x03 | 0x30 => 2,
            0x07 | 0x70 => 3,
            0x0F | 0xF0 => 4,
            _ => self.player_number,
        };
    }

    fn reply_nfc_ir_config(&mut self) {
        self.reply_ack(0xA0, 0x21);
        self.report[16..24].copy_from_slice(&NFC_IR_CONFIG);
        self.report[49] = 0xC8;
    }

    /// Emulated SPI flash. The Switch reads serial number, colours, stick
    /// parameters and calibration out of these regions during pairing.
    fn reply_spi_read(&mut self, addr_top: u8, addr_bottom: u8, read_length: u8) {
        self.reply_ack(0x90, 0x10);
        self.report[16] = addr_bottom;
        self.report[17] = addr_top;
        self.report[20] = read_length;

        let mut payload = Vec::with_capacity(32);
        match (addr_top, addr_bottom) {
            // Serial number: all 0xFF reads as "no serial"
            (0x60, 0x00) => payload.extend_from_slice(&[0xFF; 16]),
            // Body/button colours plus grip filler
            (0x60, 0x50) => {
                payload.extend_from_slice(&self.identity.colour_body);
                payload.extend_from_slice(&self.identity.colour_buttons);
                payload.extend_from_slice(&[0xFF; 7]);
            }
            // Factory sensor/stick device parameters
            (0x60, 0x80) => {
                let header: [u8; 6] = match self.identity.kind {
                    ControllerKind::ProController => [0x50, 0xFD, 0x00, 0x00, 0xC6, 0x0F],
                    ControllerKind::JoyConL => [0x5E, 0x01, 0x00, 0x00, 0xF1, 0x0F],
                    ControllerKind::JoyConR => [0x5E, 0x01, 0x00, 0x00, 0x0F, 0xF0],
                };
                payload.extend_from_slice(&header);
                payload.extend_from_slice(&stick_parameters(self.identity.kind));
            }
            // Stick device parameters 2: always a copy of parameters 1
            (0x60, 0x98) => payload.extend_from_slice(&stick_parameters(self.identity.kind)),
            // Factory analog stick calibration
            (0x60, 0x3D) => {
                if self.identity.kind.has_left_stick() {
                    payload.extend_from_slice(&LEFT_STICK_FACTORY_CAL);
                } else {
                    payload.extend_from_slice(&[0xFF; 9]);
                }
                if self.identity.kind.has_right_stick() {
                    payload.extend_from_slice(&RIGHT_STICK_FACTORY_CAL);
                } else {
                    payload.extend_from_slice(&[0xFF; 9]);
                }
                // Spacer
                payload.push(0xFF);
                payload.extend_from_slice(&self.identity.colour_body);
                payload.extend_from_slice(&self.identity.colour_buttons);
            }
            // Six-axis motion sensor factory calibration
            (0x60, 0x20) => payload.extend_from_slice(&SIX_AXIS_CAL),
            // User analog stick calibration: none stored
            (0x80, 0x10) => payload.extend_from_slice(&[0xFF; 24]),
            _ => log::debug!("SPI read from unmapped region 0x{addr_top:02X}{addr_bottom:02X}"),
        }

        // Answer at most what was asked for
        let take = payload.len().min(read_length as usize);
        self.report[21..21 + take].copy_from_slice(&payload[..take]);
    }
}

/// Stick device parameters. Identical for every stick except for the dead
/// zone: 10% on Joy-Cons, 15% on the Pro Controller.
fn stick_parameters(kind: ControllerKind) -> [u8; 18] {
    let dead_zone = match kind {
        ControllerKind::ProController => 0x96,
        ControllerKind::JoyConL | ControllerKind::JoyConR => 0xAE,
    };
    [
        0x0F, 0x30, 0x61, dead_zone, 0x30, 0xF3, 0xD4, 0x14, 0x54, 0x41, 0x15, 0x54, 0xC7, 0x79,
        0x9C, 0x33, 0x36, 0x63,
    ]
}
