//! Macro engine and live-input parsing.
//!
//! Macros are timed scripts of button/stick holds. They are parsed once,
//! up front, into a flat sequence of [MacroFrame]s (loop bodies replicated
//! at parse time); the per-cycle scheduler then only moves a cursor and
//! compares against a hold deadline. Live "direct input" packets bypass the
//! macro queue entirely and win for the cycle they are present.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use packed_struct::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The three button bytes of a standard input report.
///
/// Bit positions follow the Switch HID layout as captured from real
/// controllers; `bit_numbering = msb0` means field bit 7 is the byte's
/// least significant bit.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "3")]
pub struct ButtonState {
    // byte 0
    #[packed_field(bits = "0")]
    pub zr: bool,
    #[packed_field(bits = "1")]
    pub r: bool,
    #[packed_field(bits = "2")]
    pub jcl_sl: bool,
    #[packed_field(bits = "3")]
    pub jcl_sr: bool,
    #[packed_field(bits = "4")]
    pub a: bool,
    #[packed_field(bits = "5")]
    pub b: bool,
    #[packed_field(bits = "6")]
    pub x: bool,
    #[packed_field(bits = "7")]
    pub y: bool,
    // byte 1
    #[packed_field(bits = "10")]
    pub capture: bool,
    #[packed_field(bits = "11")]
    pub home: bool,
    #[packed_field(bits = "12")]
    pub l_stick_press: bool,
    #[packed_field(bits = "13")]
    pub r_stick_press: bool,
    #[packed_field(bits = "14")]
    pub plus: bool,
    #[packed_field(bits = "15")]
    pub minus: bool,
    // byte 2
    #[packed_field(bits = "16")]
    pub zl: bool,
    #[packed_field(bits = "17")]
    pub l: bool,
    #[packed_field(bits = "18")]
    pub jcr_sl: bool,
    #[packed_field(bits = "19")]
    pub jcr_sr: bool,
    #[packed_field(bits = "20")]
    pub dpad_left: bool,
    #[packed_field(bits = "21")]
    pub dpad_right: bool,
    #[packed_field(bits = "22")]
    pub dpad_up: bool,
    #[packed_field(bits = "23")]
    pub dpad_down: bool,
}

impl ButtonState {
    /// Sets the button named by a macro token. Returns false when the token
    /// names no button.
    fn press_token(&mut self, token: &str) -> bool {
        match token {
            "Y" => self.y = true,
            "X" => self.x = true,
            "B" => self.b = true,
            "A" => self.a = true,
            "JCL_SR" => self.jcl_sr = true,
            "JCL_SL" => self.jcl_sl = true,
            "R" => self.r = true,
            "ZR" => self.zr = true,
            "MINUS" => self.minus = true,
            "PLUS" => self.plus = true,
            "R_STICK_PRESS" => self.r_stick_press = true,
            "L_STICK_PRESS" => self.l_stick_press = true,
            "HOME" => self.home = true,
            "CAPTURE" => self.capture = true,
            "DPAD_DOWN" => self.dpad_down = true,
            "DPAD_UP" => self.dpad_up = true,
            "DPAD_RIGHT" => self.dpad_right = true,
            "DPAD_LEFT" => self.dpad_left = true,
            "JCR_SR" => self.jcr_sr = true,
            "JCR_SL" => self.jcr_sl = true,
            "L" => self.l = true,
            "ZL" => self.zl = true,
            _ => return false,
        }
        true
    }

    fn from_packet(packet: &InputPacket) -> Self {
        Self {
            y: packet.y,
            x: packet.x,
            b: packet.b,
            a: packet.a,
            jcl_sr: packet.jcl_sr,
            jcl_sl: packet.jcl_sl,
            r: packet.r,
            zr: packet.zr,
            minus: packet.minus,
            plus: packet.plus,
            r_stick_press: packet.r_stick.pressed,
            l_stick_press: packet.l_stick.pressed,
            home: packet.home,
            capture: packet.capture,
            dpad_down: packet.dpad_down,
            dpad_up: packet.dpad_up,
            dpad_right: packet.dpad_right,
            dpad_left: packet.dpad_left,
            jcr_sr: packet.jcr_sr,
            jcr_sl: packet.jcr_sl,
            l: packet.l,
            zl: packet.zl,
        }
    }

    pub fn to_bytes(self) -> [u8; 3] {
        // pack() on a 3-byte struct cannot fail
        self.pack().unwrap_or_default()
    }
}

/// Buttons addressable through macros and the typed API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    Y,
    X,
    B,
    A,
    JclSr,
    JclSl,
    R,
    Zr,
    Minus,
    Plus,
    RStickPress,
    LStickPress,
    Home,
    Capture,
    DpadDown,
    DpadUp,
    DpadRight,
    DpadLeft,
    JcrSr,
    JcrSl,
    L,
    Zl,
}

impl Button {
    pub fn token(&self) -> &'static str {
        match self {
            Self::Y => "Y",
            Self::X => "X",
            Self::B => "B",
            Self::A => "A",
            Self::JclSr => "JCL_SR",
            Self::JclSl => "JCL_SL",
            Self::R => "R",
            Self::Zr => "ZR",
            Self::Minus => "MINUS",
            Self::Plus => "PLUS",
            Self::RStickPress => "R_STICK_PRESS",
            Self::LStickPress => "L_STICK_PRESS",
            Self::Home => "HOME",
            Self::Capture => "CAPTURE",
            Self::DpadDown => "DPAD_DOWN",
            Self::DpadUp => "DPAD_UP",
            Self::DpadRight => "DPAD_RIGHT",
            Self::DpadLeft => "DPAD_LEFT",
            Self::JcrSr => "JCR_SR",
            Self::JcrSl => "JCR_SL",
            Self::L => "L",
            Self::Zl => "ZL",
        }
    }
}

impl std::fmt::Display for Button {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

/// The two analog sticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stick {
    Left,
    Right,
}

impl Stick {
    pub fn token(&self) -> &'static str {
        match self {
            Self::Left => "L_STICK",
            Self::Right => "R_STICK",
        }
    }
}

impl std::fmt::Display for Stick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

/// Per-stick calibration. The constants were measured from the factory
/// calibration of a reference controller and match the SPI blobs the
/// protocol serves.
#[derive(Debug, Clone, Copy)]
pub struct StickCalibration {
    pub center_x: f64,
    pub center_y: f64,
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

pub const LEFT_STICK_CALIBRATION: StickCalibration = StickCalibration {
    center_x: 2159.0,
    center_y: 1916.0,
    min_x: -1466.0,
    max_x: 1517.0,
    min_y: -1583.0,
    max_y: 1465.0,
};

pub const RIGHT_STICK_CALIBRATION: StickCalibration = StickCalibration {
    center_x: 2070.0,
    center_y: 2013.0,
    min_x: -1522.0,
    max_x: 1414.0,
    min_y: -1531.0,
    max_y: 1510.0,
};

impl Stick {
    fn calibration(&self) -> &'static StickCalibration {
        match self {
            Self::Left => &LEFT_STICK_CALIBRATION,
            Self::Right => &RIGHT_STICK_CALIBRATION,
        }
    }
}

/// Converts deflection ratios in [-1, +1] to the 3-byte little-endian
/// stick encoding: two 12-bit axis values packed across three bytes.
pub fn stick_position(stick: Stick, ratio_x: f64, ratio_y: f64) -> [u8; 3] {
    let cal = stick.calibration();
    let x = if ratio_x < 0.0 {
        ratio_x.abs() * cal.min_x + cal.center_x
    } else {
        ratio_x.abs() * cal.max_x + cal.center_x
    };
    let y = if ratio_y < 0.0 {
        ratio_y.abs() * cal.min_y + cal.center_y
    } else {
        ratio_y.abs() * cal.max_y + cal.center_y
    };
    let x = x.round() as u16;
    let y = y.round() as u16;
    [
        (x & 0xFF) as u8,
        (((y & 0xF) << 4) | (x >> 8)) as u8,
        (y >> 4) as u8,
    ]
}

/// Recovers approximate deflection ratios from packed stick bytes.
/// Inverse of [stick_position]; used to validate packed positions.
pub fn stick_ratios(stick: Stick, bytes: [u8; 3]) -> (f64, f64) {
    let cal = stick.calibration();
    let x = (bytes[0] as u16 | ((bytes[1] as u16 & 0xF) << 8)) as f64;
    let y = ((bytes[1] as u16 >> 4) | ((bytes[2] as u16) << 4)) as f64;
    let dx = x - cal.center_x;
    let dy = y - cal.center_y;
    let rx = if dx < 0.0 { -dx / cal.min_x } else { dx / cal.max_x };
    let ry = if dy < 0.0 { -dy / cal.min_y } else { dy / cal.max_y };
    (rx, ry)
}

/// Stick half of a direct-input packet. The discrete direction flags exist
/// for keyboard-style sources; the scheduler only reads the axis values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LeftStickInput {
    #[serde(rename = "PRESSED")]
    pub pressed: bool,
    #[serde(rename = "X_VALUE")]
    pub x_value: i32,
    #[serde(rename = "Y_VALUE")]
    pub y_value: i32,
    #[serde(rename = "LS_UP")]
    pub up: bool,
    #[serde(rename = "LS_LEFT")]
    pub left: bool,
    #[serde(rename = "LS_RIGHT")]
    pub right: bool,
    #[serde(rename = "LS_DOWN")]
    pub down: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RightStickInput {
    #[serde(rename = "PRESSED")]
    pub pressed: bool,
    #[serde(rename = "X_VALUE")]
    pub x_value: i32,
    #[serde(rename = "Y_VALUE")]
    pub y_value: i32,
    #[serde(rename = "RS_UP")]
    pub up: bool,
    #[serde(rename = "RS_LEFT")]
    pub left: bool,
    #[serde(rename = "RS_RIGHT")]
    pub right: bool,
    #[serde(rename = "RS_DOWN")]
    pub down: bool,
}

/// One cycle's worth of live controller input. The default value is the
/// canonical idle packet; a slot holding it means "no direct input".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct InputPacket {
    pub l_stick: LeftStickInput,
    pub r_stick: RightStickInput,
    pub dpad_up: bool,
    pub dpad_left: bool,
    pub dpad_right: bool,
    pub dpad_down: bool,
    pub l: bool,
    pub zl: bool,
    pub r: bool,
    pub zr: bool,
    pub jcl_sr: bool,
    pub jcl_sl: bool,
    pub jcr_sr: bool,
    pub jcr_sl: bool,
    pub plus: bool,
    pub minus: bool,
    pub home: bool,
    pub capture: bool,
    pub y: bool,
    pub x: bool,
    pub b: bool,
    pub a: bool,
}

impl InputPacket {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// The input surface merged into one outbound report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputFrame {
    pub buttons: [u8; 3],
    pub left_stick: Option<[u8; 3]>,
    pub right_stick: Option<[u8; 3]>,
}

impl InputFrame {
    fn from_packet(packet: &InputPacket) -> Self {
        Self {
            buttons: ButtonState::from_packet(packet).to_bytes(),
            left_stick: Some(stick_position(
                Stick::Left,
                packet.l_stick.x_value as f64 / 100.0,
                packet.l_stick.y_value as f64 / 100.0,
            )),
            right_stick: Some(stick_position(
                Stick::Right,
                packet.r_stick.x_value as f64 / 100.0,
                packet.r_stick.y_value as f64 / 100.0,
            )),
        }
    }
}

/// One parsed macro line: a set of inputs held for a duration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacroFrame {
    pub buttons: ButtonState,
    pub left_stick: Option<[u8; 3]>,
    pub right_stick: Option<[u8; 3]>,
    pub duration: Duration,
}

impl MacroFrame {
    fn output(&self) -> InputFrame {
        InputFrame {
            buttons: self.buttons.to_bytes(),
            left_stick: self.left_stick,
            right_stick: self.right_stick,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MacroError {
    #[error("line {line}: token {token:?} is not a button, stick position or duration")]
    UnknownToken { line: usize, token: String },
    #[error("line {line}: missing or malformed duration (expected e.g. \"0.1s\")")]
    BadDuration { line: usize },
    #[error("line {line}: malformed stick position {token:?}")]
    BadStickPosition { line: usize, token: String },
    #[error("line {line}: LOOP header has no iteration count")]
    BadLoopHeader { line: usize },
    #[error("line {line}: LOOP with no indented body")]
    MissingLoopBody { line: usize },
}

/// Parses macro text into its flat frame sequence. Loop bodies are
/// replicated here so the runtime never rescans the text.
pub fn parse_macro(text: &str) -> Result<Vec<MacroFrame>, MacroError> {
    let lines: Vec<String> = text
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            !trimmed.is_empty() && !trimmed.starts_with('#')
        })
        .map(str::to_string)
        .collect();
    let expanded = expand_loops(&lines)?;
    expanded
        .iter()
        .enumerate()
        .map(|(number, line)| parse_frame(line, number + 1))
        .collect()
}

/// Replaces LOOP blocks by `count` copies of their body, recursively. The
/// body is delimited by a consistent indent prefix taken from its first
/// line: a tab, four spaces, or two spaces.
fn expand_loops(lines: &[String]) -> Result<Vec<String>, MacroError> {
    let mut expanded = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let line = &lines[i];
        if !line.starts_with("LOOP") {
            expanded.push(line.clone());
            i += 1;
            continue;
        }

        let count: usize = line
            .split_whitespace()
            .nth(1)
            .and_then(|token| token.parse().ok())
            .ok_or(MacroError::BadLoopHeader { line: i + 1 })?;
        let first_body_line = lines
            .get(i + 1)
            .ok_or(MacroError::MissingLoopBody { line: i + 1 })?;
        let indent = if first_body_line.starts_with('\t') {
            "\t"
        } else if first_body_line.starts_with("    ") {
            "    "
        } else {
            "  "
        };

        let mut body = Vec::new();
        let mut next = i + 1;
        while next < lines.len() && lines[next].starts_with(indent) {
            body.push(lines[next].replacen(indent, "", 1));
            next += 1;
        }
        if body.is_empty() {
            return Err(MacroError::MissingLoopBody { line: i + 1 });
        }
        if body.iter().any(|line| line.starts_with("LOOP")) {
            body = expand_loops(&body)?;
        }
        for _ in 0..count {
            expanded.extend(body.iter().cloned());
        }
        i = next;
    }
    Ok(expanded)
}

/// Parses one hold or wait line. The final whitespace-separated token is
/// the duration; everything before it is button tokens and stick positions.
fn parse_frame(line: &str, number: usize) -> Result<MacroFrame, MacroError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let (&duration_token, input_tokens) = tokens
        .split_last()
        .ok_or(MacroError::BadDuration { line: number })?;

    let duration = duration_token
        .strip_suffix('s')
        .and_then(|raw| raw.parse::<f64>().ok())
        .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok())
        .ok_or(MacroError::BadDuration { line: number })?;

    let mut frame = MacroFrame {
        buttons: ButtonState::default(),
        left_stick: None,
        right_stick: None,
        duration,
    };
    for token in input_tokens {
        if let Some(position) = token.strip_prefix("L_STICK@") {
            frame.left_stick = Some(parse_stick_position(position, token, number)?);
        } else if let Some(position) = token.strip_prefix("R_STICK@") {
            frame.right_stick = Some(parse_stick_position(position, token, number)?);
        } else if !frame.buttons.press_token(token) {
            return Err(MacroError::UnknownToken {
                line: number,
                token: token.to_string(),
            });
        }
    }
    Ok(frame)
}

/// Parses the `<sx><xxx><sy><yyy>` part of a stick token, e.g. `+100-050`.
fn parse_stick_position(position: &str, token: &str, number: usize) -> Result<[u8; 3], MacroError> {
    let malformed = || MacroError::BadStickPosition {
        line: number,
        token: token.to_string(),
    };
    let parse_axis = |axis: Option<&str>| -> Result<f64, MacroError> {
        let axis = axis.ok_or_else(malformed)?;
        let magnitude: u32 = axis
            .get(1..)
            .ok_or_else(malformed)?
            .parse()
            .map_err(|_| malformed())?;
        if magnitude > 100 {
            return Err(malformed());
        }
        let ratio = magnitude as f64 / 100.0;
        match axis.as_bytes().first() {
            Some(b'+') => Ok(ratio),
            Some(b'-') => Ok(-ratio),
            _ => Err(malformed()),
        }
    };
    let ratio_x = parse_axis(position.get(0..4))?;
    let ratio_y = parse_axis(position.get(4..8))?;
    let stick = if token.starts_with("L_STICK") {
        Stick::Left
    } else {
        Stick::Right
    };
    Ok(stick_position(stick, ratio_x, ratio_y))
}

struct QueuedMacro {
    text: String,
    id: String,
}

struct RunningMacro {
    frames: VecDeque<MacroFrame>,
    /// None for internally generated macros (the re-pair press after a
    /// fallback reconnect) which nobody waits on.
    id: Option<String>,
}

struct ActiveFrame {
    frame: MacroFrame,
    started: Instant,
}

/// Per-controller input scheduler. Owns the macro queue and produces the
/// [InputFrame] merged into each outbound report.
#[derive(Default)]
pub struct InputParser {
    buffer: VecDeque<QueuedMacro>,
    current: Option<RunningMacro>,
    active: Option<ActiveFrame>,
    finished: Vec<String>,
}

impl InputParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues macro text for execution. Macros run strictly in arrival
    /// order.
    pub fn buffer_macro(&mut self, text: impl Into<String>, id: impl Into<String>) {
        self.buffer.push_back(QueuedMacro {
            text: text.into(),
            id: id.into(),
        });
    }

    /// Installs already-parsed frames ahead of the queue, without a
    /// completion id. Used for the automatic re-pair press after a
    /// fallback reconnect.
    pub fn preload_frames(&mut self, frames: Vec<MacroFrame>) {
        self.active = None;
        self.current = Some(RunningMacro {
            frames: frames.into(),
            id: None,
        });
    }

    /// Stops a macro wherever it is: in flight, queued, or unknown. The id
    /// is reported finished in every case so blocked waiters wake up.
    pub fn stop_macro(&mut self, id: &str) {
        if self
            .current
            .as_ref()
            .is_some_and(|current| current.id.as_deref() == Some(id))
        {
            self.current = None;
            self.active = None;
        } else {
            self.buffer.retain(|queued| queued.id != id);
        }
        self.finished.push(id.to_string());
    }

    /// Drops every queued and running macro.
    ///
    /// WARNING: unlike [InputParser::stop_macro], nothing is reported
    /// finished — a caller blocking on one of the cleared macros blocks
    /// forever.
    pub fn clear_macros(&mut self) {
        self.buffer.clear();
        self.current = None;
        self.active = None;
    }

    /// Ids of macros that completed or were stopped since the last call.
    pub fn take_finished(&mut self) -> Vec<String> {
        std::mem::take(&mut self.finished)
    }

    /// True when something would produce input this cycle.
    pub fn pending(&self) -> bool {
        self.active.is_some() || self.current.is_some() || !self.buffer.is_empty()
    }

    /// Runs one scheduler cycle and returns the frame to apply, if any.
    ///
    /// A non-idle direct input packet wins over macro playback and discards
    /// the partially-applied line. Otherwise the oldest buffered macro is
    /// parsed and its frames are held for their durations; frames are
    /// applied at least once even with a zero duration.
    pub fn poll(&mut self, direct: Option<&InputPacket>, now: Instant) -> Option<InputFrame> {
        if let Some(packet) = direct {
            if !packet.is_idle() {
                self.active = None;
                return Some(InputFrame::from_packet(packet));
            }
        }

        // Find or install the frame to hold this cycle
        while self.active.is_none() {
            if self.current.is_none() {
                let queued = self.buffer.pop_front()?;
                match parse_macro(&queued.text) {
                    Ok(frames) => {
                        self.current = Some(RunningMacro {
                            frames: frames.into(),
                            id: Some(queued.id),
                        });
                    }
                    Err(err) => {
                        log::warn!("Discarding unparseable macro {}: {err}", queued.id);
                        self.finished.push(queued.id);
                        continue;
                    }
                }
            }

            let current = self.current.as_mut()?;
            match current.frames.pop_front() {
                Some(frame) => {
                    self.active = Some(ActiveFrame {
                        frame,
                        started: now,
                    });
                }
                None => {
                    // Exhausted (or empty to begin with)
                    if let Some(done) = self.current.take().and_then(|current| current.id) {
                        self.finished.push(done);
                    }
                }
            }
        }

        let active = self.active.as_ref()?;
        let frame = active.frame.output();
        if now.duration_since(active.started) > active.frame.duration {
            self.active = None;
            let exhausted = self
                .current
                .as_ref()
                .is_some_and(|current| current.frames.is_empty());
            if exhausted {
                if let Some(done) = self.current.take().and_then(|current| current.id) {
                    self.finished.push(done);
                }
            }
        }
        Some(frame)
    }
}

/// The short macro that re-registers a controller with the Switch after a
/// fallback reconnect, per kind: L+R on a Pro Controller, SL+SR on a
/// Joy-Con.
pub fn repair_frames(kind: super::ControllerKind) -> Vec<MacroFrame> {
    let mut buttons = ButtonState::default();
    match kind {
        super::ControllerKind::ProController => {
            buttons.l = true;
            buttons.r = true;
        }
        super::ControllerKind::JoyConL => {
            buttons.jcl_sl = true;
            buttons.jcl_sr = true;
        }
        super::ControllerKind::JoyConR => {
            buttons.jcr_sl = true;
            buttons.jcr_sr = true;
        }
    }
    vec![MacroFrame {
        buttons,
        left_stick: None,
        right_stick: None,
        duration: Duration::ZERO,
    }]
}
