/// Device alias the Switch advertises itself under
pub const SWITCH_ALIAS: &str = "Nintendo Switch";

/// Bluetooth device class for a gamepad
pub const GAMEPAD_CLASS: &str = "0x002508";

/// UUID the controller SDP record is registered under
pub const SDP_UUID: &str = "00001000-0000-1000-8000-00805f9b34fb";

/// D-Bus object path for the registered SDP profile
pub const SDP_RECORD_PATH: &str = "/nxpad/controller";

/// Size in bytes of every HID report exchanged with the Switch
pub const REPORT_SIZE: usize = 50;

/// First byte of every controller-to-Switch input report
pub const INPUT_REPORT_HEADER: u8 = 0xA1;

/// First byte of every Switch-to-controller output report
pub const OUTPUT_REPORT_HEADER: u8 = 0xA2;

/// Default report frequency in Hz. Pro Controllers are driven at 120Hz by
/// real hardware and Joy-Cons at 60Hz, but 66Hz keeps a single emulated
/// controller stable on most adapters.
pub const DEFAULT_FREQUENCY: u32 = 66;
