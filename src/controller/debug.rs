//! Trace-level report formatting.

use std::fmt::Write;

fn format_report(data: &[u8], split: usize, name: &str) -> String {
    let mut payload = String::new();
    let mut subcommand = String::new();
    for (i, byte) in data.iter().enumerate() {
        let target = if i <= split {
            &mut payload
        } else {
            &mut subcommand
        };
        let _ = write!(target, "0x{byte:02X} ");
    }
    format!("--- {name} Msg ---\nPayload:    {payload}\nSubcommand: {subcommand}")
}

/// Hex dump of a controller-to-Switch report, split after the input body.
pub fn format_controller_report(data: &[u8]) -> String {
    format_report(data, 13, "Controller")
}

/// Hex dump of a Switch-to-controller report, split before the subcommand.
pub fn format_switch_report(data: &[u8]) -> String {
    format_report(data, 10, "Switch")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_payload_from_subcommand() {
        let formatted = format_report(&[0xA2, 0x01, 0xFF], 1, "Test");
        assert!(formatted.contains("Payload:    0xA2 0x01"));
        assert!(formatted.contains("Subcommand: 0xFF"));
    }
}
