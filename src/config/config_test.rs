use crate::config::{parse_colour, ConfigError, DaemonConfig};
use crate::controller::ControllerKind;

#[test]
fn parses_a_full_controller_entry() {
    let yaml = "
controllers:
  - kind: pro_controller
    colour_body: \"32A852\"
    colour_buttons: \"0F0F0F\"
    frequency: 120
    reconnect:
      - \"DC:68:EB:10:20:30\"
  - kind: joy_con_l
";
    let config: DaemonConfig = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.controllers.len(), 2);

    let pro = &config.controllers[0];
    assert_eq!(pro.kind, ControllerKind::ProController);
    assert_eq!(pro.frequency, 120);
    let request = pro.to_request().unwrap();
    assert_eq!(request.colour_body, Some([0x32, 0xA8, 0x52]));
    assert_eq!(request.colour_buttons, Some([0x0F, 0x0F, 0x0F]));
    assert_eq!(request.reconnect.len(), 1);
    assert_eq!(request.reconnect[0].to_string(), "DC:68:EB:10:20:30");

    let joycon = &config.controllers[1];
    assert_eq!(joycon.kind, ControllerKind::JoyConL);
    // Defaults apply when fields are omitted
    assert_eq!(joycon.frequency, crate::constants::DEFAULT_FREQUENCY);
    let request = joycon.to_request().unwrap();
    assert_eq!(request.colour_body, None);
    assert!(request.reconnect.is_empty());
}

#[test]
fn rejects_unknown_fields() {
    let yaml = "
controllers:
  - kind: pro_controller
    color: \"32A852\"
";
    assert!(serde_yaml::from_str::<DaemonConfig>(yaml).is_err());
}

#[test]
fn rejects_bad_reconnect_addresses() {
    let yaml = "
controllers:
  - kind: joy_con_r
    reconnect: [\"not-an-address\"]
";
    let config: DaemonConfig = serde_yaml::from_str(yaml).unwrap();
    assert!(matches!(
        config.controllers[0].to_request(),
        Err(ConfigError::InvalidAddress(_))
    ));
}

#[test]
fn parses_colours() {
    assert_eq!(parse_colour("828282").unwrap(), [0x82, 0x82, 0x82]);
    assert_eq!(parse_colour("#0f0F0f").unwrap(), [0x0F, 0x0F, 0x0F]);
    assert!(parse_colour("82828").is_err());
    assert!(parse_colour("82828g").is_err());
}
