//! # D-Bus interface proxy for: `org.bluez.ProfileManager1`
//!
//! Used to install the controller SDP record on the BlueZ SDP server.

use std::collections::HashMap;

use zbus::proxy;
use zbus::zvariant::{ObjectPath, Value};

#[proxy(
    interface = "org.bluez.ProfileManager1",
    default_service = "org.bluez",
    default_path = "/org/bluez"
)]
pub trait ProfileManager1 {
    /// Registers a profile (SDP record) with the given UUID and options.
    fn register_profile(
        &self,
        profile: &ObjectPath<'_>,
        uuid: &str,
        options: HashMap<&str, Value<'_>>,
    ) -> zbus::Result<()>;

    /// Unregisters a previously registered profile.
    fn unregister_profile(&self, profile: &ObjectPath<'_>) -> zbus::Result<()>;
}
