//! # D-Bus interface proxy for: `org.bluez.Device1`
//!
//! Hand-written from the BlueZ device-api introspection data. Only the
//! members the daemon touches are declared.

use zbus::proxy;

#[proxy(
    interface = "org.bluez.Device1",
    default_service = "org.bluez",
    assume_defaults = true
)]
pub trait Device1 {
    fn connect(&self) -> zbus::Result<()>;

    fn disconnect(&self) -> zbus::Result<()>;

    /// The Bluetooth device address of the remote device.
    #[zbus(property)]
    fn address(&self) -> zbus::Result<String>;

    /// The name alias for the remote device.
    #[zbus(property)]
    fn alias(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn connected(&self) -> zbus::Result<bool>;

    #[zbus(property)]
    fn paired(&self) -> zbus::Result<bool>;
}
