//! # D-Bus interface proxy for: `org.bluez.Adapter1`
//!
//! Hand-written from the BlueZ adapter-api introspection data. Only the
//! members the daemon touches are declared.

use zbus::proxy;
use zbus::zvariant::ObjectPath;

#[proxy(
    interface = "org.bluez.Adapter1",
    default_service = "org.bluez",
    assume_defaults = true
)]
pub trait Adapter1 {
    /// Removes a remote device along with its pairing information.
    fn remove_device(&self, device: &ObjectPath<'_>) -> zbus::Result<()>;

    /// The Bluetooth device address.
    #[zbus(property)]
    fn address(&self) -> zbus::Result<String>;

    /// The Bluetooth friendly name, visible to remote devices.
    #[zbus(property)]
    fn alias(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn set_alias(&self, alias: String) -> zbus::Result<()>;

    #[zbus(property)]
    fn powered(&self) -> zbus::Result<bool>;

    #[zbus(property)]
    fn set_powered(&self, powered: bool) -> zbus::Result<()>;

    #[zbus(property)]
    fn pairable(&self) -> zbus::Result<bool>;

    #[zbus(property)]
    fn set_pairable(&self, pairable: bool) -> zbus::Result<()>;

    /// Pairable timeout in seconds. 0 means no timeout.
    #[zbus(property)]
    fn pairable_timeout(&self) -> zbus::Result<u32>;

    #[zbus(property)]
    fn set_pairable_timeout(&self, seconds: u32) -> zbus::Result<()>;

    #[zbus(property)]
    fn discoverable(&self) -> zbus::Result<bool>;

    #[zbus(property)]
    fn set_discoverable(&self, discoverable: bool) -> zbus::Result<()>;

    /// Discoverable timeout in seconds. 0 means always discoverable.
    #[zbus(property)]
    fn discoverable_timeout(&self) -> zbus::Result<u32>;

    #[zbus(property)]
    fn set_discoverable_timeout(&self, seconds: u32) -> zbus::Result<()>;

    /// The Bluetooth class of device, as registered with the kernel.
    #[zbus(property)]
    fn class(&self) -> zbus::Result<u32>;
}
