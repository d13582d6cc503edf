//! BlueZ adapter management and the L2CAP HID transport.
//!
//! Adapter properties, SDP registration and device bookkeeping go through
//! the BlueZ D-Bus API. The device class and address cannot be set over
//! D-Bus without a daemon restart, so those two operations shell out to
//! `hciconfig`/`hcitool` the way the stock tooling does.

pub mod adapter1;
pub mod device1;
pub mod l2cap;
pub mod profile_manager1;

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::process::Command;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, Value};

use crate::constants::SWITCH_ALIAS;

use self::adapter1::Adapter1ProxyBlocking;
use self::device1::{Device1Proxy, Device1ProxyBlocking};
use self::l2cap::{AddrParseError, BdAddr};
use self::profile_manager1::ProfileManager1ProxyBlocking;

const BLUEZ_SERVICE: &str = "org.bluez";
const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
const DEVICE_INTERFACE: &str = "org.bluez.Device1";

const BLUETOOTH_SERVICE_PATH: &str = "/lib/systemd/system/bluetooth.service";
const BLUETOOTH_OVERRIDE_DIR: &str = "/run/systemd/system/bluetooth.service.d";
const BLUETOOTH_OVERRIDE_PATH: &str = "/run/systemd/system/bluetooth.service.d/nxpad.conf";

#[derive(Error, Debug)]
pub enum BluetoothError {
    #[error("dbus error: {0}")]
    DBus(#[from] zbus::Error),
    #[error("dbus error: {0}")]
    Fdo(#[from] zbus::fdo::Error),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("no usable bluetooth adapter found")]
    NoAdapter,
    #[error("`{command}` failed: {message}")]
    CommandFailed { command: String, message: String },
    #[error("required host utility `{0}` is not installed")]
    MissingUtility(&'static str),
    #[error(transparent)]
    InvalidAddress(#[from] AddrParseError),
    #[error("device class must be 8 characters, got {0:?}")]
    InvalidDeviceClass(String),
}

/// A handle on one BlueZ adapter over a blocking D-Bus connection.
///
/// Controller servers run on plain OS threads to hold their report cadence,
/// so everything here uses the blocking proxy API.
pub struct BtSession {
    conn: zbus::blocking::Connection,
    adapter: Adapter1ProxyBlocking<'static>,
    adapter_path: OwnedObjectPath,
    /// Kernel adapter id, e.g. "hci0". Used for hciconfig/hcitool calls.
    adapter_id: String,
}

impl BtSession {
    /// Open a session on the adapter at the given D-Bus path, or on the
    /// first adapter BlueZ reports when no path is given.
    pub fn new(adapter_path: Option<&str>) -> Result<Self, BluetoothError> {
        let conn = zbus::blocking::Connection::system()?;
        let path = match adapter_path {
            Some(path) => OwnedObjectPath::try_from(path).map_err(zbus::Error::from)?,
            None => first_adapter_path(&conn)?,
        };
        let adapter_id = path
            .as_str()
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        log::debug!("Using adapter under object path: {path}");
        let adapter = Adapter1ProxyBlocking::builder(&conn)
            .path(path.clone())?
            .build()?;
        Ok(Self {
            conn,
            adapter,
            adapter_path: path,
            adapter_id,
        })
    }

    pub fn adapter_path(&self) -> &str {
        self.adapter_path.as_str()
    }

    /// The adapter's Bluetooth address.
    pub fn address(&self) -> Result<BdAddr, BluetoothError> {
        let addr = self.adapter.address()?;
        Ok(BdAddr::from_str(&addr)?)
    }

    pub fn set_alias(&self, alias: &str) -> Result<(), BluetoothError> {
        self.adapter.set_alias(alias.to_string())?;
        Ok(())
    }

    pub fn set_powered(&self, powered: bool) -> Result<(), BluetoothError> {
        self.adapter.set_powered(powered)?;
        Ok(())
    }

    pub fn set_pairable(&self, pairable: bool) -> Result<(), BluetoothError> {
        self.adapter.set_pairable(pairable)?;
        Ok(())
    }

    pub fn set_pairable_timeout(&self, seconds: u32) -> Result<(), BluetoothError> {
        self.adapter.set_pairable_timeout(seconds)?;
        Ok(())
    }

    pub fn discoverable(&self) -> Result<bool, BluetoothError> {
        Ok(self.adapter.discoverable()?)
    }

    pub fn set_discoverable(&self, discoverable: bool) -> Result<(), BluetoothError> {
        self.adapter.set_discoverable(discoverable)?;
        Ok(())
    }

    pub fn set_discoverable_timeout(&self, seconds: u32) -> Result<(), BluetoothError> {
        self.adapter.set_discoverable_timeout(seconds)?;
        Ok(())
    }

    /// Sets the Bluetooth device class through hciconfig. BlueZ only honours
    /// class changes from its config file plus a daemon restart, so the
    /// D-Bus API is no use here.
    pub fn set_class(&self, device_class: &str) -> Result<(), BluetoothError> {
        if device_class.len() != 8 {
            return Err(BluetoothError::InvalidDeviceClass(device_class.to_string()));
        }
        run_command("hciconfig", &[self.adapter_id.as_str(), "class", device_class])?;
        Ok(())
    }

    /// Rewrites the adapter address with a vendor HCI command, then resets
    /// the interface so the change takes effect. Requires hcitool/hciconfig.
    pub fn set_address(&self, address: BdAddr) -> Result<(), BluetoothError> {
        let octets = address.octets();
        let bytes: Vec<String> = octets.iter().rev().map(|b| format!("0x{b:02X}")).collect();
        let mut args = vec!["-i", self.adapter_id.as_str(), "cmd", "0x3f", "0x001"];
        args.extend(bytes.iter().map(String::as_str));
        run_command("hcitool", &args)?;
        self.reset_adapter()
    }

    pub fn reset_adapter(&self) -> Result<(), BluetoothError> {
        run_command("hciconfig", &[self.adapter_id.as_str(), "reset"])?;
        Ok(())
    }

    /// Registers an SDP record on the BlueZ SDP server.
    pub fn register_profile(
        &self,
        profile_path: &str,
        uuid: &str,
        record_xml: &str,
    ) -> Result<(), BluetoothError> {
        let manager = ProfileManager1ProxyBlocking::new(&self.conn)?;
        let mut opts: HashMap<&str, Value> = HashMap::new();
        opts.insert("ServiceRecord", Value::from(record_xml));
        opts.insert("Role", Value::from("server"));
        opts.insert("RequireAuthentication", Value::from(false));
        opts.insert("RequireAuthorization", Value::from(false));
        opts.insert("AutoConnect", Value::from(true));
        let path = ObjectPath::try_from(profile_path).map_err(zbus::Error::from)?;
        manager.register_profile(&path, uuid, opts)?;
        Ok(())
    }

    /// Removes a remote device (and its pairing record) from the adapter.
    pub fn remove_device(&self, device_path: &str) -> Result<(), BluetoothError> {
        let path = ObjectPath::try_from(device_path).map_err(zbus::Error::from)?;
        self.adapter.remove_device(&path)?;
        Ok(())
    }

    /// D-Bus paths of currently connected devices aliased "Nintendo Switch".
    pub fn connected_switches(&self) -> Result<Vec<String>, BluetoothError> {
        let mut paths = Vec::new();
        for path in object_paths_with_interface(&self.conn, DEVICE_INTERFACE)? {
            let device = Device1ProxyBlocking::builder(&self.conn)
                .path(path.clone())?
                .build()?;
            let connected = device.connected().unwrap_or(false);
            let alias = device.alias().unwrap_or_default();
            if connected && alias.eq_ignore_ascii_case(SWITCH_ALIAS) {
                paths.push(path.to_string());
            }
        }
        Ok(paths)
    }
}

fn object_paths_with_interface(
    conn: &zbus::blocking::Connection,
    interface: &str,
) -> Result<Vec<OwnedObjectPath>, BluetoothError> {
    let manager = zbus::blocking::fdo::ObjectManagerProxy::builder(conn)
        .destination(BLUEZ_SERVICE)?
        .path("/")?
        .build()?;
    let objects = manager.get_managed_objects()?;
    let mut paths: Vec<OwnedObjectPath> = objects
        .into_iter()
        .filter(|(_, interfaces)| interfaces.keys().any(|name| name.as_str() == interface))
        .map(|(path, _)| path)
        .collect();
    paths.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    Ok(paths)
}

async fn object_paths_with_interface_async(
    conn: &zbus::Connection,
    interface: &str,
) -> Result<Vec<OwnedObjectPath>, BluetoothError> {
    let manager = zbus::fdo::ObjectManagerProxy::builder(conn)
        .destination(BLUEZ_SERVICE)?
        .path("/")?
        .build()
        .await?;
    let objects = manager.get_managed_objects().await?;
    let mut paths: Vec<OwnedObjectPath> = objects
        .into_iter()
        .filter(|(_, interfaces)| interfaces.keys().any(|name| name.as_str() == interface))
        .map(|(path, _)| path)
        .collect();
    paths.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    Ok(paths)
}

fn first_adapter_path(
    conn: &zbus::blocking::Connection,
) -> Result<OwnedObjectPath, BluetoothError> {
    object_paths_with_interface(conn, ADAPTER_INTERFACE)?
        .into_iter()
        .next()
        .ok_or(BluetoothError::NoAdapter)
}

/// D-Bus paths of every Bluetooth adapter on the system.
pub async fn list_adapters(conn: &zbus::Connection) -> Result<Vec<String>, BluetoothError> {
    let paths = object_paths_with_interface_async(conn, ADAPTER_INTERFACE).await?;
    Ok(paths.into_iter().map(|path| path.to_string()).collect())
}

/// Addresses of known devices carrying the given alias. Aliases compare
/// case-insensitively; BlueZ tends to uppercase them.
pub async fn find_devices_by_alias(
    conn: &zbus::Connection,
    alias: &str,
) -> Result<Vec<String>, BluetoothError> {
    let mut addresses = Vec::new();
    for path in object_paths_with_interface_async(conn, DEVICE_INTERFACE).await? {
        let device = Device1Proxy::builder(conn).path(path)?.build().await?;
        let device_alias = device.alias().await.unwrap_or_default();
        if !device_alias.eq_ignore_ascii_case(alias) {
            continue;
        }
        if let Ok(address) = device.address().await {
            addresses.push(address.to_uppercase());
        }
    }
    Ok(addresses)
}

/// Generates a controller-prefixed (`7C:BB:8A`) random adapter address.
pub fn random_controller_address() -> BdAddr {
    let tail: [u8; 3] = rand::random();
    BdAddr([0x7C, 0xBB, 0x8A, tail[0], tail[1], tail[2]])
}

/// Installs or removes a systemd override that restarts bluetoothd with
/// `--compat --noplugin=*`. The stock input plugin claims L2CAP PSMs 17/19
/// and has to be out of the way before a controller can bind them.
///
/// Idempotent: nothing is restarted when the override already matches.
pub fn set_input_plugin_disabled(disabled: bool) -> Result<(), BluetoothError> {
    // Only systemd-managed hosts are handled
    let init = run_command("ps", &["--no-headers", "-o", "comm", "1"])?;
    if init.trim() != "systemd" {
        log::debug!("systemd not found, leaving bluetoothd configuration alone");
        return Ok(());
    }

    if disabled {
        if Path::new(BLUETOOTH_OVERRIDE_PATH).is_file() {
            return Ok(());
        }
        let service = std::fs::read_to_string(BLUETOOTH_SERVICE_PATH)?;
        let exec_start = service
            .lines()
            .find(|line| line.starts_with("ExecStart="))
            .ok_or_else(|| BluetoothError::CommandFailed {
                command: BLUETOOTH_SERVICE_PATH.to_string(),
                message: "service file has no ExecStart line".to_string(),
            })?;
        let override_unit = format!(
            "[Service]\nExecStart=\n{} --compat --noplugin=*\n",
            exec_start.trim()
        );
        std::fs::create_dir_all(BLUETOOTH_OVERRIDE_DIR)?;
        std::fs::write(BLUETOOTH_OVERRIDE_PATH, override_unit)?;
    } else {
        match std::fs::remove_file(BLUETOOTH_OVERRIDE_PATH) {
            Ok(()) => (),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        }
    }

    run_command("systemctl", &["daemon-reload"])?;
    run_command("systemctl", &["restart", "bluetooth"])?;
    // Give bluetoothd a moment to finish coming back up
    thread::sleep(Duration::from_millis(500));
    log::debug!("bluetoothd reloaded (input plugin disabled: {disabled})");
    Ok(())
}

fn run_command(program: &'static str, args: &[&str]) -> Result<String, BluetoothError> {
    let output = Command::new(program).args(args).output().map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            BluetoothError::MissingUtility(program)
        } else {
            BluetoothError::Io(err)
        }
    })?;
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        return Err(BluetoothError::CommandFailed {
            command: format!("{program} {}", args.join(" ")),
            message: stderr.trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_addresses_carry_the_controller_prefix() {
        let address = random_controller_address().octets();
        assert_eq!(&address[..3], &[0x7C, 0xBB, 0x8A]);
    }
}
