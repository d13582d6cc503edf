//! Thin command-line front-end over the controller manager.

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::config;
use crate::controller::input::Button;
use crate::controller::ControllerKind;
use crate::manager::{self, CreateController, ManagerClient};

/// Demo macro: backs out of the Grip/Order menu, opens system settings
/// and spins both sticks. Handy for eyeballing that pairing, buttons and
/// stick calibration all work.
const DEMO_MACRO: &str = "\
B 0.1s
0.1s
B 0.1s
0.1s
B 0.1s
0.1s
B 0.1s
1.5s
DPAD_RIGHT 0.075s
0.075s
A 0.1s
1.5s
DPAD_DOWN 1.0s
A 0.1s
0.25s
L_STICK_PRESS 0.1s
1.0s
L_STICK@-100+000 0.75s
L_STICK@+000+100 0.75s
L_STICK@+100+000 0.75s
L_STICK@+000-100 0.75s
B 0.1s
0.25s
R_STICK_PRESS 0.1s
1.0s
R_STICK@-100+000 0.75s
R_STICK@+000+100 0.75s
R_STICK@+100+000 0.75s
R_STICK@+000-100 0.75s
B 0.1s
0.4s
";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Commands>,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum KindArg {
    ProController,
    JoyConL,
    JoyConR,
}

impl std::fmt::Display for KindArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.to_possible_value()
            .expect("no skipped variants")
            .get_name()
            .fmt(f)
    }
}

impl From<KindArg> for ControllerKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::ProController => ControllerKind::ProController,
            KindArg::JoyConL => ControllerKind::JoyConL,
            KindArg::JoyConR => ControllerKind::JoyConR,
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Bring up the controllers described in a config file and keep them
    /// running until interrupted
    Run {
        /// Path to a YAML daemon configuration
        #[arg(long, short)]
        config: PathBuf,
    },
    /// List Bluetooth adapters available for emulated controllers
    Adapters,
    /// List previously connected Nintendo Switch consoles
    Switches,
    /// Create one controller and run a short demo macro on it
    Test {
        #[arg(long, value_enum, default_value_t = KindArg::ProController)]
        kind: KindArg,
        /// D-Bus adapter path, e.g. /org/bluez/hci0
        #[arg(long)]
        adapter: Option<String>,
    },
    /// Create one controller and run the given macro on it
    Macro {
        /// Macro text; read from --file when omitted
        text: Option<String>,
        #[arg(long, short)]
        file: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = KindArg::ProController)]
        kind: KindArg,
        /// D-Bus adapter path, e.g. /org/bluez/hci0
        #[arg(long)]
        adapter: Option<String>,
        /// Reconnect to a previously paired Switch at this address
        #[arg(long, short)]
        reconnect: Vec<String>,
    },
}

pub async fn main_cli(args: Args) -> Result<(), Box<dyn Error>> {
    let Some(cmd) = args.cmd else {
        return Ok(());
    };

    let connection = zbus::Connection::system().await?;
    let (manager, client) = manager::new(connection);

    match cmd {
        Commands::Adapters => {
            for adapter in client.get_available_adapters().await? {
                println!("{adapter}");
            }
            Ok(())
        }
        Commands::Switches => {
            let addresses = client.get_switch_addresses().await?;
            if addresses.is_empty() {
                println!("No previously connected Switch found");
            }
            for address in addresses {
                println!("{address}");
            }
            Ok(())
        }
        Commands::Run { config } => {
            spawn_manager(manager);
            run_daemon(client, &config).await
        }
        Commands::Test { kind, adapter } => {
            spawn_manager(manager);
            run_test(client, kind.into(), adapter).await
        }
        Commands::Macro {
            text,
            file,
            kind,
            adapter,
            reconnect,
        } => {
            let text = match (text, file) {
                (Some(text), _) => text,
                (None, Some(path)) => std::fs::read_to_string(path)?,
                (None, None) => return Err("no macro given: pass text or --file".into()),
            };
            spawn_manager(manager);
            run_macro(client, kind.into(), adapter, reconnect, text).await
        }
    }
}

fn spawn_manager(mut manager: manager::Manager) {
    tokio::spawn(async move {
        if let Err(err) = manager.run().await {
            log::error!("Manager stopped with error: {err}");
        }
    });
}

async fn run_daemon(client: ManagerClient, config_path: &std::path::Path) -> Result<(), Box<dyn Error>> {
    let config = config::load(config_path)?;
    for controller in &config.controllers {
        let request = controller.to_request()?;
        let index = client.create_controller(request).await?;
        log::info!("Controller {index} ({}) waiting for a Switch", controller.kind);
    }
    for index in client.state().indices() {
        client.wait_for_connection(index).await?;
        log::info!("Controller {index} connected");
    }
    // Servers keep running until the process is interrupted
    futures::future::pending::<()>().await;
    Ok(())
}

async fn run_test(
    client: ManagerClient,
    kind: ControllerKind,
    adapter: Option<String>,
) -> Result<(), Box<dyn Error>> {
    let mut request = CreateController::new(kind);
    request.adapter_path = adapter;
    let index = client.create_controller(request).await?;

    println!("Open the \"Change Grip/Order\" menu on the Switch to pair");
    client.wait_for_connection(index).await?;
    println!("Connected, running demo macro");

    client.macro_input(index, DEMO_MACRO, true).await?;
    client.press_buttons(index, &[Button::B], 0.1, 2.0, true).await?;
    println!("Demo finished");
    if let Some(state) = client.get_state(index) {
        println!("{}", serde_json::to_string_pretty(&state)?);
    }
    Ok(())
}

async fn run_macro(
    client: ManagerClient,
    kind: ControllerKind,
    adapter: Option<String>,
    reconnect: Vec<String>,
    text: String,
) -> Result<(), Box<dyn Error>> {
    let mut request = CreateController::new(kind);
    request.adapter_path = adapter;
    request.reconnect = reconnect
        .iter()
        .map(|address| address.parse())
        .collect::<Result<_, _>>()?;
    let index = client.create_controller(request).await?;

    client.wait_for_connection(index).await?;
    log::info!("Connected, running macro");
    client.macro_input(index, text, true).await?;
    println!("Macro finished");
    Ok(())
}
