/**
 * RELAYLINK PANEL - Panneau de contrôle terminal du relais
 *
 * RÔLE : lit les commandes sur stdin (on/off/timer/threshold/battery), les
 * confie au contrôleur et affiche chaque événement comme une ligne de statut.
 *
 * ARCHITECTURE : une boucle select! unique sur stdin, la télémétrie batterie,
 * les statuts du contrôleur et Ctrl-C. La connexion broker part en tâche de
 * fond pour que le panneau reste utilisable pendant le handshake.
 */

mod commands;

use anyhow::{Context, Result};
use commands::{PanelCommand, HELP};
use relaylink_core::config::PanelConfig;
use relaylink_core::controller::is_offline;
use relaylink_core::telemetry::spawn_sysfs_source;
use relaylink_core::transport::MqttTransport;
use relaylink_core::{
    load_config, BrokerAddress, ConnectionMonitor, ControlError, Controller, SessionManager,
    StatusEvent, TelemetrySample,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "relaylink_core=info,relaylink_panel=info";
const RETRY_HINT: &str = "(offline, type 'connect' to retry)";

/// Ce dont la boucle a besoin pour servir une ligne de commande
struct Panel {
    controller: Arc<Controller>,
    config: PanelConfig,
    broker: BrokerAddress,
}

impl Panel {
    /// Lance le handshake en tâche de fond, avec un client id neuf à chaque fois
    fn connect_in_background(&self) {
        let controller = self.controller.clone();
        let broker = self.broker.clone();
        let client_id = self.config.client_id();
        tokio::spawn(async move {
            // l'échec est déjà affiché comme ligne de statut
            if let Err(e) = controller.connect(broker, client_id).await {
                debug!("connect failed: {}", e);
            }
        });
    }

    /// Returns false when the panel should exit
    async fn run_line(&self, line: &str) -> bool {
        let command = match line.parse::<PanelCommand>() {
            Ok(command) => command,
            Err(commands::ParseError::Empty) => return true,
            Err(e) => {
                println!("{e}");
                return true;
            }
        };

        let controller = &self.controller;
        let outcome = match command {
            PanelCommand::On => controller.turn_on().await,
            PanelCommand::Off => controller.turn_off().await,
            PanelCommand::Timer(duration) => controller.set_timer(&duration).await,
            PanelCommand::Threshold(value) => controller.set_threshold(&value).map(|_| ()),
            // lecture manuelle traitée sur place : la file télémétrie est
            // vidée par cette même boucle
            PanelCommand::Battery { level, scale } => controller
                .on_battery(TelemetrySample::new(level, scale))
                .await
                .map(|_| ()),
            PanelCommand::Connect => {
                self.connect_in_background();
                Ok(())
            }
            PanelCommand::Status => {
                println!(
                    "MQTT {} | topic {} | threshold {}% ({:?})",
                    controller.session_state(),
                    controller.control_topic(),
                    controller.threshold(),
                    controller.trigger_mode()
                );
                Ok(())
            }
            PanelCommand::Help => {
                println!("{HELP}");
                Ok(())
            }
            PanelCommand::Quit => return false,
        };

        report_outcome(outcome);
        true
    }
}

/// Failures already have a status line; offline ones get a hint on top
fn report_outcome(outcome: Result<(), ControlError>) {
    if let Err(e) = outcome {
        if is_offline(&e) {
            println!("{RETRY_HINT}");
        } else {
            debug!("command failed: {}", e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    // stdout est réservé aux lignes de statut
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config().await.context("Failed to load configuration")?;
    let broker = config.broker_address().context("Invalid broker address")?;
    let settings = config.session_settings().context("Invalid session settings")?;
    info!(
        "panel for {} via {} (threshold {}%, {:?} trigger)",
        config.control_topic(),
        broker,
        config.policy.threshold,
        config.policy.trigger
    );

    let transport = Arc::new(MqttTransport::new(config.mqtt_settings()));
    let session = SessionManager::new(transport, settings);
    let (status_tx, mut status_rx) = mpsc::unbounded_channel::<StatusEvent>();
    let controller = Arc::new(
        Controller::new(session.clone(), &config, status_tx).context("Invalid battery policy")?,
    );

    // télémétrie sysfs optionnelle ; sans source le canal se ferme et la
    // branche select! correspondante se désactive
    let (telemetry_tx, mut telemetry_rx) = mpsc::channel::<TelemetrySample>(16);
    let sysfs = config.telemetry.sysfs_path.clone().map(|path| {
        info!("polling battery capacity from {}", path.display());
        spawn_sysfs_source(path, Duration::from_secs(config.telemetry.poll_secs), telemetry_tx)
    });

    let panel = Panel {
        controller,
        config,
        broker,
    };
    panel.connect_in_background();

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut state_rx = session.watch_state();
    let mut monitor = ConnectionMonitor::new(*state_rx.borrow());

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !panel.run_line(&line).await {
                        break;
                    }
                }
                Ok(None) => {
                    info!("stdin closed");
                    break;
                }
                Err(e) => {
                    warn!("cannot read stdin: {}", e);
                    break;
                }
            },
            Some(sample) = telemetry_rx.recv() => {
                // rejet et échec d'envoi déjà rendus en statut
                let _ = panel.controller.on_battery(sample).await;
            },
            Some(event) = status_rx.recv() => println!("{event}"),
            Ok(()) = state_rx.changed() => {
                let state = *state_rx.borrow_and_update();
                debug!("session state: {}", state);
                if let Some(event) = monitor.observe(state) {
                    println!("{event}");
                    if event == StatusEvent::ConnectionLost {
                        println!("{RETRY_HINT}");
                    }
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            },
        }
    }

    if let Some(handle) = sysfs {
        handle.abort();
    }
    panel.controller.shutdown().await;
    while let Ok(event) = status_rx.try_recv() {
        println!("{event}");
    }
    Ok(())
}
