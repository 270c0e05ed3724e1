use std::sync::Arc;

use ftms_gateway::ble_transport::{self, BleTransport};
use ftms_gateway::config;
use ftms_gateway::debug_server::{self, DebugTransport, Routed, DEFAULT_DEBUG_PORT};
use ftms_gateway::gateway::Gateway;
use ftms_gateway::transport::GattTransport;
use ftms_gateway::treadmill::{self, TreadmillIo, DEFAULT_HRM_SOCKET, DEFAULT_SOCKET};

const DEFAULT_CONFIG: &str = "ftms_config.json";

struct Args {
    socket_path: String,
    hrm_socket: Option<String>,
    config_path: String,
    debug_port: u16,
    ble: bool,
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let argv: Vec<String> = std::env::args().collect();
    let args = parse_args(&argv);
    log::info!(
        "FTMS daemon starting, socket: {}, config: {}, debug port: {}",
        args.socket_path,
        args.config_path,
        args.debug_port
    );

    let cfg = match config::load(&args.config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };

    let (treadmill, commands) = TreadmillIo::new();
    let (debug, debug_inbound) = DebugTransport::new();
    let (transport, ble_inbound): (Arc<dyn GattTransport>, _) = if args.ble {
        let (ble, inbound) = BleTransport::new();
        let routed: Arc<dyn GattTransport> = Arc::new(Routed::new(ble, debug.clone()));
        (routed, Some(inbound))
    } else {
        log::info!("BLE disabled, debug server only");
        (debug.clone() as Arc<dyn GattTransport>, None)
    };

    let gateway = Gateway::new(cfg, transport, treadmill.clone());
    gateway.start();

    let hrm_socket = args.hrm_socket.clone();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Received shutdown signal");
        }
        result = treadmill::run(treadmill.clone(), &args.socket_path) => {
            if let Err(e) = result {
                log::error!("Treadmill task exited with error: {}", e);
            }
        }
        result = treadmill::run_commands(&args.socket_path, commands) => {
            if let Err(e) = result {
                log::error!("Treadmill command task exited with error: {}", e);
            }
        }
        result = async {
            match hrm_socket {
                Some(path) => treadmill::run_hrm(treadmill.clone(), &path).await,
                None => std::future::pending().await,
            }
        } => {
            if let Err(e) = result {
                log::error!("HRM task exited with error: {}", e);
            }
        }
        result = async {
            match ble_inbound {
                Some(inbound) => ble_transport::run(gateway.clone(), inbound).await,
                None => std::future::pending().await,
            }
        } => {
            if let Err(e) = result {
                log::error!("BLE transport exited with error: {}", e);
            }
        }
        result = debug_server::run(gateway.clone(), debug_inbound, args.debug_port) => {
            if let Err(e) = result {
                log::error!("Debug server exited with error: {}", e);
            }
        }
    }

    gateway.stop();
    log::info!("FTMS daemon shutting down");
}

fn parse_args(argv: &[String]) -> Args {
    let mut args = Args {
        socket_path: DEFAULT_SOCKET.to_string(),
        hrm_socket: None,
        config_path: DEFAULT_CONFIG.to_string(),
        debug_port: DEFAULT_DEBUG_PORT,
        ble: true,
    };
    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--socket" => {
                if let Some(path) = argv.get(i + 1) {
                    args.socket_path = path.clone();
                    i += 1;
                }
            }
            "--hrm-socket" => {
                // Bare flag means the HRM daemon's default socket
                match argv.get(i + 1).filter(|v| !v.starts_with("--")) {
                    Some(path) => {
                        args.hrm_socket = Some(path.clone());
                        i += 1;
                    }
                    None => args.hrm_socket = Some(DEFAULT_HRM_SOCKET.to_string()),
                }
            }
            "--config" => {
                if let Some(path) = argv.get(i + 1) {
                    args.config_path = path.clone();
                    i += 1;
                }
            }
            "--debug-port" => {
                if let Some(port) = argv.get(i + 1) {
                    args.debug_port = port.parse().unwrap_or_else(|_| {
                        log::warn!(
                            "Invalid --debug-port '{}', using {}",
                            port,
                            DEFAULT_DEBUG_PORT
                        );
                        DEFAULT_DEBUG_PORT
                    });
                    i += 1;
                }
            }
            "--no-ble" => args.ble = false,
            _ => {}
        }
        i += 1;
    }
    args
}
