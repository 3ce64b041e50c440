//! Command-line interface for the SPV tracker.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Arg, Command};
use tokio::signal;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use dashcore::{Network, ScriptBuf};
use spv_tracker::network::TcpTransport;
use spv_tracker::supervisor::{load_or_init_chain, load_or_init_cursor, Connector};
use spv_tracker::{ChainStore, ClientConfig, ReconnectSupervisor, SpvEvent, Tracker};

struct PeerConnector {
    config: ClientConfig,
}

impl Connector for PeerConnector {
    type Transport = TcpTransport;

    fn new_transport(&self) -> TcpTransport {
        TcpTransport::new(
            self.config.peer_address,
            self.config.network,
            self.config.connect_timeout,
            self.config.user_agent.clone(),
        )
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = Command::new("spv-tracker")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Bloom-filter SPV client tracking watched scripts over a single peer")
        .arg(
            Arg::new("network")
                .short('n')
                .long("network")
                .value_name("NETWORK")
                .help("Network to connect to")
                .value_parser(["mainnet", "testnet", "regtest"])
                .default_value("mainnet"),
        )
        .arg(
            Arg::new("peer")
                .short('p')
                .long("peer")
                .value_name("ADDRESS")
                .help("Peer address to connect to")
                .required(true),
        )
        .arg(
            Arg::new("data-dir")
                .short('d')
                .long("data-dir")
                .value_name("DIR")
                .help("Data directory for chain and cursor persistence")
                .default_value("./spv-tracker-data"),
        )
        .arg(
            Arg::new("no-persist")
                .long("no-persist")
                .help("Keep all state in memory")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level")
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .default_value("info"),
        )
        .arg(
            Arg::new("watch-address")
                .short('w')
                .long("watch-address")
                .value_name("ADDRESS")
                .help("Address to watch for transactions (can be used multiple times)")
                .action(clap::ArgAction::Append),
        )
        .arg(
            Arg::new("watch-script")
                .long("watch-script")
                .value_name("HEX")
                .help("Raw script to watch, hex encoded (can be used multiple times)")
                .action(clap::ArgAction::Append),
        )
        .arg(
            Arg::new("false-positive-rate")
                .long("false-positive-rate")
                .value_name("RATE")
                .help("Bloom filter false-positive rate")
                .value_parser(clap::value_parser!(f64)),
        )
        .get_matches();

    let log_level = matches
        .get_one::<String>("log-level")
        .unwrap()
        .parse()
        .expect("validated by clap");
    spv_tracker::init_console_logging(Some(log_level))?;

    let network = match matches.get_one::<String>("network").unwrap().as_str() {
        "mainnet" => Network::Dash,
        "testnet" => Network::Testnet,
        "regtest" => Network::Regtest,
        _ => unreachable!(),
    };

    let peer_address = match matches.get_one::<String>("peer").unwrap().parse() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("Invalid peer address: {}", e);
            process::exit(1);
        }
    };

    let mut config = ClientConfig::new(network, peer_address);
    if !matches.get_flag("no-persist") {
        config = config.with_data_dir(PathBuf::from(matches.get_one::<String>("data-dir").unwrap()));
    }
    if let Some(rate) = matches.get_one::<f64>("false-positive-rate") {
        config = config.with_false_positive_rate(*rate);
    }
    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        process::exit(1);
    }

    tracing::info!("Starting SPV tracker");
    tracing::info!("Network: {:?}", network);
    tracing::info!("Peer: {}", config.peer_address);

    let store = match &config.data_dir {
        Some(dir) => Some(ChainStore::open(dir.clone()).await?),
        None => None,
    };

    let chain = load_or_init_chain(store.as_ref(), network).await;
    let cursor = load_or_init_cursor(store.as_ref(), network).await;
    let chain = Arc::new(RwLock::new(chain));

    let tracker = Arc::new(Tracker::new());
    if let Some(store) = &store {
        if let Some(bytes) = store.load_watch_list().await? {
            tracker.load_scripts(&bytes).await?;
        }
    }

    if let Some(addresses) = matches.get_many::<String>("watch-address") {
        for addr_str in addresses {
            match addr_str.parse::<dashcore::Address<dashcore::address::NetworkUnchecked>>() {
                Ok(addr) => match addr.require_network(network) {
                    Ok(addr) => {
                        tracker.add_script(addr.script_pubkey()).await;
                    }
                    Err(_) => {
                        eprintln!("Address '{}' is not valid for {:?}", addr_str, network);
                        process::exit(1);
                    }
                },
                Err(e) => {
                    eprintln!("Invalid address '{}': {}", addr_str, e);
                    process::exit(1);
                }
            }
        }
    }
    if let Some(scripts) = matches.get_many::<String>("watch-script") {
        for script_hex in scripts {
            match hex::decode(script_hex) {
                Ok(bytes) => {
                    tracker.add_script(ScriptBuf::from(bytes)).await;
                }
                Err(e) => {
                    eprintln!("Invalid script hex '{}': {}", script_hex, e);
                    process::exit(1);
                }
            }
        }
    }
    if tracker.scripts().await.is_empty() {
        eprintln!("Nothing to watch: pass --watch-address or --watch-script");
        process::exit(1);
    }

    // Print operations and height changes as they happen.
    let mut events = tracker.take_event_receiver().await.expect("receiver untaken");
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SpvEvent::NewOperation(op) => {
                    tracing::info!(
                        "{} {} via tx {} ({})",
                        if op.inbound { "Received on" } else { "Spent from" },
                        op.script,
                        op.txid,
                        match op.block {
                            Some(location) => format!("height {}", location.height),
                            None => "unconfirmed".to_string(),
                        }
                    );
                }
                SpvEvent::HeightChanged(height) => {
                    tracing::info!("Chain tip at height {}", height);
                }
            }
        }
    });

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            signal_token.cancel();
        }
    });

    let supervisor = ReconnectSupervisor::new(
        PeerConnector {
            config: config.clone(),
        },
        config,
        chain,
        tracker,
        store,
        cursor,
        shutdown,
    );
    let final_cursor = supervisor.run().await?;
    tracing::info!("Stopped at scan height {}", final_cursor.height());

    Ok(())
}
