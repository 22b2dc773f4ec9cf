mod acceptor;
mod config;
mod fsm;
mod kernel;
mod peer;
mod registry;
mod rib;
mod transport;

use std::collections::HashMap;
use std::process::ExitCode;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use config::{Args, Config};
use registry::{PeerMeta, PeerRegistry};

fn setup_logger(level: log::LevelFilter) {
    let config = simplelog::ConfigBuilder::new().set_time_format_rfc3339().build();
    simplelog::TermLogger::init(level, config, simplelog::TerminalMode::Mixed, simplelog::ColorChoice::Auto)
        .expect("failed to initialize logger");
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    setup_logger(match args.verbose {
        0 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    });

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            log::error!("configuration error: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(args, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("fatal startup error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args, config: Config) -> anyhow::Result<()> {
    let local_networks: Vec<bgpd_proto::prefix::Prefix> =
        config.local.networks.iter().map(|s| config::parse_cidr(s)).collect::<anyhow::Result<_>>()?;

    let listener = TcpListener::bind((args.listen_addr, args.listen_port)).await?;
    log::info!("listening on {}:{}", args.listen_addr, args.listen_port);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (kernel_events_tx, kernel_events_rx) = mpsc::channel(64);
    let (kernel_commands_tx, kernel_commands_rx) = mpsc::channel(64);

    let mut registry = PeerRegistry::new();
    let mut peer_ids = Vec::new();
    let mut inbound_by_addr = HashMap::new();
    let mut peer_inbound_rx = HashMap::new();
    let mut peer_from_rib_rx = HashMap::new();

    for peer in &config.peers {
        let (to_rib_tx, to_rib_rx) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(4);
        let id = registry.register(PeerMeta {
            asn: peer.asn,
            address: peer.address,
            router_id: Some(peer.address),
            is_ebgp: peer.asn != config.local.asn,
            to_peer: to_rib_tx,
        });
        inbound_by_addr.insert(peer.address, inbound_tx);
        peer_inbound_rx.insert(id, inbound_rx);
        peer_from_rib_rx.insert(id, to_rib_rx);
        peer_ids.push(id);
    }

    let rib = rib::Rib::new(config.local.asn, config.local.address, registry, kernel_commands_tx);
    let (rib_commands_tx, rib_commands_rx) = mpsc::channel(256);
    let rib_task = tokio::spawn(rib.run(rib_commands_rx, kernel_events_rx));

    let kernel_task = tokio::spawn(kernel::run(kernel_events_tx, kernel_commands_rx));

    let acceptor_task = tokio::spawn(acceptor::run(listener, inbound_by_addr, shutdown_rx.clone()));

    let mut peer_tasks = Vec::new();
    for (id, peer) in peer_ids.into_iter().zip(&config.peers) {
        let inbound_rx = peer_inbound_rx.remove(&id).expect("inbound channel registered above");
        let from_rib_rx = peer_from_rib_rx.remove(&id).expect("rib channel registered above");
        peer_tasks.push(tokio::spawn(peer::run(
            config.local.asn,
            config.local.address,
            local_networks.clone(),
            peer.clone(),
            inbound_rx,
            from_rib_rx,
            rib_commands_tx.clone(),
            id,
            shutdown_rx.clone(),
        )));
    }
    drop(rib_commands_tx);

    tokio::signal::ctrl_c().await?;
    log::info!("shutdown requested, stopping peers");
    let _ = shutdown_tx.send(true);

    for task in peer_tasks {
        let _ = task.await;
    }
    acceptor_task.abort();
    kernel_task.abort();
    rib_task.abort();

    Ok(())
}
