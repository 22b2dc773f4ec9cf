//! Listens for inbound BGP sessions and demultiplexes them to the matching
//! peer task by remote address (spec Section 4, component 7).

// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::HashMap;
use std::net::Ipv4Addr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

/// Runs the acceptor until `shutdown` fires. Connections from addresses not
/// present in `inbound_by_addr` are rejected immediately.
pub async fn run(listener: TcpListener, inbound_by_addr: HashMap<Ipv4Addr, mpsc::Sender<TcpStream>>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => handle_accepted(stream, addr, &inbound_by_addr),
                    Err(err) => log::warn!("accept error: {err}"),
                }
            }
        }
    }
}

fn handle_accepted(stream: TcpStream, addr: std::net::SocketAddr, inbound_by_addr: &HashMap<Ipv4Addr, mpsc::Sender<TcpStream>>) {
    let ip = match addr.ip() {
        std::net::IpAddr::V4(v4) => v4,
        std::net::IpAddr::V6(_) => {
            log::warn!("rejecting inbound IPv6 connection from {addr}");
            return;
        }
    };
    match inbound_by_addr.get(&ip) {
        Some(sender) => {
            let sender = sender.clone();
            tokio::spawn(async move {
                if sender.send(stream).await.is_err() {
                    log::warn!("peer task for {ip} is gone, dropping inbound connection");
                }
            });
        }
        None => log::warn!("rejecting inbound connection from unconfigured peer {ip}"),
    }
}
