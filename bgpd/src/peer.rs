//! The task that owns one peer's FSM and transport together (spec Section
//! 5: "one isolated task per peer FSM + its transport"). [`run`] interprets
//! the pure [`Fsm`] as an imperative shell: it owns the socket, the three
//! timers, and the channels connecting to the RIB task and the acceptor.

// SPDX-License-Identifier: AGPL-3.0-or-later

use std::net::Ipv4Addr;
use std::pin::Pin;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;

use bgpd_proto::prefix::Prefix;
use bgpd_proto::Message;

use crate::config::PeerConfig;
use crate::fsm::{Action, Event, Fsm, State, TimerKind};
use crate::registry::PeerId;
use crate::rib::{RibCommand, RibToPeer};
use crate::transport::{Received, Transport};

/// The standard BGP TCP port this speaker dials out to (spec Section 6);
/// distinct from the (configurable, default 1179) port it listens on.
const PEER_PORT: u16 = 179;

struct TimerSlot {
    generation: u64,
    sleep: Pin<Box<Sleep>>,
}

#[derive(Default)]
struct Timers {
    connect_retry: Option<TimerSlot>,
    hold: Option<TimerSlot>,
    keepalive: Option<TimerSlot>,
}

impl Timers {
    fn slot(&mut self, kind: TimerKind) -> &mut Option<TimerSlot> {
        match kind {
            TimerKind::ConnectRetry => &mut self.connect_retry,
            TimerKind::Hold => &mut self.hold,
            TimerKind::Keepalive => &mut self.keepalive,
        }
    }

    fn start(&mut self, kind: TimerKind, generation: u64, duration: std::time::Duration) {
        *self.slot(kind) = Some(TimerSlot { generation, sleep: Box::pin(tokio::time::sleep(duration)) });
    }

    fn cancel(&mut self, kind: TimerKind) {
        *self.slot(kind) = None;
    }
}

async fn wait_timer(slot: &mut Option<TimerSlot>) -> u64 {
    match slot {
        Some(timer) => {
            timer.sleep.as_mut().await;
            timer.generation
        }
        None => std::future::pending().await,
    }
}

/// Waits on the Idle-state auto-restart delay, if one is pending.
///
/// Not one of the FSM's own timers (spec Section 4.4 gives Idle none):
/// it's this task's linear stand-in for the spec's TODO'd exponential
/// backoff (spec Section 9: "a linear retry at conn_retry_time is
/// acceptable").
async fn wait_idle_restart(slot: &mut Option<Pin<Box<Sleep>>>) {
    match slot {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Runs one peer session for the process lifetime: establishes (or
/// accepts), negotiates, exchanges UPDATEs, and on any teardown loops back
/// to Idle and retries, until `shutdown` fires.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    local_asn: u16,
    local_id: Ipv4Addr,
    local_networks: Vec<Prefix>,
    config: PeerConfig,
    mut inbound: mpsc::Receiver<TcpStream>,
    mut from_rib: mpsc::Receiver<RibToPeer>,
    rib_commands: mpsc::Sender<RibCommand>,
    this_peer: PeerId,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut fsm = Fsm::new(local_asn, local_id, &config);
    let mut transport: Option<Transport> = None;
    let mut timers = Timers::default();
    let mut connecting: Option<JoinHandle<std::io::Result<TcpStream>>> = None;
    let mut idle_restart: Option<Pin<Box<Sleep>>> = None;

    let start_actions = fsm.step(Event::Start);
    apply(start_actions, &mut fsm, &mut transport, &mut timers, &mut connecting, &rib_commands, this_peer, &local_networks, &config).await;

    loop {
        let event = tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    Event::Stop
                } else {
                    continue;
                }
            }

            generation = wait_timer(&mut timers.connect_retry) => Event::Timeout(TimerKind::ConnectRetry, generation),
            generation = wait_timer(&mut timers.hold) => Event::Timeout(TimerKind::Hold, generation),
            generation = wait_timer(&mut timers.keepalive) => Event::Timeout(TimerKind::Keepalive, generation),

            () = wait_idle_restart(&mut idle_restart) => {
                idle_restart = None;
                if fsm.state() == State::Idle {
                    Event::Start
                } else {
                    continue;
                }
            }

            result = poll_connecting(&mut connecting), if connecting.is_some() => {
                connecting = None;
                match result {
                    Ok(stream) => {
                        transport = Some(Transport::new(stream));
                        Event::TcpOpen
                    }
                    Err(_) => Event::TcpOpenFailed,
                }
            }

            // Idle ignores tcp_open (spec Section 4.4); don't stash a socket
            // the FSM will never act on while it waits out its restart delay.
            Some(stream) = inbound.recv(), if transport.is_none() && fsm.state() != State::Idle => {
                transport = Some(Transport::new(stream));
                Event::TcpOpen
            }

            received = recv_transport(&mut transport), if transport.is_some() => {
                match received {
                    Received::Message(Message::Open(open), _) => Event::OpenReceived(open),
                    Received::Message(Message::Keepalive, _) => Event::KeepaliveReceived,
                    Received::Message(Message::Update(update), wire_len) => {
                        Event::UpdateReceived(update, wire_len)
                    }
                    Received::Message(Message::Notification(notification), _) => {
                        Event::NotificationReceived(notification.payload)
                    }
                    Received::HeaderError(notification) => {
                        if let Some(t) = transport.as_mut() {
                            let _ = t.send(Message::Notification(notification.clone())).await;
                        }
                        Event::NotificationReceived(notification.payload)
                    }
                    Received::Closed => Event::TcpClosed,
                    Received::Fatal => Event::TcpFatal,
                }
            }

            Some(RibToPeer(update)) = from_rib.recv() => {
                if fsm.state() == State::Established {
                    if let Some(t) = transport.as_mut() {
                        let _ = t.send(Message::Update(update)).await;
                    }
                }
                continue;
            }
        };

        let stopping = matches!(event, Event::Stop);
        let actions = fsm.step(event);
        apply(actions, &mut fsm, &mut transport, &mut timers, &mut connecting, &rib_commands, this_peer, &local_networks, &config).await;
        if stopping && fsm.state() == State::Idle {
            return;
        }
        // Any other teardown into Idle gets this session restarted, rather
        // than left to sit dead (spec Section 4.4: stop "schedules restart
        // into Idle"). spec Section 9's open question resolves the backoff
        // TODO as "a linear retry at conn_retry_time is acceptable".
        if fsm.state() == State::Idle && idle_restart.is_none() {
            idle_restart = Some(Box::pin(tokio::time::sleep(std::time::Duration::from_secs(fsm.conn_retry_time()))));
        }
    }
}

async fn poll_connecting(connecting: &mut Option<JoinHandle<std::io::Result<TcpStream>>>) -> std::io::Result<TcpStream> {
    match connecting.as_mut() {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(std::io::ErrorKind::Other, "connect task panicked")),
        },
        None => std::future::pending().await,
    }
}

async fn recv_transport(transport: &mut Option<Transport>) -> Received {
    match transport.as_mut() {
        Some(t) => t.recv().await,
        None => std::future::pending().await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn apply(
    actions: Vec<Action>,
    fsm: &mut Fsm,
    transport: &mut Option<Transport>,
    timers: &mut Timers,
    connecting: &mut Option<JoinHandle<std::io::Result<TcpStream>>>,
    rib_commands: &mpsc::Sender<RibCommand>,
    this_peer: PeerId,
    local_networks: &[Prefix],
    config: &PeerConfig,
) {
    for action in actions {
        match action {
            Action::SendMessage(message) => {
                if let Some(t) = transport.as_mut() {
                    if t.send(message).await.is_err() {
                        *transport = None;
                    }
                }
            }
            Action::StartTimer(kind, generation) => {
                let duration = timer_duration(kind, fsm, config);
                timers.start(kind, generation, duration);
            }
            Action::CancelTimer(kind) => timers.cancel(kind),
            Action::Connect => {
                let addr = std::net::SocketAddr::new(config.address.into(), PEER_PORT);
                *connecting = Some(tokio::spawn(async move { TcpStream::connect(addr).await }));
            }
            Action::CloseTransport => {
                if let Some(mut t) = transport.take() {
                    t.close().await;
                }
                *connecting = None;
            }
            Action::RibWithdrawPeer => {
                let _ = rib_commands.send(RibCommand::WithdrawPeer { peer: this_peer }).await;
            }
            Action::RibUpdate(update) => {
                let _ = rib_commands.send(RibCommand::Update { peer: this_peer, update }).await;
            }
            Action::RibPublishLocal => {
                let _ = rib_commands
                    .send(RibCommand::PublishLocal { peer: this_peer, networks: local_networks.to_vec() })
                    .await;
            }
        }
    }
}

fn timer_duration(kind: TimerKind, fsm: &Fsm, config: &PeerConfig) -> std::time::Duration {
    match kind {
        TimerKind::ConnectRetry => std::time::Duration::from_secs(fsm.conn_retry_time()),
        TimerKind::Hold => {
            let secs = if fsm.negotiated().effective_hold_time > 0 { fsm.negotiated().effective_hold_time } else { config.hold_time };
            std::time::Duration::from_secs(u64::from(secs))
        }
        TimerKind::Keepalive => std::time::Duration::from_secs(u64::from(fsm.negotiated().keepalive_interval.max(1))),
    }
}
