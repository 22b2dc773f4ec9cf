//! The per-peer BGP finite-state machine (RFC 4271 Section 8).
//!
//! This is a pure state machine: [`Fsm::step`] takes the current state plus
//! one [`Event`] and returns the new state plus the [`Action`]s the caller
//! (the peer task in `peer.rs`) must carry out — send a message, (re)start
//! or cancel a timer, open/close the transport, or talk to the RIB. Keeping
//! transitions side-effect-free is what makes S3-style sequencing tests
//! (spec Section 8) possible without a live socket.

// SPDX-License-Identifier: AGPL-3.0-or-later

use bgpd_proto::notification::{CeaseSubcode, ErrorCode};
use bgpd_proto::validate;
use bgpd_proto::{Message, NotificationPayload, Open, Update};
use std::net::Ipv4Addr;

use crate::config::{Establishment, PeerConfig};

/// The six FSM states (spec Section 4.4).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    Connect,
    Active,
    OpenSent,
    OpenConfirm,
    Established,
}

/// Which timer an action/event concerns.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimerKind {
    ConnectRetry,
    Hold,
    Keepalive,
}

/// Events the peer task feeds into the FSM, in per-peer arrival order.
#[derive(Debug)]
pub enum Event {
    Start,
    /// A TCP connection is ready to use: either our active connect
    /// succeeded, or an inbound connection was accepted for this peer.
    TcpOpen,
    TcpOpenFailed,
    Timeout(TimerKind, u64),
    OpenReceived(Open),
    KeepaliveReceived,
    /// `wire_len` is the total on-wire message length (header + body) the
    /// header actually declared, threaded through from the codec rather
    /// than re-derived from `update` itself, so the length cross-check in
    /// `validate_update` tests something the codec couldn't already have
    /// silently guaranteed true.
    UpdateReceived(Update, usize),
    NotificationReceived(NotificationPayload),
    TcpClosed,
    TcpFatal,
    /// Administrative stop (shutdown, peer deconfigured).
    Stop,
}

/// Side effects the peer task must carry out after a transition.
#[derive(Debug)]
pub enum Action {
    SendMessage(Message),
    /// Start (or restart) a timer at its configured interval, tagged with
    /// the generation the caller must stamp the resulting timeout event
    /// with; a timeout whose generation doesn't match the FSM's current one
    /// for that timer is stale and must be dropped (spec Section 9).
    StartTimer(TimerKind, u64),
    CancelTimer(TimerKind),
    /// Initiate an outbound TCP connection to the peer (active mode).
    Connect,
    CloseTransport,
    /// Tell the RIB to drop every route this peer contributed.
    RibWithdrawPeer,
    /// Hand a validated UPDATE to the RIB's decision process.
    RibUpdate(Update),
    /// Publish this peer's locally-originated networks into the RIB /
    /// outbound session on entering Established.
    RibPublishLocal,
}

/// Negotiated session parameters, valid once the FSM reaches OpenConfirm.
#[derive(Copy, Clone, Debug, Default)]
pub struct Negotiated {
    pub effective_hold_time: u16,
    pub keepalive_interval: u16,
}

impl Negotiated {
    /// `effective = min(local, peer)`; `< 3` collapses both timers to 0
    /// (spec Section 4.4, S2).
    fn new(local_hold: u16, peer_hold: u16, configured_keepalive: u16) -> Self {
        let effective = local_hold.min(peer_hold);
        let effective_hold_time = if effective < 3 { 0 } else { effective };
        let keepalive_interval = if effective_hold_time == 0 {
            0
        } else {
            configured_keepalive.min(effective_hold_time / 3)
        };
        Self {
            effective_hold_time,
            keepalive_interval,
        }
    }
}

#[derive(Default)]
struct TimerGenerations {
    connect_retry: u64,
    hold: u64,
    keepalive: u64,
}

impl TimerGenerations {
    fn bump(&mut self, kind: TimerKind) -> u64 {
        let gen = match kind {
            TimerKind::ConnectRetry => &mut self.connect_retry,
            TimerKind::Hold => &mut self.hold,
            TimerKind::Keepalive => &mut self.keepalive,
        };
        *gen += 1;
        *gen
    }

    fn current(&self, kind: TimerKind) -> u64 {
        match kind {
            TimerKind::ConnectRetry => self.connect_retry,
            TimerKind::Hold => self.hold,
            TimerKind::Keepalive => self.keepalive,
        }
    }
}

/// The FSM for a single peer session.
pub struct Fsm {
    state: State,
    local_asn: u16,
    local_id: Ipv4Addr,
    peer_asn: u16,
    peer_addr: std::net::IpAddr,
    establishment: Establishment,
    local_hold_time: u16,
    configured_keepalive_time: u16,
    conn_retry_time: u64,
    negotiated: Negotiated,
    timer_gens: TimerGenerations,
}

impl Fsm {
    #[must_use]
    pub fn new(local_asn: u16, local_id: Ipv4Addr, peer: &PeerConfig) -> Self {
        Self {
            state: State::Idle,
            local_asn,
            local_id,
            peer_asn: peer.asn,
            peer_addr: peer.address.into(),
            establishment: peer.establishment,
            local_hold_time: peer.hold_time,
            configured_keepalive_time: peer.keepalive_time.unwrap_or(peer.hold_time / 3),
            conn_retry_time: peer.conn_retry_time,
            negotiated: Negotiated::default(),
            timer_gens: TimerGenerations::default(),
        }
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    #[must_use]
    pub fn negotiated(&self) -> Negotiated {
        self.negotiated
    }

    #[must_use]
    pub fn conn_retry_time(&self) -> u64 {
        self.conn_retry_time
    }

    fn start_timer(&mut self, kind: TimerKind) -> Action {
        let gen = self.timer_gens.bump(kind);
        Action::StartTimer(kind, gen)
    }

    fn goto(&mut self, state: State) {
        self.state = state;
    }

    /// Apply one event to the current state, returning the ordered actions
    /// to carry out. An unrecognized event in a state that doesn't expect
    /// it sends an FSM-error NOTIFICATION and drops to Idle (spec Section
    /// 4.4, "unknown events in established states").
    pub fn step(&mut self, event: Event) -> Vec<Action> {
        match (self.state, event) {
            // --- Idle ---
            (State::Idle, Event::Start) => {
                let mut actions = vec![self.start_timer(TimerKind::ConnectRetry)];
                if self.establishment == Establishment::Active {
                    actions.push(Action::Connect);
                    self.goto(State::Connect);
                } else {
                    self.goto(State::Active);
                }
                actions
            }
            (State::Idle, _) => vec![],

            // --- Connect ---
            (State::Connect, Event::TcpOpen) => {
                self.goto(State::OpenSent);
                vec![
                    Action::CancelTimer(TimerKind::ConnectRetry),
                    Action::SendMessage(self.open_message()),
                    self.start_timer(TimerKind::Hold),
                ]
            }
            (State::Connect, Event::TcpOpenFailed) => {
                self.goto(State::Active);
                vec![self.start_timer(TimerKind::ConnectRetry), Action::CloseTransport]
            }
            (State::Connect, Event::Timeout(TimerKind::ConnectRetry, gen))
                if gen == self.timer_gens.current(TimerKind::ConnectRetry) =>
            {
                vec![self.start_timer(TimerKind::ConnectRetry), Action::Connect]
            }
            (State::Connect, Event::Timeout(..)) => vec![],
            (State::Connect, _) => self.stop(None),

            // --- Active ---
            (State::Active, Event::TcpOpen) => {
                self.goto(State::OpenSent);
                vec![
                    Action::CancelTimer(TimerKind::ConnectRetry),
                    Action::SendMessage(self.open_message()),
                    self.start_timer(TimerKind::Hold),
                ]
            }
            (State::Active, Event::OpenReceived(open)) => self.handle_open_received(open),
            (State::Active, Event::Timeout(TimerKind::ConnectRetry, gen))
                if gen == self.timer_gens.current(TimerKind::ConnectRetry) =>
            {
                self.goto(State::Connect);
                vec![self.start_timer(TimerKind::ConnectRetry), Action::Connect]
            }
            (State::Active, Event::Timeout(..)) => vec![],
            (State::Active, _) => self.stop(None),

            // --- OpenSent ---
            (State::OpenSent, Event::OpenReceived(open)) => self.handle_open_received(open),
            (State::OpenSent, Event::Timeout(TimerKind::Hold, gen))
                if gen == self.timer_gens.current(TimerKind::Hold) =>
            {
                self.stop(Some(NotificationPayload::empty(
                    ErrorCode::HoldTimerExpired,
                    0,
                )))
            }
            (State::OpenSent, Event::TcpClosed) => {
                self.goto(State::Active);
                vec![Action::CloseTransport, self.start_timer(TimerKind::ConnectRetry)]
            }
            (State::OpenSent, Event::TcpFatal | Event::Stop) => self.stop(Some(
                NotificationPayload::empty(ErrorCode::Cease, 0),
            )),
            (State::OpenSent, Event::Timeout(..)) => vec![],
            (State::OpenSent, _) => self.stop(None),

            // --- OpenConfirm ---
            (State::OpenConfirm, Event::KeepaliveReceived) => {
                self.goto(State::Established);
                vec![Action::RibPublishLocal]
            }
            (State::OpenConfirm, Event::NotificationReceived(_)) => {
                self.goto(State::Idle);
                vec![Action::CloseTransport]
            }
            (State::OpenConfirm, Event::Timeout(TimerKind::Keepalive, gen))
                if gen == self.timer_gens.current(TimerKind::Keepalive) =>
            {
                vec![
                    self.start_timer(TimerKind::Keepalive),
                    Action::SendMessage(Message::Keepalive),
                ]
            }
            (State::OpenConfirm, Event::Timeout(TimerKind::Hold, gen))
                if gen == self.timer_gens.current(TimerKind::Hold) =>
            {
                self.goto(State::Idle);
                vec![Action::SendMessage(Message::Notification(
                    bgpd_proto::Notification::new(NotificationPayload::empty(ErrorCode::HoldTimerExpired, 0)),
                )), Action::CloseTransport]
            }
            (State::OpenConfirm, Event::Timeout(..)) => vec![],
            (State::OpenConfirm, Event::TcpClosed | Event::TcpFatal | Event::Stop) => self.stop(None),
            (State::OpenConfirm, _) => self.stop(None),

            // --- Established ---
            (State::Established, Event::Stop) => self.stop(Some(NotificationPayload::empty(
                ErrorCode::Cease,
                CeaseSubcode::AdministrativeShutdown as u8,
            ))),
            (State::Established, Event::UpdateReceived(update, wire_len)) => {
                let mut actions = vec![self.start_timer(TimerKind::Hold)];
                match self.validate_update(&update, wire_len) {
                    Ok(()) => {
                        actions.push(Action::RibUpdate(update));
                        actions
                    }
                    Err(payload) => {
                        self.goto(State::Idle);
                        actions.push(Action::SendMessage(Message::Notification(
                            bgpd_proto::Notification::new(payload),
                        )));
                        actions.push(Action::RibWithdrawPeer);
                        actions.push(Action::CloseTransport);
                        actions
                    }
                }
            }
            (State::Established, Event::KeepaliveReceived) => {
                vec![self.start_timer(TimerKind::Hold)]
            }
            (State::Established, Event::Timeout(TimerKind::Keepalive, gen))
                if gen == self.timer_gens.current(TimerKind::Keepalive) =>
            {
                vec![
                    self.start_timer(TimerKind::Keepalive),
                    Action::SendMessage(Message::Keepalive),
                ]
            }
            (State::Established, Event::Timeout(TimerKind::Hold, gen))
                if gen == self.timer_gens.current(TimerKind::Hold) =>
            {
                self.stop(Some(NotificationPayload::empty(ErrorCode::HoldTimerExpired, 0)))
            }
            (State::Established, Event::Timeout(..)) => vec![],
            (State::Established, Event::NotificationReceived(_) | Event::TcpClosed | Event::TcpFatal) => {
                self.stop(None)
            }
            (State::Established, _) => {
                // Unknown event while Established: FSM error, withdraw routes.
                self.goto(State::Idle);
                vec![
                    Action::SendMessage(Message::Notification(bgpd_proto::Notification::new(
                        NotificationPayload::empty(ErrorCode::Fsm, 0),
                    ))),
                    Action::RibWithdrawPeer,
                    Action::CloseTransport,
                ]
            }
        }
    }

    fn handle_open_received(&mut self, open: Open) -> Vec<Action> {
        match validate::open(&open, self.peer_asn, self.expected_peer_bgp_id()) {
            Ok(()) => {
                self.negotiated = Negotiated::new(self.local_hold_time, open.hold_time, self.configured_keepalive_time);
                self.goto(State::OpenConfirm);
                let mut actions = vec![Action::SendMessage(Message::Keepalive)];
                if self.negotiated.effective_hold_time > 0 {
                    actions.push(self.start_timer(TimerKind::Hold));
                    actions.push(self.start_timer(TimerKind::Keepalive));
                }
                actions
            }
            Err(payload) => self.stop(Some(payload)),
        }
    }

    /// The FSM does not itself know the peer's claimed BGP identifier ahead
    /// of time for eBGP sessions with dynamically-numbered peers; this
    /// speaker's design (spec Section 3) configures peers by address, not
    /// by identifier, so identifier validation is against the peer address
    /// interpreted as an IPv4 host. This matches how a two-party
    /// point-to-point eBGP session is normally configured.
    fn expected_peer_bgp_id(&self) -> Ipv4Addr {
        match self.peer_addr {
            std::net::IpAddr::V4(v4) => v4,
            std::net::IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        }
    }

    fn validate_update(&self, update: &Update, wire_len: usize) -> Result<(), NotificationPayload> {
        validate::update(wire_len, update.withdrawn_len(), update.attrs_len(), update, self.local_asn)
    }

    fn open_message(&self) -> Message {
        Message::Open(Open::new(self.local_asn, self.local_hold_time, self.local_id, vec![]))
    }

    /// Cancel all timers, close the transport, withdraw this peer's routes,
    /// optionally emit a NOTIFICATION, and drop to Idle (spec Section 4.4,
    /// "On any terminal stop transition").
    fn stop(&mut self, notify: Option<NotificationPayload>) -> Vec<Action> {
        self.goto(State::Idle);
        let mut actions = vec![
            Action::CancelTimer(TimerKind::ConnectRetry),
            Action::CancelTimer(TimerKind::Hold),
            Action::CancelTimer(TimerKind::Keepalive),
        ];
        if let Some(payload) = notify {
            actions.push(Action::SendMessage(Message::Notification(
                bgpd_proto::Notification::new(payload),
            )));
        }
        actions.push(Action::RibWithdrawPeer);
        actions.push(Action::CloseTransport);
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Establishment, PeerConfig};

    fn active_peer() -> PeerConfig {
        PeerConfig {
            asn: 65001,
            address: "192.0.2.2".parse().unwrap(),
            hold_time: 90,
            keepalive_time: None,
            conn_retry_time: 30,
            idle_time: 30,
            establishment: Establishment::Active,
        }
    }

    /// S3 — drive Idle -> Connect -> OpenSent -> OpenConfirm -> Established.
    #[test]
    fn s3_fsm_sequencing() {
        let peer = active_peer();
        let mut fsm = Fsm::new(65000, "192.0.2.1".parse().unwrap(), &peer);

        let actions = fsm.step(Event::Start);
        assert_eq!(fsm.state(), State::Connect);
        assert!(matches!(actions[1], Action::Connect));

        let actions = fsm.step(Event::TcpOpen);
        assert_eq!(fsm.state(), State::OpenSent);
        assert!(matches!(actions[1], Action::SendMessage(Message::Open(_))));

        let peer_open = Open::new(65001, 90, "192.0.2.2".parse().unwrap(), vec![]);
        let actions = fsm.step(Event::OpenReceived(peer_open));
        assert_eq!(fsm.state(), State::OpenConfirm);
        assert!(matches!(actions[0], Action::SendMessage(Message::Keepalive)));
        assert_eq!(fsm.negotiated().effective_hold_time, 90);
        assert_eq!(fsm.negotiated().keepalive_interval, 30);

        let actions = fsm.step(Event::KeepaliveReceived);
        assert_eq!(fsm.state(), State::Established);
        assert!(matches!(actions[0], Action::RibPublishLocal));
    }

    /// S2 — hold-time negotiation: peer hold 30 -> effective 30, ka 10.
    #[test]
    fn s2_hold_time_negotiation_normal() {
        let peer = active_peer();
        let mut fsm = Fsm::new(65000, "192.0.2.1".parse().unwrap(), &peer);
        let open = Open::new(65001, 30, "192.0.2.2".parse().unwrap(), vec![]);
        fsm.handle_open_received(open);
        assert_eq!(fsm.negotiated().effective_hold_time, 30);
        assert_eq!(fsm.negotiated().keepalive_interval, 10);
    }

    /// S2 — peer hold 2 -> effective 0, both timers disabled.
    #[test]
    fn s2_hold_time_collapses_below_three() {
        let peer = active_peer();
        let mut fsm = Fsm::new(65000, "192.0.2.1".parse().unwrap(), &peer);
        let open = Open::new(65001, 2, "192.0.2.2".parse().unwrap(), vec![]);
        fsm.handle_open_received(open);
        assert_eq!(fsm.negotiated().effective_hold_time, 0);
        assert_eq!(fsm.negotiated().keepalive_interval, 0);
    }

    /// S2 — peer hold 0 -> effective 0.
    #[test]
    fn s2_hold_time_zero_from_peer() {
        let peer = active_peer();
        let mut fsm = Fsm::new(65000, "192.0.2.1".parse().unwrap(), &peer);
        let open = Open::new(65001, 0, "192.0.2.2".parse().unwrap(), vec![]);
        fsm.handle_open_received(open);
        assert_eq!(fsm.negotiated().effective_hold_time, 0);
    }

    /// S4 — AS_PATH containing local ASN is rejected with (UPDATE, LOOP).
    #[test]
    fn s4_as_path_loop_tears_down_session() {
        use bgpd_proto::path_attr::{AsPath, AsSegment, AsSegmentType, Data, Flags, PathAttribute, PathAttributes, Origin};
        use bgpd_proto::prefix::PrefixList;

        let peer = active_peer();
        let mut fsm = Fsm::new(65000, "192.0.2.1".parse().unwrap(), &peer);
        fsm.step(Event::Start);
        fsm.step(Event::TcpOpen);
        let peer_open = Open::new(65001, 90, "192.0.2.2".parse().unwrap(), vec![]);
        fsm.step(Event::OpenReceived(peer_open));
        fsm.step(Event::KeepaliveReceived);
        assert_eq!(fsm.state(), State::Established);

        let update = Update {
            withdrawn_routes: PrefixList::default(),
            path_attrs: PathAttributes(vec![
                PathAttribute {
                    flags: Flags::new(false, true, false, false),
                    data: Data::Origin(Origin::Igp),
                },
                PathAttribute {
                    flags: Flags::new(false, true, false, false),
                    data: Data::AsPath(AsPath(vec![AsSegment {
                        type_: AsSegmentType::AsSequence,
                        asns: vec![65001, 65000],
                    }])),
                },
                PathAttribute {
                    flags: Flags::new(false, true, false, false),
                    data: Data::NextHop("192.0.2.2".parse().unwrap()),
                },
            ]),
            nlri: bgpd_proto::prefix::PrefixList(vec![bgpd_proto::prefix::Prefix::new(
                24,
                "10.0.0.0".parse().unwrap(),
            )]),
        };
        use bgpd_proto::component::Component;
        let wire_len = bgpd_proto::HEADER_LEN + update.encoded_len();
        let actions = fsm.step(Event::UpdateReceived(update, wire_len));
        assert_eq!(fsm.state(), State::Idle);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::SendMessage(Message::Notification(_)))));
        assert!(actions.iter().any(|a| matches!(a, Action::RibWithdrawPeer)));
    }

    /// spec Section 9's length cross-check: a `wire_len` shorter than the
    /// withdrawn/attrs lengths require is rejected with
    /// `(UPDATE, MalformedAttributeList)`, independent of whether `update`
    /// itself decoded cleanly.
    #[test]
    fn update_with_declared_length_shorter_than_attrs_is_rejected() {
        use bgpd_proto::notification::{ErrorCode, UpdateErrorSubcode};
        use bgpd_proto::path_attr::{Data, Flags, Origin, PathAttribute, PathAttributes};

        let peer = active_peer();
        let mut fsm = Fsm::new(65000, "192.0.2.1".parse().unwrap(), &peer);
        fsm.step(Event::Start);
        fsm.step(Event::TcpOpen);
        let peer_open = Open::new(65001, 90, "192.0.2.2".parse().unwrap(), vec![]);
        fsm.step(Event::OpenReceived(peer_open));
        fsm.step(Event::KeepaliveReceived);

        let update = Update {
            withdrawn_routes: Default::default(),
            path_attrs: PathAttributes(vec![PathAttribute {
                flags: Flags::new(false, true, false, false),
                data: Data::Origin(Origin::Igp),
            }]),
            nlri: Default::default(),
        };
        // Header declared a total message length too small to fit
        // `bgpd_proto::MIN_UPDATE_LEN + withdrawn_len + attrs_len`.
        let actions = fsm.step(Event::UpdateReceived(update, bgpd_proto::MIN_UPDATE_LEN));
        assert_eq!(fsm.state(), State::Idle);
        let notification = actions.iter().find_map(|a| match a {
            Action::SendMessage(Message::Notification(n)) => Some(n),
            _ => None,
        });
        let payload = &notification.expect("expected a NOTIFICATION action").payload;
        assert_eq!(payload.code, ErrorCode::Update);
        assert_eq!(payload.subcode, UpdateErrorSubcode::MalformedAttributeList as u8);
    }
}
