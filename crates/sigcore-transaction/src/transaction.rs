//! A single transaction: its kind, current state, and the retransmission
//! bookkeeping the timers drive.

use std::net::SocketAddr;
use std::time::Duration;

use sigcore_sip::{Method, SipMessage, StatusCode};
use sigcore_transport::Protocol;

use crate::key::TransactionKey;
use crate::state::{ClientInviteState, ClientNonInviteState, ServerInviteState, ServerNonInviteState, TransactionState};
use crate::timer::{TimerKind, TimerSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    ServerInvite,
    ServerNonInvite,
    ClientInvite,
    ClientNonInvite,
}

impl Kind {
    pub fn for_request(method: &Method, is_server: bool) -> Self {
        match (method.is_invite(), is_server) {
            (true, true) => Kind::ServerInvite,
            (true, false) => Kind::ClientInvite,
            (false, true) => Kind::ServerNonInvite,
            (false, false) => Kind::ClientNonInvite,
        }
    }
}

/// What the manager should do in response to a transaction event:
/// retransmit the last message on the wire, fire a timeout callback,
/// tear the transaction down, or do nothing observable.
#[derive(Debug)]
pub enum Action {
    None,
    Retransmit,
    ArmTimer { kind: TimerKind, delay: Duration },
    CancelTimer(TimerKind),
    FireTimeout,
    Terminate,
}

pub struct Transaction {
    pub key: TransactionKey,
    pub kind: Kind,
    pub state: TransactionState,
    pub peer: SocketAddr,
    pub protocol: Protocol,
    pub timers: TimerSettings,
    /// The last request (client) or response (server) sent on the wire,
    /// kept for byte-identical retransmission.
    pub last_sent: Option<Box<SipMessage>>,
    /// Client INVITE retransmit interval, doubling A -> T2 per RFC 3261 §17.1.1.2.
    next_retransmit: Duration,
}

impl Transaction {
    pub fn new_client(key: TransactionKey, kind: Kind, peer: SocketAddr, protocol: Protocol, timers: TimerSettings) -> Self {
        let state = match kind {
            Kind::ClientInvite => TransactionState::ClientInvite(ClientInviteState::Calling),
            Kind::ClientNonInvite => TransactionState::ClientNonInvite(ClientNonInviteState::Trying),
            _ => unreachable!("new_client only constructs client transactions"),
        };
        Transaction { key, kind, state, peer, protocol, timers, last_sent: None, next_retransmit: timers.t1 }
    }

    pub fn new_server(key: TransactionKey, kind: Kind, peer: SocketAddr, protocol: Protocol, timers: TimerSettings) -> Self {
        let state = match kind {
            Kind::ServerInvite => TransactionState::ServerInvite(ServerInviteState::Proceeding),
            Kind::ServerNonInvite => TransactionState::ServerNonInvite(ServerNonInviteState::Trying),
            _ => unreachable!("new_server only constructs server transactions"),
        };
        Transaction { key, kind, state, peer, protocol, timers, last_sent: None, next_retransmit: timers.t1 }
    }

    fn reliable(&self) -> bool {
        self.protocol.is_reliable()
    }

    /// Initial actions once a client transaction is created and its
    /// request has been handed to the transport: arm A (retransmit,
    /// UDP only) and B/F (timeout).
    pub fn initial_actions(&mut self) -> Vec<Action> {
        match self.kind {
            Kind::ClientInvite => {
                let mut actions = vec![Action::ArmTimer { kind: TimerKind::B, delay: self.timers.timer_b() }];
                if !self.reliable() {
                    actions.push(Action::ArmTimer { kind: TimerKind::A, delay: self.timers.t1 });
                }
                actions
            }
            Kind::ClientNonInvite => {
                let mut actions = vec![Action::ArmTimer { kind: TimerKind::F, delay: self.timers.timer_b() }];
                if !self.reliable() {
                    actions.push(Action::ArmTimer { kind: TimerKind::E, delay: self.timers.t1 });
                }
                actions
            }
            _ => Vec::new(),
        }
    }

    /// A retransmission timer (A or E) fired: re-send and double the
    /// interval up to T2.
    fn retransmit_actions(&mut self, kind: TimerKind) -> Vec<Action> {
        self.next_retransmit = std::cmp::min(self.next_retransmit * 2, self.timers.t2);
        vec![Action::Retransmit, Action::ArmTimer { kind, delay: self.next_retransmit }]
    }

    /// Drives the transaction from an expired timer.
    pub fn on_timer(&mut self, kind: TimerKind) -> Vec<Action> {
        match (self.kind, self.state) {
            (Kind::ClientInvite, TransactionState::ClientInvite(ClientInviteState::Calling)) if kind == TimerKind::A => {
                self.retransmit_actions(TimerKind::A)
            }
            (Kind::ClientInvite, TransactionState::ClientInvite(ClientInviteState::Calling | ClientInviteState::Proceeding))
                if kind == TimerKind::B =>
            {
                self.state = TransactionState::ClientInvite(ClientInviteState::Terminated);
                vec![Action::FireTimeout, Action::Terminate]
            }
            (Kind::ClientInvite, TransactionState::ClientInvite(ClientInviteState::Completed)) if kind == TimerKind::D => {
                self.state = TransactionState::ClientInvite(ClientInviteState::Terminated);
                vec![Action::Terminate]
            }
            (Kind::ClientNonInvite, TransactionState::ClientNonInvite(ClientNonInviteState::Trying)) if kind == TimerKind::E => {
                self.retransmit_actions(TimerKind::E)
            }
            (
                Kind::ClientNonInvite,
                TransactionState::ClientNonInvite(ClientNonInviteState::Trying | ClientNonInviteState::Proceeding),
            ) if kind == TimerKind::F => {
                self.state = TransactionState::ClientNonInvite(ClientNonInviteState::Terminated);
                vec![Action::FireTimeout, Action::Terminate]
            }
            (Kind::ClientNonInvite, TransactionState::ClientNonInvite(ClientNonInviteState::Completed)) if kind == TimerKind::K => {
                self.state = TransactionState::ClientNonInvite(ClientNonInviteState::Terminated);
                vec![Action::Terminate]
            }
            (Kind::ServerInvite, TransactionState::ServerInvite(ServerInviteState::Completed)) if kind == TimerKind::G => {
                self.retransmit_actions(TimerKind::G)
            }
            (Kind::ServerInvite, TransactionState::ServerInvite(ServerInviteState::Completed)) if kind == TimerKind::H => {
                // No ACK arrived before Timer H: treat as transport failure per RFC 3261 §17.2.1.
                self.state = TransactionState::ServerInvite(ServerInviteState::Terminated);
                vec![Action::FireTimeout, Action::Terminate]
            }
            (Kind::ServerInvite, TransactionState::ServerInvite(ServerInviteState::Confirmed)) if kind == TimerKind::I => {
                self.state = TransactionState::ServerInvite(ServerInviteState::Terminated);
                vec![Action::Terminate]
            }
            (Kind::ServerNonInvite, TransactionState::ServerNonInvite(ServerNonInviteState::Completed)) if kind == TimerKind::J => {
                self.state = TransactionState::ServerNonInvite(ServerNonInviteState::Terminated);
                vec![Action::Terminate]
            }
            _ => vec![Action::None],
        }
    }

    /// A server transaction saw its request retransmitted by the peer.
    /// In `Proceeding`/`Completed` this re-emits the last response
    /// without invoking the user handler; in any other state it is
    /// ignored (the first request already drove the transaction there).
    pub fn on_request_retransmit(&mut self) -> Vec<Action> {
        match self.state {
            TransactionState::ServerInvite(ServerInviteState::Proceeding | ServerInviteState::Completed) => {
                vec![Action::Retransmit]
            }
            TransactionState::ServerNonInvite(ServerNonInviteState::Proceeding | ServerNonInviteState::Completed) => {
                vec![Action::Retransmit]
            }
            _ => vec![Action::None],
        }
    }

    /// The server's application layer handed down a response to send.
    pub fn on_response_to_send(&mut self, status: StatusCode) -> Vec<Action> {
        match self.kind {
            Kind::ServerInvite => {
                if status.is_provisional() {
                    self.state = TransactionState::ServerInvite(ServerInviteState::Proceeding);
                    vec![Action::None]
                } else if status.is_success() {
                    // 2xx responses are not retransmitted by the transaction
                    // layer; the manager/TU takes over reliability and the
                    // transaction terminates once it has handed the
                    // response off (modeled here as an immediate Terminated,
                    // matching the ACK-for-2xx bypass in §4.2).
                    self.state = TransactionState::ServerInvite(ServerInviteState::Terminated);
                    vec![Action::Terminate]
                } else {
                    self.state = TransactionState::ServerInvite(ServerInviteState::Completed);
                    let mut actions = vec![Action::ArmTimer { kind: TimerKind::H, delay: self.timers.timer_h() }];
                    if !self.reliable() {
                        actions.push(Action::ArmTimer { kind: TimerKind::G, delay: self.timers.t1 });
                    }
                    actions
                }
            }
            Kind::ServerNonInvite => {
                if status.is_provisional() {
                    self.state = TransactionState::ServerNonInvite(ServerNonInviteState::Proceeding);
                    vec![Action::None]
                } else {
                    self.state = TransactionState::ServerNonInvite(ServerNonInviteState::Completed);
                    let delay = if self.reliable() { Duration::ZERO } else { self.timers.timer_j() };
                    vec![Action::ArmTimer { kind: TimerKind::J, delay }]
                }
            }
            _ => vec![Action::None],
        }
    }

    /// An ACK arrived for a non-2xx final response: Completed -> Confirmed.
    pub fn on_ack(&mut self) -> Vec<Action> {
        if let TransactionState::ServerInvite(ServerInviteState::Completed) = self.state {
            self.state = TransactionState::ServerInvite(ServerInviteState::Confirmed);
            let delay = if self.reliable() { Duration::ZERO } else { self.timers.t4 };
            return vec![Action::CancelTimer(TimerKind::G), Action::CancelTimer(TimerKind::H), Action::ArmTimer { kind: TimerKind::I, delay }];
        }
        vec![Action::None]
    }

    /// A response arrived on a client transaction.
    pub fn on_response(&mut self, status: StatusCode) -> Vec<Action> {
        match self.kind {
            Kind::ClientInvite => match self.state {
                TransactionState::ClientInvite(ClientInviteState::Calling) | TransactionState::ClientInvite(ClientInviteState::Proceeding) => {
                    if status.is_provisional() {
                        self.state = TransactionState::ClientInvite(ClientInviteState::Proceeding);
                        vec![Action::CancelTimer(TimerKind::A)]
                    } else if status.is_success() {
                        // 2xx is handed to the ack-or-2xx callback, not retried here; terminate immediately.
                        self.state = TransactionState::ClientInvite(ClientInviteState::Terminated);
                        vec![Action::CancelTimer(TimerKind::A), Action::CancelTimer(TimerKind::B), Action::Terminate]
                    } else {
                        self.state = TransactionState::ClientInvite(ClientInviteState::Completed);
                        let delay = if self.reliable() { Duration::ZERO } else { self.timers.timer_d() };
                        vec![Action::CancelTimer(TimerKind::A), Action::CancelTimer(TimerKind::B), Action::ArmTimer { kind: TimerKind::D, delay }]
                    }
                }
                // A late provisional after a final response is dropped (§4.2 tie-break).
                TransactionState::ClientInvite(ClientInviteState::Completed) => vec![Action::None],
                _ => vec![Action::None],
            },
            Kind::ClientNonInvite => match self.state {
                TransactionState::ClientNonInvite(ClientNonInviteState::Trying | ClientNonInviteState::Proceeding) => {
                    if status.is_provisional() {
                        self.state = TransactionState::ClientNonInvite(ClientNonInviteState::Proceeding);
                        vec![Action::None]
                    } else {
                        self.state = TransactionState::ClientNonInvite(ClientNonInviteState::Completed);
                        let delay = if self.reliable() { Duration::ZERO } else { self.timers.t4 };
                        vec![Action::CancelTimer(TimerKind::E), Action::CancelTimer(TimerKind::F), Action::ArmTimer { kind: TimerKind::K, delay }]
                    }
                }
                _ => vec![Action::None],
            },
            _ => vec![Action::None],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigcore_sip::types::status;

    fn key() -> TransactionKey {
        TransactionKey::new("z9hG4bK-test", Method::Invite, true)
    }

    fn peer() -> SocketAddr {
        "10.0.0.2:5060".parse().unwrap()
    }

    fn timers() -> TimerSettings {
        TimerSettings { t1: Duration::from_millis(500), t2: Duration::from_millis(4000), t4: Duration::from_millis(5000) }
    }

    fn matches_only(actions: &[Action], expect: impl Fn(&Action) -> bool) -> bool {
        actions.iter().any(expect)
    }

    // Server INVITE: a provisional leaves it in Proceeding with no timers armed.
    #[test]
    fn server_invite_provisional_stays_in_proceeding() {
        let mut tx = Transaction::new_server(key(), Kind::ServerInvite, peer(), Protocol::Udp, timers());
        tx.on_response_to_send(status::RINGING);
        assert_eq!(tx.state, TransactionState::ServerInvite(ServerInviteState::Proceeding));
    }

    // Server INVITE: a non-2xx final arms G (retransmit, UDP only) and H (timeout),
    // then ACK moves Completed -> Confirmed and cancels G/H in favor of I.
    #[test]
    fn server_invite_non_2xx_then_ack_reaches_confirmed() {
        let mut tx = Transaction::new_server(key(), Kind::ServerInvite, peer(), Protocol::Udp, timers());
        let actions = tx.on_response_to_send(status::BAD_REQUEST);
        assert_eq!(tx.state, TransactionState::ServerInvite(ServerInviteState::Completed));
        assert!(matches_only(&actions, |a| matches!(a, Action::ArmTimer { kind: TimerKind::G, .. })));
        assert!(matches_only(&actions, |a| matches!(a, Action::ArmTimer { kind: TimerKind::H, .. })));

        let actions = tx.on_ack();
        assert_eq!(tx.state, TransactionState::ServerInvite(ServerInviteState::Confirmed));
        assert!(matches_only(&actions, |a| matches!(a, Action::CancelTimer(TimerKind::G))));
        assert!(matches_only(&actions, |a| matches!(a, Action::CancelTimer(TimerKind::H))));
        assert!(matches_only(&actions, |a| matches!(a, Action::ArmTimer { kind: TimerKind::I, .. })));

        let actions = tx.on_timer(TimerKind::I);
        assert_eq!(tx.state, TransactionState::ServerInvite(ServerInviteState::Terminated));
        assert!(matches_only(&actions, |a| matches!(a, Action::Terminate)));
    }

    // Server INVITE: a reliable transport skips the G retransmit timer entirely.
    #[test]
    fn server_invite_non_2xx_over_tcp_does_not_arm_retransmit() {
        let mut tx = Transaction::new_server(key(), Kind::ServerInvite, peer(), Protocol::Tcp, timers());
        let actions = tx.on_response_to_send(status::BAD_REQUEST);
        assert!(!matches_only(&actions, |a| matches!(a, Action::ArmTimer { kind: TimerKind::G, .. })));
    }

    // Server INVITE: a 2xx bypasses Completed/Confirmed entirely (ACK-for-2xx
    // is handled outside the transaction per RFC 3261 §13.2.2.4).
    #[test]
    fn server_invite_2xx_terminates_immediately() {
        let mut tx = Transaction::new_server(key(), Kind::ServerInvite, peer(), Protocol::Udp, timers());
        let actions = tx.on_response_to_send(status::OK);
        assert_eq!(tx.state, TransactionState::ServerInvite(ServerInviteState::Terminated));
        assert!(matches_only(&actions, |a| matches!(a, Action::Terminate)));
    }

    // Server INVITE: timer H expiry with no ACK is a timeout, not a silent cleanup.
    #[test]
    fn server_invite_timer_h_without_ack_fires_timeout() {
        let mut tx = Transaction::new_server(key(), Kind::ServerInvite, peer(), Protocol::Udp, timers());
        tx.on_response_to_send(status::BAD_REQUEST);
        let actions = tx.on_timer(TimerKind::H);
        assert_eq!(tx.state, TransactionState::ServerInvite(ServerInviteState::Terminated));
        assert!(matches_only(&actions, |a| matches!(a, Action::FireTimeout)));
    }

    // A retransmitted request in Completed re-emits the last response without
    // touching the user handler (testable property 3 / S1's retransmit case).
    #[test]
    fn retransmitted_request_in_completed_re_emits_without_state_change() {
        let mut tx = Transaction::new_server(key(), Kind::ServerInvite, peer(), Protocol::Udp, timers());
        tx.on_response_to_send(status::BAD_REQUEST);
        let state_before = tx.state;
        let actions = tx.on_request_retransmit();
        assert_eq!(tx.state, state_before);
        assert!(matches!(actions.as_slice(), [Action::Retransmit]));
    }

    // Server non-INVITE: Trying -> provisional -> Proceeding -> final -> Completed,
    // with J scheduled only on unreliable transports.
    #[test]
    fn server_non_invite_runs_trying_through_completed() {
        let mut tx = Transaction::new_server(key(), Kind::ServerNonInvite, peer(), Protocol::Udp, timers());
        tx.on_response_to_send(status::TRYING);
        assert_eq!(tx.state, TransactionState::ServerNonInvite(ServerNonInviteState::Proceeding));

        let actions = tx.on_response_to_send(status::OK);
        assert_eq!(tx.state, TransactionState::ServerNonInvite(ServerNonInviteState::Completed));
        assert!(matches_only(&actions, |a| matches!(a, Action::ArmTimer { kind: TimerKind::J, .. })));

        let actions = tx.on_timer(TimerKind::J);
        assert_eq!(tx.state, TransactionState::ServerNonInvite(ServerNonInviteState::Terminated));
        assert!(matches_only(&actions, |a| matches!(a, Action::Terminate)));
    }

    // Server non-INVITE over a reliable transport: J fires with no delay (Completed
    // is entered and torn down on the same tick once driven), never retransmitting.
    #[test]
    fn server_non_invite_over_tcp_schedules_j_with_zero_delay() {
        let mut tx = Transaction::new_server(key(), Kind::ServerNonInvite, peer(), Protocol::Tcp, timers());
        let actions = tx.on_response_to_send(status::OK);
        assert!(matches_only(&actions, |a| matches!(a, Action::ArmTimer { kind: TimerKind::J, delay } if *delay == Duration::ZERO)));
    }

    // Client INVITE: Calling -> retransmit on A, doubling up to T2, cancelled by a
    // provisional; a final 2xx terminates the transaction (handed off to the
    // ack-or-2xx path, not retried here).
    #[test]
    fn client_invite_retransmits_then_terminates_on_2xx() {
        let client_key = TransactionKey::new("z9hG4bK-test", Method::Invite, false);
        let mut tx = Transaction::new_client(client_key, Kind::ClientInvite, peer(), Protocol::Udp, timers());
        let initial = tx.initial_actions();
        assert!(matches_only(&initial, |a| matches!(a, Action::ArmTimer { kind: TimerKind::A, .. })));
        assert!(matches_only(&initial, |a| matches!(a, Action::ArmTimer { kind: TimerKind::B, .. })));

        let retransmit = tx.on_timer(TimerKind::A);
        assert!(matches!(retransmit.as_slice(), [Action::Retransmit, Action::ArmTimer { kind: TimerKind::A, delay }] if *delay == timers().t1 * 2));

        let actions = tx.on_response(status::RINGING);
        assert_eq!(tx.state, TransactionState::ClientInvite(ClientInviteState::Proceeding));
        assert!(matches_only(&actions, |a| matches!(a, Action::CancelTimer(TimerKind::A))));

        let actions = tx.on_response(status::OK);
        assert_eq!(tx.state, TransactionState::ClientInvite(ClientInviteState::Terminated));
        assert!(matches_only(&actions, |a| matches!(a, Action::Terminate)));
    }

    // Client INVITE: a non-2xx final enters Completed and arms D; over UDP D is
    // at least 32s, over a reliable transport it fires with no delay.
    #[test]
    fn client_invite_non_2xx_arms_timer_d_per_reliability() {
        let udp_key = TransactionKey::new("z9hG4bK-udp", Method::Invite, false);
        let mut udp_tx = Transaction::new_client(udp_key, Kind::ClientInvite, peer(), Protocol::Udp, timers());
        let actions = udp_tx.on_response(status::BAD_REQUEST);
        assert_eq!(udp_tx.state, TransactionState::ClientInvite(ClientInviteState::Completed));
        assert!(matches_only(&actions, |a| matches!(a, Action::ArmTimer { kind: TimerKind::D, delay } if *delay >= Duration::from_secs(32))));

        let tcp_key = TransactionKey::new("z9hG4bK-tcp", Method::Invite, false);
        let mut tcp_tx = Transaction::new_client(tcp_key, Kind::ClientInvite, peer(), Protocol::Tcp, timers());
        let actions = tcp_tx.on_response(status::BAD_REQUEST);
        assert!(matches_only(&actions, |a| matches!(a, Action::ArmTimer { kind: TimerKind::D, delay } if *delay == Duration::ZERO)));
    }

    // A provisional arriving after a final response on a client INVITE is dropped
    // (§4.2's tie-break), never reverting Completed back to Proceeding.
    #[test]
    fn late_provisional_after_final_is_dropped() {
        let client_key = TransactionKey::new("z9hG4bK-test", Method::Invite, false);
        let mut tx = Transaction::new_client(client_key, Kind::ClientInvite, peer(), Protocol::Udp, timers());
        tx.on_response(status::BAD_REQUEST);
        let state_before = tx.state;
        let actions = tx.on_response(status::RINGING);
        assert_eq!(tx.state, state_before);
        assert!(matches!(actions.as_slice(), [Action::None]));
    }

    // Client non-INVITE: Trying -> retransmit on E -> final response arms K;
    // timer B/F-equivalent timeout fires a synthetic-408 action exactly once.
    #[test]
    fn client_non_invite_times_out_via_timer_f() {
        let client_key = TransactionKey::new("z9hG4bK-options", Method::Options, false);
        let mut tx = Transaction::new_client(client_key, Kind::ClientNonInvite, peer(), Protocol::Udp, timers());
        let initial = tx.initial_actions();
        assert!(matches_only(&initial, |a| matches!(a, Action::ArmTimer { kind: TimerKind::E, .. })));
        assert!(matches_only(&initial, |a| matches!(a, Action::ArmTimer { kind: TimerKind::F, .. })));

        let actions = tx.on_timer(TimerKind::F);
        assert_eq!(tx.state, TransactionState::ClientNonInvite(ClientNonInviteState::Terminated));
        assert!(matches_only(&actions, |a| matches!(a, Action::FireTimeout)));
        assert!(matches_only(&actions, |a| matches!(a, Action::Terminate)));
    }

    #[test]
    fn client_non_invite_final_response_arms_k_then_terminates() {
        let client_key = TransactionKey::new("z9hG4bK-options", Method::Options, false);
        let mut tx = Transaction::new_client(client_key, Kind::ClientNonInvite, peer(), Protocol::Udp, timers());
        let actions = tx.on_response(status::OK);
        assert_eq!(tx.state, TransactionState::ClientNonInvite(ClientNonInviteState::Completed));
        assert!(matches_only(&actions, |a| matches!(a, Action::ArmTimer { kind: TimerKind::K, .. })));

        let actions = tx.on_timer(TimerKind::K);
        assert_eq!(tx.state, TransactionState::ClientNonInvite(ClientNonInviteState::Terminated));
        assert!(matches_only(&actions, |a| matches!(a, Action::Terminate)));
    }
}
