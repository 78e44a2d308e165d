//! The four RFC 3261 §17 transaction state machines.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerInviteState {
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerNonInviteState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientInviteState {
    Calling,
    Proceeding,
    Completed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientNonInviteState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    ServerInvite(ServerInviteState),
    ServerNonInvite(ServerNonInviteState),
    ClientInvite(ClientInviteState),
    ClientNonInvite(ClientNonInviteState),
}

impl TransactionState {
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            TransactionState::ServerInvite(ServerInviteState::Terminated)
                | TransactionState::ServerNonInvite(ServerNonInviteState::Terminated)
                | TransactionState::ClientInvite(ClientInviteState::Terminated)
                | TransactionState::ClientNonInvite(ClientNonInviteState::Terminated)
        )
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::ServerInvite(s) => write!(f, "server-invite:{s:?}"),
            TransactionState::ServerNonInvite(s) => write!(f, "server-non-invite:{s:?}"),
            TransactionState::ClientInvite(s) => write!(f, "client-invite:{s:?}"),
            TransactionState::ClientNonInvite(s) => write!(f, "client-non-invite:{s:?}"),
        }
    }
}
