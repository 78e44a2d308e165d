use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("transaction {0} not found")]
    NotFound(crate::key::TransactionKey),

    #[error("transport error on transaction {key}: {source}")]
    Transport { key: crate::key::TransactionKey, #[source] source: sigcore_transport::Error },

    #[error("timer {timer} expired without response on transaction {key}")]
    Timeout { key: crate::key::TransactionKey, timer: &'static str },

    #[error("request is missing a Via header")]
    MissingVia,

    #[error("request is missing a CSeq header")]
    MissingCSeq,
}
