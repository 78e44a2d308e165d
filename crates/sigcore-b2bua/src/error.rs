use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no handler registered for {0}")]
    NoHandler(String),

    #[error("transaction layer error: {0}")]
    Transaction(#[from] sigcore_transaction::Error),

    #[error("handler panicked or returned an error: {0}")]
    Internal(String),
}
