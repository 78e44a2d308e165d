use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Fatal at startup: `run()` returns before binding anything (§7).
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(#[from] sigcore_transport::Error),

    #[error(transparent)]
    Transaction(#[from] sigcore_transaction::Error),

    #[error(transparent)]
    B2bua(#[from] sigcore_b2bua::Error),

    #[error("the stack has not been started: call run() first")]
    NotRunning,

    #[error("no listener configured for {0}")]
    NoListener(&'static str),
}
