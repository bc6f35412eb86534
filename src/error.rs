use thiserror::Error;

use crate::correlator::CorrelatorError;
use crate::event::EventError;
use crate::pattern::PatternError;
use crate::router::RouterError;
use crate::store::StoreError;
use crate::subscription::HandlerError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Event error: {0}")]
    Event(#[from] EventError),
    #[error("Pattern error: {0}")]
    Pattern(#[from] PatternError),
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),
    #[error("Router error: {0}")]
    Router(#[from] RouterError),
    #[error("Correlator error: {0}")]
    Correlator(#[from] CorrelatorError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type InternalResult<T> = Result<T, Error>;

impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }
}
