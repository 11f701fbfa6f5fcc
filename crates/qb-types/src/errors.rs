use thiserror::Error;

use crate::orders::{OrderId, OrderStatus};

/// Main error type for the Quantback system
#[derive(Error, Debug)]
pub enum QbError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    #[error("Portfolio error: {0}")]
    Portfolio(#[from] PortfolioError),

    #[error("Optimizer error: {0}")]
    Optimizer(#[from] OptimizerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Configuration errors are fatal before a run starts; no events are emitted.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Unknown position sizing method: {method}")]
    UnknownSizingMethod { method: String },

    #[error("Unknown strategy: {name}")]
    UnknownStrategy { name: String },

    #[error("Unknown objective: {name}")]
    UnknownObjective { name: String },

    #[error("Unknown optimization method: {method}")]
    UnknownSearchMethod { method: String },

    #[error("Unknown timeframe tag: {tag}")]
    UnknownTimeframe { tag: String },
}

/// Data-related errors
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Missing required column {column} in {file}")]
    MissingColumn { column: String, file: String },

    #[error("Failed to load {file}: {message}")]
    LoadFailed { file: String, message: String },

    #[error("No bars available for symbol {symbol}")]
    EmptySeries { symbol: String },

    #[error("Timestamps for {symbol} are not strictly increasing")]
    NonMonotonicTimestamps { symbol: String },

    #[error("Split not found: {name}")]
    SplitNotFound { name: String },

    #[error("Invalid split: {message}")]
    InvalidSplit { message: String },

    #[error("No market data loaded")]
    NoData,
}

/// Order lifecycle errors
#[derive(Error, Debug)]
pub enum OrderError {
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("Order not found: {id}")]
    NotFound { id: OrderId },

    #[error("Order {id} is not cancelable in status {status}")]
    NotCancelable { id: OrderId, status: OrderStatus },
}

/// Portfolio errors are fatal: the run aborts and reports the last
/// consistent state.
#[derive(Error, Debug)]
pub enum PortfolioError {
    #[error("Cash reconciliation failed: {detail}")]
    Reconciliation { detail: String },

    #[error("Equity curve timestamp went backwards: {detail}")]
    NonMonotonicEquity { detail: String },
}

/// Optimizer errors at sweep scope. Individual trial failures are recorded
/// on the trial, not raised.
#[derive(Error, Debug)]
pub enum OptimizerError {
    #[error("Parameter space is empty")]
    EmptySpace,

    #[error("Grid search over float parameter {parameter} requires a step")]
    GridRequiresStep { parameter: String },

    #[error("Invalid walk-forward window: {message}")]
    InvalidWindow { message: String },

    #[error("Sweep produced no trials")]
    NoTrials,
}

/// Error returned by an event handler; caught and recorded by the bus,
/// never re-raised to the emitter.
#[derive(Error, Debug)]
#[error("handler {handler} failed: {message}")]
pub struct HandlerError {
    pub handler: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(handler: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for Quantback operations
pub type QbResult<T> = Result<T, QbError>;
