use thiserror::Error;

/// A crontab field that failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrontabError {
    /// The expression did not split into exactly five fields.
    #[error("expected 5 fields (minute hour day-of-month day-of-week month-of-year), got {0}")]
    FieldCount(usize),

    /// A field contained something other than `*`, numbers, names, `,`, `-` or `/`.
    #[error("{field}: cannot parse {value:?}")]
    Syntax { field: &'static str, value: String },

    /// A value was outside the field's allowed range.
    #[error("{field}: {value} is outside {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    /// A `/n` step of zero.
    #[error("{field}: step must be greater than zero")]
    ZeroStep { field: &'static str },
}

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Malformed crontab. The owning entry is disabled, never fatal.
    #[error("Invalid crontab expression: {0}")]
    InvalidExpression(#[from] CrontabError),

    /// An interval policy that can never fire sensibly (zero or overflowing span).
    #[error("Invalid schedule policy: {0}")]
    InvalidPolicy(String),

    /// `args` / `kwargs` do not decode to a JSON array / object.
    #[error("Invalid task arguments: {0}")]
    InvalidArgs(String),

    /// Underlying SQLite / rusqlite error. Transient from the engine's view.
    #[error("Schedule store unavailable: {0}")]
    StoreUnavailable(#[from] rusqlite::Error),

    /// The coordination store backing the leader lock could not be reached.
    #[error("Leader lock unavailable: {0}")]
    LockUnavailable(String),

    /// The dispatcher refused a fired entry.
    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    /// No entry with the given id or name exists in the store.
    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    /// An entry with this name already exists.
    #[error("Entry name already in use: {0}")]
    DuplicateName(String),

    /// Engine settings could not be built from configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
