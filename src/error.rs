use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Coordination Error - {0}")]
    Coordination(String),

    #[error("Cursor Parse Error - {0}")]
    CursorParse(String),

    #[error("Listener Cancel Error - {0}")]
    ListenerCancel(String),

    #[error("Access Denied - {0}")]
    AccessDenied(String),

    #[error("Internal Error - {0}")]
    Internal(String),
}

impl Error {
    /// Short machine-readable tag used in the terminal frame.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Coordination(_) => "coordination",
            Error::CursorParse(_) => "cursor_parse",
            Error::ListenerCancel(_) => "listener_cancel",
            Error::AccessDenied(_) => "access_denied",
            Error::Internal(_) => "internal",
        }
    }
}
