use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Slot, booking, item or user does not exist (or is not visible to the caller).
    NotFound(Ulid),
    AlreadyExists(Ulid),
    DuplicateLogin(String),
    /// Slot is unavailable at the moment of the locked read.
    Conflict(Ulid),
    QuotaExceeded(u32),
    LimitExceeded(&'static str),
    /// Store or commit failure. Details stay server-side.
    Internal(String),
}

impl EngineError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) | EngineError::DuplicateLogin(_) => "already_exists",
            EngineError::Conflict(_) => "conflict",
            EngineError::QuotaExceeded(_) => "quota_exceeded",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Internal(_) => "internal",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::DuplicateLogin(login) => {
                write!(f, "user with login {login:?} already exists")
            }
            EngineError::Conflict(id) => write!(f, "slot is not available: {id}"),
            EngineError::QuotaExceeded(quota) => {
                write!(f, "booking limit reached: at most {quota} active bookings")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
