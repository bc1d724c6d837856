use rust_decimal::Decimal;

/// Normalized error taxonomy for the ledger core. Variant names match the
/// "error kinds" enumerated in the design rather than any one transport's
/// status codes; callers at the HTTP/webhook boundary map these down.
#[derive(Debug)]
pub enum LedgerError {
    InsufficientFunds { have: Decimal, want: Decimal },
    InsufficientHoldings { symbol: String, have: i64, want: i64 },
    InvalidPrice,
    InvalidQuantity,
    NotAuthorized,
    NotFound(&'static str),
    SessionError(String),
    RateLimit,
    TemporaryError(String),
    PermanentError(String),
    FillAlreadyApplied,
    FillOnTerminal,
    InvariantViolation(String),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::InsufficientFunds { have, want } => {
                write!(f, "insufficient funds: have {have}, want {want}")
            }
            LedgerError::InsufficientHoldings { symbol, have, want } => write!(
                f,
                "insufficient holdings for {symbol}: have {have}, want {want}"
            ),
            LedgerError::InvalidPrice => write!(f, "invalid price"),
            LedgerError::InvalidQuantity => write!(f, "invalid quantity"),
            LedgerError::NotAuthorized => write!(f, "trader not authorized for client"),
            LedgerError::NotFound(what) => write!(f, "{what} not found"),
            LedgerError::SessionError(reason) => write!(f, "broker session error: {reason}"),
            LedgerError::RateLimit => write!(f, "broker rate limit exceeded"),
            LedgerError::TemporaryError(reason) => write!(f, "broker temporary error: {reason}"),
            LedgerError::PermanentError(reason) => write!(f, "broker permanent error: {reason}"),
            LedgerError::FillAlreadyApplied => write!(f, "fill already applied"),
            LedgerError::FillOnTerminal => write!(f, "order already in a terminal state"),
            LedgerError::InvariantViolation(detail) => {
                write!(f, "invariant violation: {detail}")
            }
        }
    }
}

impl std::error::Error for LedgerError {}

/// HTTP-equivalent class, independent of any particular web framework.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    BadRequest,
    Unauthorized,
    Forbidden,
    RateLimited,
    BadGateway,
    Internal,
    Ok,
}

impl LedgerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LedgerError::InsufficientFunds { .. }
            | LedgerError::InsufficientHoldings { .. }
            | LedgerError::InvalidPrice
            | LedgerError::InvalidQuantity
            | LedgerError::PermanentError(_)
            | LedgerError::NotFound(_) => ErrorClass::BadRequest,
            LedgerError::NotAuthorized => ErrorClass::Forbidden,
            LedgerError::SessionError(_) => ErrorClass::Unauthorized,
            LedgerError::RateLimit => ErrorClass::RateLimited,
            LedgerError::TemporaryError(_) => ErrorClass::BadGateway,
            LedgerError::FillAlreadyApplied => ErrorClass::Ok,
            LedgerError::FillOnTerminal => ErrorClass::BadRequest,
            LedgerError::InvariantViolation(_) => ErrorClass::Internal,
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
