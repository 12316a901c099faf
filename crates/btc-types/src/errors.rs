//! Errors raised while building, reconciling and signing contract transactions.

use std::fmt;

use thiserror::Error;

/// Failure of a contract operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractError {
    /// A term required at the requested phase is absent.
    #[error("contract term missing: {0}")]
    TermMissing(String),

    /// A term is present but its value is not acceptable.
    #[error("contract term wrong value: {0}")]
    TermWrongValue(String),

    /// A term already set differs from the value supplied now.
    #[error("contract term value mismatch: {0}")]
    TermMismatch(String),

    /// A term cannot be decoded.
    #[error("contract term wrong format: {0}")]
    TermWrongFormat(String),

    /// The operation is not possible in the current builder state.
    #[error("contract state error: {0}")]
    State(String),

    /// Contract type or protocol version is not supported.
    #[error("contract protocol error: {0}")]
    Protocol(String),

    /// A signature could not be produced or does not verify.
    #[error("signature error: {0}")]
    Signature(String),

    /// The inputs do not cover the outputs and mining fee.
    #[error("not enough funds for {context}: required {required}, available {available}")]
    FundsNotEnough {
        context: String,
        required: u64,
        available: u64,
    },

    /// An output would be below the dust limit.
    #[error("dust output: {0}")]
    Dust(String),

    /// The key registry could not resolve a signing key.
    #[error("key error: {0}")]
    Key(String),

    /// An error annotated with the term or operation that triggered it.
    #[error("{context}")]
    Context {
        context: Box<ContractError>,
        #[source]
        cause: Box<ContractError>,
    },
}

/// Stable classification of a [`ContractError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TermMissing,
    TermWrongValue,
    TermMismatch,
    TermWrongFormat,
    State,
    Protocol,
    Signature,
    FundsNotEnough,
    Dust,
    Key,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TermMissing => "ContractTermMissing",
            ErrorKind::TermWrongValue => "ContractTermWrongValue",
            ErrorKind::TermMismatch => "ContractTermValueMismatch",
            ErrorKind::TermWrongFormat => "ContractTermWrongFormat",
            ErrorKind::State => "ContractStateError",
            ErrorKind::Protocol => "ContractProtocolError",
            ErrorKind::Signature => "SignatureError",
            ErrorKind::FundsNotEnough => "ContractFundsNotEnough",
            ErrorKind::Dust => "ContractDustOutput",
            ErrorKind::Key => "KeyError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ContractError {
    /// Kind of the outermost error; a context wrapper reports its context's kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ContractError::TermMissing(_) => ErrorKind::TermMissing,
            ContractError::TermWrongValue(_) => ErrorKind::TermWrongValue,
            ContractError::TermMismatch(_) => ErrorKind::TermMismatch,
            ContractError::TermWrongFormat(_) => ErrorKind::TermWrongFormat,
            ContractError::State(_) => ErrorKind::State,
            ContractError::Protocol(_) => ErrorKind::Protocol,
            ContractError::Signature(_) => ErrorKind::Signature,
            ContractError::FundsNotEnough { .. } => ErrorKind::FundsNotEnough,
            ContractError::Dust(_) => ErrorKind::Dust,
            ContractError::Key(_) => ErrorKind::Key,
            ContractError::Context { context, .. } => context.kind(),
        }
    }

    /// Wraps `cause` under `self`, keeping it reachable through `source()`.
    pub fn caused_by(self, cause: ContractError) -> Self {
        ContractError::Context {
            context: Box::new(self),
            cause: Box::new(cause),
        }
    }

    /// Innermost error of a context chain.
    pub fn root_cause(&self) -> &ContractError {
        match self {
            ContractError::Context { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::*;

    #[test]
    fn test_kind_tags() {
        assert_eq!(
            ContractError::TermMismatch("price".into()).kind().as_str(),
            "ContractTermValueMismatch"
        );
        let funds = ContractError::FundsNotEnough {
            context: "swap".into(),
            required: 10,
            available: 5,
        };
        assert_eq!(funds.kind(), ErrorKind::FundsNotEnough);
        assert_eq!(
            funds.to_string(),
            "not enough funds for swap: required 10, available 5"
        );
    }

    #[test]
    fn test_context_keeps_cause() {
        let err = ContractError::TermWrongValue("change_addr".into())
            .caused_by(ContractError::Dust("change".into()));

        assert_eq!(err.kind(), ErrorKind::TermWrongValue, "context decides the kind");
        assert_eq!(err.root_cause(), &ContractError::Dust("change".into()));
        let source = err.source().expect("cause exposed as source");
        assert_eq!(source.to_string(), "dust output: change");
    }
}
