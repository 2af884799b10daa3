//! # Typed Error Kinds
//!
//! burrowdb reports errors through `eyre::Result` with rich context strings.
//! The small set of conditions callers need to match on programmatically is
//! carried by [`TreeError`], attached to the eyre report so it survives
//! wrapping and can be recovered with `downcast_ref`.
//!
//! - `KeyNotFound`: the target key is absent; mutating paths guarantee no
//!   page was dirtied when this is returned.
//! - `Corruption`: an on-page invariant check failed while reading (count
//!   out of range, zero child pointer, CRC mismatch).
//! - `InvariantBroken`: an in-memory protocol was violated (for example a
//!   cursor operation in the wrong state).
//!
//! I/O failures from the pager or blob store surface as the underlying
//! `std::io::Error` wrapped by eyre and are not duplicated here.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("key not found")]
    KeyNotFound,

    #[error("key already exists")]
    DuplicateKey,

    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("invariant broken: {0}")]
    InvariantBroken(String),
}

/// True if the report carries `TreeError::KeyNotFound`.
pub fn is_key_not_found(err: &eyre::Report) -> bool {
    matches!(err.downcast_ref::<TreeError>(), Some(TreeError::KeyNotFound))
}

/// True if the report carries `TreeError::Corruption`.
pub fn is_corruption(err: &eyre::Report) -> bool {
    matches!(err.downcast_ref::<TreeError>(), Some(TreeError::Corruption(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_not_found_survives_wrapping() {
        let err = eyre::Report::new(TreeError::KeyNotFound).wrap_err("erase failed");
        assert!(is_key_not_found(&err));
        assert!(!is_corruption(&err));
    }

    #[test]
    fn corruption_carries_detail() {
        let err = eyre::Report::new(TreeError::Corruption("count out of range".into()));
        assert!(is_corruption(&err));
        assert!(err.to_string().contains("count out of range"));
    }
}
