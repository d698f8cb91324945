//! Backend failure classification.
//!
//! Maps any error raised by a backend call onto the [`FailureKind`]
//! vocabulary.  SQLite extended result codes are used when available;
//! otherwise the message is scanned case-insensitively for well-known
//! phrases (PostgreSQL, MySQL and SQLite wordings, MySQL numeric codes).

use std::sync::LazyLock;

use aho_corasick::{AhoCorasick, MatchKind};
use regex::Regex;
use rusqlite::ErrorCode;

use crate::error::{FailureKind, StoreError};

/// A classified failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: FailureKind,
    /// Constraint or index named in the message, if any.
    pub constraint: Option<String>,
}

/// Phrase table; the index into this table selects the kind.
const PATTERNS: &[(&str, FailureKind)] = &[
    ("duplicate key", FailureKind::DuplicateKey),
    ("duplicate entry", FailureKind::DuplicateKey),
    ("unique constraint", FailureKind::DuplicateKey),
    ("already exists", FailureKind::DuplicateKey),
    ("error 1062", FailureKind::DuplicateKey),
    ("foreign key", FailureKind::ForeignKeyViolation),
    ("error 1452", FailureKind::ForeignKeyViolation),
    ("connection", FailureKind::ConnectionTimeout),
    ("timeout", FailureKind::ConnectionTimeout),
    ("timed out", FailureKind::ConnectionTimeout),
    ("database is locked", FailureKind::ConnectionTimeout),
];

static MATCHER: LazyLock<Option<AhoCorasick>> = LazyLock::new(|| {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .match_kind(MatchKind::LeftmostLongest)
        .build(PATTERNS.iter().map(|(p, _)| p))
        .inspect_err(|e| tracing::error!(error = %e, "failure matcher unavailable"))
        .ok()
});

static CONSTRAINT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"(?i)constraint(?:\s+failed:)?\s+["'`]?([\w.]+)"#)
        .inspect_err(|e| tracing::error!(error = %e, "constraint pattern unavailable"))
        .ok()
});

/// Kind precedence when a message matches several phrases.
fn rank(kind: FailureKind) -> u8 {
    match kind {
        FailureKind::DuplicateKey => 0,
        FailureKind::ForeignKeyViolation => 1,
        FailureKind::ConnectionTimeout => 2,
        FailureKind::Generic => 3,
    }
}

/// Classify a message by phrase.
pub fn classify_message(message: &str) -> FailureKind {
    let Some(matcher) = MATCHER.as_ref() else {
        return FailureKind::Generic;
    };
    matcher
        .find_iter(message)
        .map(|m| PATTERNS[m.pattern().as_usize()].1)
        .min_by_key(|kind| rank(*kind))
        .unwrap_or(FailureKind::Generic)
}

/// Pull a constraint name out of an error message.
pub fn extract_constraint(message: &str) -> Option<String> {
    CONSTRAINT
        .as_ref()?
        .captures(message)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn classify_sqlite(err: &rusqlite::Error) -> Option<FailureKind> {
    let rusqlite::Error::SqliteFailure(failure, _) = err else {
        return None;
    };
    match failure.extended_code {
        rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY | rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE => {
            return Some(FailureKind::DuplicateKey);
        }
        rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
            return Some(FailureKind::ForeignKeyViolation);
        }
        _ => {}
    }
    match failure.code {
        ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen => {
            Some(FailureKind::ConnectionTimeout)
        }
        _ => None,
    }
}

/// Classify any store error raised by a backend call.
pub fn classify(err: &StoreError) -> Classification {
    let message = err.to_string();
    let kind = match err {
        StoreError::Timeout { .. } | StoreError::Unavailable { .. } => {
            FailureKind::ConnectionTimeout
        }
        StoreError::Backend { kind, .. } => *kind,
        StoreError::Sqlite(inner) => {
            classify_sqlite(inner).unwrap_or_else(|| classify_message(&message))
        }
        _ => classify_message(&message),
    };
    Classification {
        kind,
        constraint: extract_constraint(&message),
    }
}
