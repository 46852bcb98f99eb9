// Copyright 2020 Joyent, Inc.

use thiserror::Error;

/// Failures raised while parsing upstream specification strings.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("empty upstream specification")]
    EmptySpec,
    #[error("malformed upstream specification: {0}")]
    MalformedSpec(String),
    #[error("invalid port: {0}")]
    BadPort(String),
    #[error("invalid priority: {0}")]
    BadPriority(String),
    #[error("could not resolve host: {0}")]
    Unresolvable(String),
}

/// Failures surfaced by a `NameResolver` implementation. Resolution
/// failures never remove addresses from an upstream; they are logged and
/// the previous address set is kept.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("DNS query failure: {err}")]
    QueryFailed { err: String },
    #[error("DNS request timed out")]
    Timeout,
    #[error("resolver configuration failure: {err}")]
    BadConfiguration { err: String },
    #[error("I/O failure")]
    Io(#[from] std::io::Error),
}
