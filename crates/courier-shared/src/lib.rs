//! # courier-shared
//!
//! Types shared between the courier server and its store: the
//! newline-delimited JSON wire protocol, identifier newtypes and
//! protocol-wide constants.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::CourierError;
