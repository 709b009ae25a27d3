//! Shared types for the Talos gateway.
//!
//! This crate holds the record and wire types that every other crate in the
//! workspace speaks: the sealed audit [`Envelope`], the producer-facing
//! [`EnvelopeFields`], and the tagged JSON frames exchanged with live
//! subscribers over the push and streaming transports.
//!
//! Nothing here performs I/O or hashing. Sealing lives in
//! `talos-integrity`; delivery lives in `talos-stream`.

mod envelope;
mod wire;

pub use envelope::{Envelope, EnvelopeFields, Outcome, ParseOutcomeError, SCHEMA_VERSION};
pub use wire::{
    ClientMessage, CloseCode, ErrorCode, Filters, InitMessage, ServerMessage, PROTOCOL_VERSION,
};
