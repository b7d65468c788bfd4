//! Low-level primitives for building the storage engine.
//!
//! Includes byte utilities, the embedded transactional key/value engine, and
//! host queries.

/// Byte-level utilities and encoding/decoding.
///
/// Order-preserving encoders, varints and a bounds-checked reader.
pub mod bytes;

/// Embedded ordered key/value engine.
///
/// Connections, sessions, snapshot transactions, cursors, checkpoints and the
/// journal.
pub mod engine;

/// Host resource queries.
pub mod sys;
