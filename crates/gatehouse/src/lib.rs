//! # Gatehouse - Portcullis node service
//!
//! Keeps a replicated trust registry of code identities, admits attested
//! nodes whose code is trusted, and coordinates cluster membership through
//! the agreement layer.
//!
//! ## Architecture
//! ```text
//! candidate ─► POST /node/join ─► attestation ─► registry check ─► membership change
//!                                                                        │
//! consortium ─► POST /gov/code/* ─► registry change ──────────────► agreed log
//!                                                                        │
//!                                              every member applies entries in order
//! ```

pub mod admission;
pub mod attestation;
pub mod config;
pub mod consensus;
pub mod governance;
pub mod ledger;
pub mod membership;
pub mod registry;
pub mod routes;
pub mod state;
