//! babble-server: a multi-client babble (micro-blogging) server.
//!
//! Clients log in under a unique identifier, publish short messages,
//! follow each other and read their timeline.
//!
//! ## Architecture
//!
//! ```text
//!  accept loop ──spawn──> connection handler (one thread per client)
//!                               │ LOGIN runs inline, registers in
//!                               │ the client directory
//!                               ▼
//!                        bounded command queue (FIFO)
//!                               │
//!                               ▼
//!                        worker pool ──answers──> client connection
//! ```
//!
//! - [`registration`]: concurrent client directory
//! - [`protocol`]: request parsing and answer framing
//! - [`queue`]: bounded handoff queue and per-connection ordering
//! - [`commands`]: dispatch to the babble handlers
//! - [`worker`]: executor threads
//! - [`server`]: accept loop and connection handlers

pub mod commands;
pub mod config;
pub mod protocol;
pub mod queue;
pub mod registration;
pub mod semaphore;
pub mod server;
pub mod storage;
pub mod worker;
