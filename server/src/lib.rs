//! # Bridge Server
//!
//! A local bridge that exposes a browser — via a sideloaded extension —
//! as a set of high-level tools to an AI agent over stdio JSON-RPC.
//!
//! ## Architecture
//!
//! ```text
//! Agent ──stdio──► Dispatcher ──ACL──► Router ──WS──► Extension
//!                     │                  ▲
//!                     │   (multiplexer)  │
//! Agent ──stdio──► Follower ────WS────► Leader
//! ```
//!
//! ## Modules
//!
//! - [`agent`]       — stdio JSON-RPC channel to the agent
//! - [`connection`]  — lifecycle state machine and event loop
//! - [`router`]      — request/response correlation and deadlines
//! - [`transport`]   — extension WebSocket endpoint and the multiplexer
//! - [`sessions`]    — session registry and the per-tab ACL
//! - [`tools`]       — tool catalog, validation, dispatch
//! - [`humanize`]    — Bezier mouse-path generation
//! - [`secure_eval`] — static policy for evaluated page code
//! - [`whitelist`]   — navigation allow-list lifecycle
//! - [`status`]      — the response status header

pub mod agent;
pub mod cli;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod experiments;
pub mod humanize;
pub mod router;
pub mod secure_eval;
pub mod sessions;
pub mod status;
pub mod tools;
pub mod transport;
pub mod whitelist;
