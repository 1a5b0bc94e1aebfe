//! agent-device daemon: a single-host control plane for driving iOS and
//! Android devices (simulators, emulators, physical hardware) on behalf
//! of automated clients.
//!
//! The daemon owns device sessions, mediates concurrent client requests,
//! enforces multi-tenant isolation via leases, supervises long-running
//! external processes (runner builds, log streams, recordings), and
//! serves the same request envelope over two transports: line-delimited
//! JSON on a loopback stream socket and JSON-RPC 2.0 over loopback HTTP.
//!
//! # Architecture
//!
//! - [`pipeline`]: the ordered admission stages every request passes
//!   through (token, aliases, tenant scoping, lease admission, selector
//!   compatibility, handler groups, dispatch, journaling).
//! - [`sessions`]: named, device-bound units of work with an on-disk
//!   replay journal.
//! - [`leases`]: tenant/run-scoped admission tokens with TTL.
//! - [`dispatch`] + [`devices`] + [`capability`]: command routing to the
//!   platform backends behind the capability matrix.
//! - [`transport`]: the socket and HTTP servers.
//! - [`supervisor`]: subprocess execution, managed children, orphan
//!   sweeps.
//! - [`lifecycle`] + [`commands`]: singleton election, metadata, CLI.

pub mod bootstrap;
pub mod cancel;
pub mod capability;
pub mod commands;
pub mod devices;
pub mod diagnostics;
pub mod dispatch;
pub mod identity;
pub mod leases;
pub mod lifecycle;
pub mod pipeline;
pub mod sessions;
pub mod supervisor;
pub mod transport;
pub mod util;

pub use pipeline::Pipeline;
