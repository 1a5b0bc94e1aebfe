//! Transport servers. Both speak the same request envelope and share one
//! pipeline; they differ only in framing (newline-delimited JSON on the
//! stream socket, JSON-RPC 2.0 over HTTP).

pub mod auth_hook;
pub mod http;
pub mod socket;
