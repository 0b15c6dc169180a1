//! `strata-server` is the I/O server of the strata database: it bootstraps
//! an instance from its options file, owns the request dispatcher and its
//! executor pool, and serves framed SQL and REST connections over TCP.

pub mod ast;
pub mod config;
pub mod dispatcher;
pub mod handler;
pub mod json_rows;
pub mod server;
pub mod trace;
