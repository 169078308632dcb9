//! A minimal munin node: answers the munin line protocol over TCP or
//! stdin/stdout and relays the output of local plugin executables.

pub mod config;
pub mod plugins;
pub mod proto;
pub mod server;
