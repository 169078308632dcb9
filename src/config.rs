use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// How the node talks to its poller: a TCP listener, or the process's own
/// stdin/stdout pair (the mode munin calls "plain" / inetd-style).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Stream,
    Socket(u16),
}

/// Immutable configuration resolved once at startup and passed by reference
/// to both the listener and the dispatcher.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub transport: Transport,
    pub plugin_dir: PathBuf,
    pub host: String,
    pub spool_dir: Option<PathBuf>,
    pub idle_timeout: Duration,
}

impl ServerConfig {
    /// Validate and absolutize the startup options. Plugins are spawned with
    /// the node's inherited working directory, so all paths are resolved to
    /// absolute form here rather than at invocation time.
    pub fn resolve(
        port: Option<u16>,
        plugin_dir: PathBuf,
        host: String,
        spool_dir: Option<PathBuf>,
        idle_timeout: Duration,
    ) -> Result<Self> {
        let plugin_dir = plugin_dir
            .canonicalize()
            .with_context(|| format!("plugin directory {} not found", plugin_dir.display()))?;
        if !plugin_dir.is_dir() {
            bail!("plugin path {} is not a directory", plugin_dir.display());
        }
        let spool_dir = match spool_dir {
            Some(dir) => {
                let dir = dir
                    .canonicalize()
                    .with_context(|| format!("spoolfetch directory {} not found", dir.display()))?;
                if !dir.is_dir() {
                    bail!("spoolfetch path {} is not a directory", dir.display());
                }
                Some(dir)
            }
            None => None,
        };
        Ok(ServerConfig {
            transport: port.map_or(Transport::Stream, Transport::Socket),
            plugin_dir,
            host,
            spool_dir,
            idle_timeout,
        })
    }

    /// Path of the spoolfetch helper for this host, if spooling is enabled.
    pub fn spool_helper(&self) -> Option<PathBuf> {
        self.spool_dir
            .as_ref()
            .map(|dir| dir.join(format!("spoolfetch_{}", self.host)))
    }
}
