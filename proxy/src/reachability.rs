use crate::config::HostsConfig;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Finds an alternate address through which `host:port` can be reached directly.
///
/// Implementations may block on the network. Callers bound every probe with a timeout and
/// treat a timeout as "not reachable".
#[async_trait]
pub trait ReachabilityProber: Send + Sync {
    async fn probe(&self, host_port: &str) -> Option<String>;
}

/// Probes the alternate addresses configured under `hosts.mappings`.
pub struct HostsProber {
    mappings: HashMap<String, Vec<String>>,
    connect_timeout: Duration,
}

impl HostsProber {
    pub fn new(mappings: HashMap<String, Vec<String>>, connect_timeout: Duration) -> Self {
        HostsProber {
            mappings,
            connect_timeout,
        }
    }

    pub fn from_config(config: &HostsConfig) -> Self {
        HostsProber::new(
            config.mappings.clone(),
            Duration::from_millis(config.probe_timeout_ms),
        )
    }

    /// Exact host first, then ".domain" keys from the most to the least specific.
    fn alternates(&self, host: &str) -> Option<&[String]> {
        if let Some(addrs) = self.mappings.get(host) {
            return Some(addrs.as_slice());
        }

        let mut rest = host;
        loop {
            if let Some(addrs) = self.mappings.get(&format!(".{rest}")) {
                return Some(addrs.as_slice());
            }
            rest = rest.split_once('.')?.1;
        }
    }
}

#[async_trait]
impl ReachabilityProber for HostsProber {
    async fn probe(&self, host_port: &str) -> Option<String> {
        let (host, port) = host_port.rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;

        for addr in self.alternates(host)? {
            let candidate = format!("{addr}:{port}");
            match timeout(self.connect_timeout, TcpStream::connect(&candidate)).await {
                Ok(Ok(_)) => return Some(candidate),
                Ok(Err(e)) => {
                    tracing::debug!(host, candidate = %candidate, error = %e, "alternate address unreachable")
                }
                Err(_) => tracing::debug!(host, candidate = %candidate, "alternate address timed out"),
            }
        }
        None
    }
}
