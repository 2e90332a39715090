use std::net::IpAddr;
use tracing::warn;

/// Size of the connection table; file descriptors at or above this value
/// are rejected at accept.
pub const MAX_CONNECTIONS: usize = 16384;

/// Maximum number of event loops; a set of loop indices must fit in a
/// 64-bit mask.
pub const MAX_LOOPS: usize = 62;

/// Size of the per-loop receive buffer.
pub const BUF_SIZE: usize = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    host: IpAddr,
    port: u16,
    threads: usize,
    tcp_nodelay: bool,
    jsonrpc2: bool,
}

impl Config {
    /// Creates a config with a single event loop, `TCP_NODELAY` on and
    /// plain JSON error bodies.
    pub fn new(host: IpAddr, port: u16) -> Self {
        Self {
            host,
            port,
            threads: 1,
            tcp_nodelay: true,
            jsonrpc2: false,
        }
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Sets the number of event loops, clamped to `1..=MAX_LOOPS`.
    pub fn set_threads(&mut self, threads: usize) {
        self.threads = if threads < 1 {
            1
        } else if threads > MAX_LOOPS {
            warn!("max threads is {}", MAX_LOOPS);
            MAX_LOOPS
        } else {
            threads
        };
    }

    pub fn tcp_nodelay(&self) -> bool {
        self.tcp_nodelay
    }

    pub fn set_tcp_nodelay(&mut self, tcp_nodelay: bool) {
        self.tcp_nodelay = tcp_nodelay;
    }

    pub fn jsonrpc2(&self) -> bool {
        self.jsonrpc2
    }

    /// When set, error bodies carry the JSON-RPC 2.0 envelope.
    pub fn set_jsonrpc2(&mut self, jsonrpc2: bool) {
        self.jsonrpc2 = jsonrpc2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threads_are_clamped() {
        let mut config = Config::new("127.0.0.1".parse().unwrap(), 8001);
        assert_eq!(config.threads(), 1);

        config.set_threads(0);
        assert_eq!(config.threads(), 1);

        config.set_threads(16);
        assert_eq!(config.threads(), 16);

        config.set_threads(1000);
        assert_eq!(config.threads(), MAX_LOOPS);
    }
}
