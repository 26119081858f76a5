use shared::{ChunkFraming, DEFAULT_PARALLELISM, PROTOCOL_VERSION, VERSION};
use std::net::SocketAddr;

/// Connection settings of a client
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Channel addresses, primary first
    pub addrs: Vec<SocketAddr>,
    pub username: String,
    pub protocol: i32,
    pub version: String,
    pub framing: ChunkFraming,
    /// World uploads at least this large are striped
    pub striping_threshold: usize,
    /// Ignore stray packets until the world stream starts
    pub rejoining: bool,
}

impl ClientConfig {
    /// Settings for a server whose channels sit on consecutive ports
    pub fn new(server: SocketAddr, parallelism: usize, username: &str) -> Self {
        let addrs = (0..parallelism.max(1))
            .filter_map(|channel| {
                let port = server.port().checked_add(u16::try_from(channel).ok()?)?;
                Some(SocketAddr::new(server.ip(), port))
            })
            .collect();
        Self::with_addrs(addrs, username)
    }

    /// Settings for explicit channel addresses
    pub fn with_addrs(addrs: Vec<SocketAddr>, username: &str) -> Self {
        Self {
            addrs,
            username: username.to_string(),
            protocol: PROTOCOL_VERSION,
            version: VERSION.to_string(),
            framing: ChunkFraming::Tagged,
            striping_threshold: 64 * 1024,
            rejoining: false,
        }
    }

    pub fn parallel_channels(&self) -> usize {
        self.addrs.len().saturating_sub(1)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        let server = SocketAddr::from(([127, 0, 0, 1], shared::DEFAULT_PORT));
        Self::new(server, DEFAULT_PARALLELISM, "Player")
    }
}
