/// Packet-filter table holding the portal chains
pub const NAT_TABLE: &str = "nat";

/// Built-in chains the portal chains are linked from
pub const CHAIN_PREROUTING: &str = "PREROUTING";
pub const CHAIN_OUTPUT: &str = "OUTPUT";

/// Custom chains owned by the daemon
pub const CONTAINER_PORTAL_CHAIN: &str = "PORTALS-CONTAINER";
pub const HOST_PORTAL_CHAIN: &str = "PORTALS-HOST";

/// Proxy port range: [PROXY_PORT_BASE, PROXY_PORT_BASE + PROXY_PORT_COUNT)
pub const PROXY_PORT_BASE: u16 = 40000;
pub const PROXY_PORT_COUNT: u16 = 20000;

/// Namespace assumed when a record carries none
pub const DEFAULT_NAMESPACE: &str = "default";
