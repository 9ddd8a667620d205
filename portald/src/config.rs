use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use serde::Deserialize;
use anyhow::{bail, Context, Result};
use shared::protocol::{
    CONTAINER_PORTAL_CHAIN, HOST_PORTAL_CHAIN, NAT_TABLE, PROXY_PORT_BASE, PROXY_PORT_COUNT,
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub haproxy: HaproxyConfig,
    #[serde(default)]
    pub membership: MembershipConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RulesConfig {
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_container_chain")]
    pub container_chain: String,
    #[serde(default = "default_host_chain")]
    pub host_chain: String,
    /// Address the proxy binds to; a wildcard address selects REDIRECT for container traffic
    #[serde(default = "default_listen_ip")]
    pub listen_ip: IpAddr,
    /// Externally reachable host address; detected from the hostname when unset
    #[serde(default)]
    pub host_ip: Option<IpAddr>,
    #[serde(default = "default_iptables_path")]
    pub iptables_path: PathBuf,
    #[serde(default = "default_iptables_save_path")]
    pub iptables_save_path: PathBuf,
    /// Empty both portal chains once at startup
    #[serde(default = "default_flush_on_start")]
    pub flush_on_start: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortsConfig {
    #[serde(default = "default_port_base")]
    pub base: u16,
    #[serde(default = "default_port_count")]
    pub count: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HaproxyConfig {
    #[serde(default = "default_template_path")]
    pub template_path: PathBuf,
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,
    /// Program and leading arguments; the config path is appended
    #[serde(default = "default_reload_command")]
    pub reload_command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MembershipConfig {
    #[serde(default = "default_services_path")]
    pub services_path: PathBuf,
    #[serde(default = "default_endpoints_path")]
    pub endpoints_path: PathBuf,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Periodic re-convergence; 0 disables it
    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_table() -> String {
    NAT_TABLE.to_string()
}

fn default_container_chain() -> String {
    CONTAINER_PORTAL_CHAIN.to_string()
}

fn default_host_chain() -> String {
    HOST_PORTAL_CHAIN.to_string()
}

fn default_listen_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_iptables_path() -> PathBuf {
    PathBuf::from("iptables")
}

fn default_iptables_save_path() -> PathBuf {
    PathBuf::from("iptables-save")
}

fn default_flush_on_start() -> bool {
    true
}

fn default_port_base() -> u16 {
    PROXY_PORT_BASE
}

fn default_port_count() -> u16 {
    PROXY_PORT_COUNT
}

fn default_template_path() -> PathBuf {
    PathBuf::from("/etc/portald/haproxy.cfg.j2")
}

fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/haproxy/haproxy.cfg")
}

fn default_reload_command() -> Vec<String> {
    vec!["/reload-haproxy.sh".to_string()]
}

fn default_services_path() -> PathBuf {
    PathBuf::from("/var/lib/portald/services.json")
}

fn default_endpoints_path() -> PathBuf {
    PathBuf::from("/var/lib/portald/endpoints.json")
}

fn default_poll_interval() -> u64 {
    30
}

fn default_resync_interval() -> u64 {
    60
}

fn default_channel_capacity() -> usize {
    16
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            container_chain: default_container_chain(),
            host_chain: default_host_chain(),
            listen_ip: default_listen_ip(),
            host_ip: None,
            iptables_path: default_iptables_path(),
            iptables_save_path: default_iptables_save_path(),
            flush_on_start: default_flush_on_start(),
        }
    }
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            base: default_port_base(),
            count: default_port_count(),
        }
    }
}

impl Default for HaproxyConfig {
    fn default() -> Self {
        Self {
            template_path: default_template_path(),
            config_path: default_config_path(),
            reload_command: default_reload_command(),
        }
    }
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            services_path: default_services_path(),
            endpoints_path: default_endpoints_path(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            resync_interval_secs: default_resync_interval(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.ports.count == 0 {
            bail!("ports.count must be greater than zero");
        }
        if u32::from(self.ports.base) + u32::from(self.ports.count) > u32::from(u16::MAX) + 1 {
            bail!(
                "proxy port range {}+{} exceeds 65535",
                self.ports.base,
                self.ports.count
            );
        }
        if self.haproxy.reload_command.is_empty() {
            bail!("haproxy.reload_command must name a program");
        }
        if self.membership.poll_interval_secs == 0 {
            bail!("membership.poll_interval_secs must be greater than zero");
        }
        if self.sync.channel_capacity == 0 {
            bail!("sync.channel_capacity must be greater than zero");
        }
        Ok(())
    }
}
