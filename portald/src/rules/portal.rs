//! Portal redirection rules.
//!
//! Each portal gets two NAT rules:
//!
//! - a container-chain rule (linked from PREROUTING) for traffic arriving on
//!   an interface. A proxy bound to a wildcard address is reached with
//!   REDIRECT, so replies leave from the interface the request came in on.
//!   A proxy bound to a specific address is reached with DNAT to it.
//! - a host-chain rule (linked from OUTPUT) for locally originated traffic.
//!   REDIRECT sends this to loopback while replies come from the primary
//!   address, so it always uses DNAT. A wildcard-bound proxy is targeted at
//!   the host's externally reachable address instead.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use anyhow::{bail, Context, Result};
use shared::protocol::{CHAIN_OUTPUT, CHAIN_PREROUTING};
use shared::types::{Protocol, ServicePortKey};
use super::{RuleError, RuleTable};
use crate::config::RulesConfig;

/// Table and chain names the installer writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalChains {
    pub table: String,
    pub container: String,
    pub host: String,
}

impl From<&RulesConfig> for PortalChains {
    fn from(config: &RulesConfig) -> Self {
        Self {
            table: config.table.clone(),
            container: config.container_chain.clone(),
            host: config.host_chain.clone(),
        }
    }
}

/// Desired redirection for one ServicePortKey.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Portal {
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub public_ips: Vec<IpAddr>,
    pub proxy_port: u16,
}

impl Portal {
    fn addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
        std::iter::once(self.ip).chain(self.public_ips.iter().copied())
    }
}

pub struct PortalInstaller<T> {
    table: T,
    chains: PortalChains,
    listen_ip: IpAddr,
    host_ip: IpAddr,
}

impl<T: RuleTable> PortalInstaller<T> {
    pub fn new(table: T, chains: PortalChains, listen_ip: IpAddr, host_ip: IpAddr) -> Self {
        Self {
            table,
            chains,
            listen_ip,
            host_ip,
        }
    }

    /// Ensure both portal chains exist and are jumped to. Safe to repeat.
    pub fn init(&self) -> Result<(), RuleError> {
        let jump = |chain: &str| vec!["-j".to_string(), chain.to_string()];
        let links = [
            (&self.chains.container, CHAIN_PREROUTING),
            (&self.chains.host, CHAIN_OUTPUT),
        ];

        for (chain, builtin) in links {
            self.table.ensure_chain(&self.chains.table, chain)?;
            self.table.ensure_rule(&self.chains.table, builtin, &jump(chain))?;
        }

        tracing::info!(
            "Portal chains {} and {} ready in table {}",
            self.chains.container,
            self.chains.host,
            self.chains.table
        );
        Ok(())
    }

    /// Startup sequence: create and link the chains, then empty them when asked.
    ///
    /// Flushing comes second because iptables refuses to flush a chain that
    /// does not exist yet.
    pub fn start(&self, flush: bool) -> Result<(), RuleError> {
        self.init()?;
        if flush {
            self.flush()?;
            tracing::info!("Flushed portal chains");
        }
        Ok(())
    }

    /// Empty both portal chains. Drops every installed portal at once.
    pub fn flush(&self) -> Result<(), RuleError> {
        let errors: Vec<RuleError> = [&self.chains.container, &self.chains.host]
            .into_iter()
            .filter_map(|chain| self.table.flush_chain(&self.chains.table, chain).err())
            .collect();

        if !errors.is_empty() {
            tracing::error!("Errors flushing portal chains: {:?}", errors);
        }
        RuleError::aggregate(errors)
    }

    /// Ensure both rules for the portal address and every public address.
    ///
    /// Stops at the first failure; rules already installed stay in place.
    pub fn open(&self, key: &ServicePortKey, portal: &Portal) -> Result<(), RuleError> {
        for ip in portal.addresses() {
            self.open_one(key, ip, portal)?;
        }
        Ok(())
    }

    fn open_one(&self, key: &ServicePortKey, ip: IpAddr, portal: &Portal) -> Result<(), RuleError> {
        let rules = [
            (&self.chains.container, self.container_args(key, ip, portal), "from-containers"),
            (&self.chains.host, self.host_args(key, ip, portal), "from-host"),
        ];

        for (chain, args, kind) in rules {
            let existed = self
                .table
                .ensure_rule(&self.chains.table, chain, &args)
                .inspect_err(|e| {
                    tracing::error!("Failed to install {} rule for {}: {}", chain, key, e);
                })?;
            if !existed {
                tracing::info!(
                    "Opened {} portal for {} on {} {}",
                    kind,
                    key,
                    portal.protocol,
                    SocketAddr::new(ip, portal.port)
                );
            }
        }
        Ok(())
    }

    /// Delete both rules for every address, collecting all failures.
    pub fn close(&self, key: &ServicePortKey, portal: &Portal) -> Result<(), RuleError> {
        let mut errors = Vec::new();

        for ip in portal.addresses() {
            let rules = [
                (&self.chains.container, self.container_args(key, ip, portal)),
                (&self.chains.host, self.host_args(key, ip, portal)),
            ];
            for (chain, args) in rules {
                if let Err(e) = self.table.delete_rule(&self.chains.table, chain, &args) {
                    tracing::error!("Failed to delete {} rule for {}: {}", chain, key, e);
                    errors.push(e);
                }
            }
        }

        if errors.is_empty() {
            tracing::info!("Closed portals for {}", key);
        } else {
            tracing::error!("{} error(s) closing portals for {}", errors.len(), key);
        }
        RuleError::aggregate(errors)
    }

    fn container_args(&self, key: &ServicePortKey, ip: IpAddr, portal: &Portal) -> Vec<String> {
        container_portal_args(key, ip, portal.port, portal.protocol, self.listen_ip, portal.proxy_port)
    }

    fn host_args(&self, key: &ServicePortKey, ip: IpAddr, portal: &Portal) -> Vec<String> {
        let target = if self.listen_ip.is_unspecified() { self.host_ip } else { self.listen_ip };
        host_portal_args(key, ip, portal.port, portal.protocol, target, portal.proxy_port)
    }
}

/// Match arguments shared by both portal rules.
///
/// Spelled exactly as iptables-save prints them; the save-based existence
/// check compares fields literally (hence the explicit prefix length).
pub fn common_portal_args(key: &ServicePortKey, dest: IpAddr, port: u16, protocol: Protocol) -> Vec<String> {
    let prefix = if dest.is_ipv4() { 32 } else { 128 };
    vec![
        "-m".to_string(),
        "comment".to_string(),
        "--comment".to_string(),
        key.to_string(),
        "-p".to_string(),
        protocol.as_str().to_string(),
        "-m".to_string(),
        protocol.as_str().to_string(),
        "-d".to_string(),
        format!("{}/{}", dest, prefix),
        "--dport".to_string(),
        port.to_string(),
    ]
}

pub fn container_portal_args(
    key: &ServicePortKey,
    dest: IpAddr,
    port: u16,
    protocol: Protocol,
    proxy_ip: IpAddr,
    proxy_port: u16,
) -> Vec<String> {
    let mut args = common_portal_args(key, dest, port, protocol);
    if proxy_ip.is_unspecified() {
        args.extend(["-j".to_string(), "REDIRECT".to_string(), "--to-ports".to_string(), proxy_port.to_string()]);
    } else {
        args.extend(dnat_target(proxy_ip, proxy_port));
    }
    args
}

pub fn host_portal_args(
    key: &ServicePortKey,
    dest: IpAddr,
    port: u16,
    protocol: Protocol,
    proxy_ip: IpAddr,
    proxy_port: u16,
) -> Vec<String> {
    let mut args = common_portal_args(key, dest, port, protocol);
    args.extend(dnat_target(proxy_ip, proxy_port));
    args
}

fn dnat_target(ip: IpAddr, port: u16) -> [String; 4] {
    [
        "-j".to_string(),
        "DNAT".to_string(),
        "--to-destination".to_string(),
        SocketAddr::new(ip, port).to_string(),
    ]
}

/// Pick the address host-originated traffic is DNATed to.
///
/// Uses the configured address if set. Otherwise, when the proxy listens on
/// a wildcard address, resolves the system hostname and takes the first
/// non-loopback address of the same family.
pub fn resolve_host_ip(config: &RulesConfig) -> Result<IpAddr> {
    if let Some(ip) = config.host_ip {
        return Ok(ip);
    }
    if !config.listen_ip.is_unspecified() {
        return Ok(config.listen_ip);
    }

    let hostname = hostname::get()
        .context("Failed to get system hostname")?
        .to_string_lossy()
        .to_string();

    let addrs: Vec<IpAddr> = (hostname.as_str(), 0)
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve hostname {}", hostname))?
        .map(|addr| addr.ip())
        .collect();

    match pick_host_ip(&addrs, config.listen_ip.is_ipv4()) {
        Some(ip) => {
            tracing::info!("Using {} ({}) as host address", ip, hostname);
            Ok(ip)
        }
        None => bail!(
            "hostname {} has no non-loopback address; set rules.host_ip",
            hostname
        ),
    }
}

fn pick_host_ip(addrs: &[IpAddr], want_v4: bool) -> Option<IpAddr> {
    addrs
        .iter()
        .copied()
        .find(|ip| !ip.is_loopback() && !ip.is_unspecified() && ip.is_ipv4() == want_v4)
}
