use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use anyhow::{bail, Result};
use serde::Serialize;
use shared::types::{
    EndpointRecord, Protocol, ServiceIdentity, ServicePort, ServicePortKey, ServiceRecord,
};
use crate::ports::PortAllocator;
use crate::rules::portal::{Portal, PortalInstaller};
use crate::rules::RuleTable;

/// Render-ready join of a service, its endpoints and its proxy ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceState {
    /// `namespace-name`, usable as a load-balancer section name
    pub name: String,
    pub namespace: String,
    pub service: String,
    pub portal_ip: IpAddr,
    pub public_ips: Vec<IpAddr>,
    pub revision: String,
    pub ports: Vec<PortState>,
    pub backends: Vec<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortState {
    pub key: String,
    pub name: String,
    pub port: u16,
    pub protocol: Protocol,
    pub proxy_port: u16,
}

/// Output of [`Reconciler::reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderState {
    pub services: BTreeMap<ServiceIdentity, ServiceState>,
    /// Services with no endpoint record, left out of `services`
    pub unmatched: Vec<ServiceIdentity>,
}

/// Port-level changes made by one service snapshot.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SnapshotDelta {
    pub added: Vec<ServicePortKey>,
    pub changed: Vec<ServicePortKey>,
    pub removed: Vec<ServicePortKey>,
}

/// Redirection wanted for a key, before a proxy port is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PortalSpec {
    ip: IpAddr,
    port: u16,
    protocol: Protocol,
    public_ips: Vec<IpAddr>,
}

impl PortalSpec {
    fn is_installed_as(&self, portal: &Portal) -> bool {
        self.with_proxy_port(portal.proxy_port) == *portal
    }

    fn with_proxy_port(&self, proxy_port: u16) -> Portal {
        Portal {
            ip: self.ip,
            port: self.port,
            protocol: self.protocol,
            public_ips: self.public_ips.clone(),
            proxy_port,
        }
    }
}

/// Owns the latest service and endpoint records and converges proxy ports
/// and portal rules to them. Driven from a single task; only the port
/// allocator is shared.
pub struct Reconciler<T> {
    services: BTreeMap<ServiceIdentity, ServiceRecord>,
    endpoints: HashMap<ServiceIdentity, EndpointRecord>,
    portals: BTreeMap<ServicePortKey, PortalSpec>,
    /// Portals whose rules could not be removed yet. Their keys keep the
    /// proxy port until removal succeeds, so no other key can inherit a
    /// port that stale rules still redirect to.
    stale: Vec<(ServicePortKey, Portal)>,
    ports: Arc<PortAllocator>,
    installer: PortalInstaller<T>,
}

impl<T: RuleTable> Reconciler<T> {
    pub fn new(ports: Arc<PortAllocator>, installer: PortalInstaller<T>) -> Self {
        Self {
            services: BTreeMap::new(),
            endpoints: HashMap::new(),
            portals: BTreeMap::new(),
            stale: Vec::new(),
            ports,
            installer,
        }
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Replace the service set and tear down ports and rules of keys that went away.
    ///
    /// Keys whose portal changed keep their proxy port; their old rules are
    /// closed here and the new ones are opened by [`Self::ensure_rules`].
    /// A removed key releases its proxy port only once its rules are gone;
    /// failed removals are retried by [`Self::ensure_rules`].
    pub fn apply_service_snapshot(&mut self, records: Vec<ServiceRecord>) -> SnapshotDelta {
        let mut services = BTreeMap::new();
        for record in records {
            match record.identity() {
                Ok(id) => {
                    let Some(record) = ipv4_portals_only(&id, record) else {
                        continue;
                    };
                    if services.insert(id.clone(), record).is_some() {
                        tracing::warn!("Duplicate service record for {}, keeping the last", id);
                    }
                }
                Err(e) => tracing::warn!("Skipping service record: {}", e),
            }
        }

        let desired = desired_portals(&services);
        let mut delta = SnapshotDelta::default();

        for (key, old) in &self.portals {
            match desired.get(key) {
                None => {
                    if let Some(proxy_port) = self.ports.lookup(key) {
                        self.stale.push((key.clone(), old.with_proxy_port(proxy_port)));
                    }
                    delta.removed.push(key.clone());
                }
                Some(new) if new != old => {
                    if let Some(proxy_port) = self.ports.lookup(key) {
                        self.stale.push((key.clone(), old.with_proxy_port(proxy_port)));
                    }
                    delta.changed.push(key.clone());
                }
                Some(_) => {}
            }
        }

        for key in desired.keys() {
            if !self.portals.contains_key(key) {
                delta.added.push(key.clone());
            }
        }

        // Rules wanted again must not be deleted by a pending removal
        self.stale
            .retain(|(key, portal)| !desired.get(key).is_some_and(|spec| spec.is_installed_as(portal)));

        self.services = services;
        self.portals = desired;

        // Removals first so their ports are free for the added keys
        self.remove_stale();
        for key in &delta.added {
            if let Err(e) = self.ports.get(key) {
                tracing::error!("{}", e);
            }
        }

        if !delta.added.is_empty() || !delta.changed.is_empty() || !delta.removed.is_empty() {
            tracing::info!(
                "Service snapshot: {} services, {} ports added, {} changed, {} removed",
                self.services.len(),
                delta.added.len(),
                delta.changed.len(),
                delta.removed.len()
            );
        }

        delta
    }

    /// Replace the endpoint set. Ports and rules are keyed on services, so nothing else changes.
    pub fn apply_endpoint_snapshot(&mut self, records: Vec<EndpointRecord>) {
        let mut endpoints = HashMap::with_capacity(records.len());
        for record in records {
            match record.identity() {
                Ok(id) => {
                    endpoints.insert(id, record);
                }
                Err(e) => tracing::warn!("Skipping endpoint record: {}", e),
            }
        }
        tracing::debug!("Endpoint snapshot: {} services", endpoints.len());
        self.endpoints = endpoints;
    }

    /// Join services with endpoints.
    ///
    /// A service without an endpoint record is reported in `unmatched` and
    /// left out until a later snapshot supplies one. Ports still lacking a
    /// proxy port are left out of their service.
    pub fn reconcile(&self) -> RenderState {
        let mut state = RenderState::default();

        for (id, service) in &self.services {
            let Some(endpoints) = self.endpoints.get(id) else {
                tracing::info!("No endpoints for service {}, leaving it out of the config", id);
                state.unmatched.push(id.clone());
                continue;
            };

            let mut ports = Vec::with_capacity(service.ports.len());
            for (key, port) in keyed_ports(id, service) {
                match self.ports.lookup(&key) {
                    Some(proxy_port) => ports.push(PortState {
                        key: key.to_string(),
                        name: port.key_part(),
                        port: port.port,
                        protocol: port.protocol,
                        proxy_port,
                    }),
                    None => tracing::warn!("No proxy port for {}, leaving it out of the config", key),
                }
            }

            state.services.insert(
                id.clone(),
                ServiceState {
                    name: format!("{}-{}", id.namespace(), id.name()),
                    namespace: id.namespace().to_string(),
                    service: id.name().to_string(),
                    portal_ip: service.portal_ip,
                    public_ips: service.public_ips.clone(),
                    revision: service.revision.clone(),
                    ports,
                    backends: endpoints.addresses.iter().copied().collect(),
                },
            );
        }

        state
    }

    /// Retry pending removals, then allocate missing proxy ports and
    /// re-assert the rules of every current key.
    ///
    /// A failing key is logged and skipped so the rest still converge. Rules
    /// left behind by an earlier process are not swept.
    pub fn ensure_rules(&mut self) -> Result<()> {
        let mut failed: Vec<String> = self
            .remove_stale()
            .into_iter()
            .map(|key| format!("{} (removal)", key))
            .collect();

        for (key, spec) in &self.portals {
            let proxy_port = match self.ports.get(key) {
                Ok(port) => port,
                Err(e) => {
                    tracing::error!("{}", e);
                    failed.push(key.to_string());
                    continue;
                }
            };
            if let Err(e) = self.installer.open(key, &spec.with_proxy_port(proxy_port)) {
                tracing::warn!("Failed to ensure portal for {}: {}", key, e);
                failed.push(key.to_string());
            }
        }

        if !failed.is_empty() {
            bail!(
                "{} of {} portals failed to converge: {}",
                failed.len(),
                self.portals.len() + self.stale.len(),
                failed.join(", ")
            );
        }
        Ok(())
    }

    /// Close every pending portal and release the ports of removed keys that
    /// have nothing left installed. Returns the keys still pending.
    fn remove_stale(&mut self) -> Vec<ServicePortKey> {
        let mut closed = Vec::new();
        for (key, portal) in std::mem::take(&mut self.stale) {
            match self.installer.close(&key, &portal) {
                Ok(()) => closed.push(key),
                Err(e) => {
                    tracing::warn!("Failed to close portal for {}, will retry: {}", key, e);
                    self.stale.push((key, portal));
                }
            }
        }

        for key in closed {
            if !self.portals.contains_key(&key) && !self.stale.iter().any(|(k, _)| *k == key) {
                self.ports.release(&key);
            }
        }
        self.stale.iter().map(|(key, _)| key.clone()).collect()
    }
}

/// Portal rules are installed with the IPv4 iptables tool, so IPv6 portal
/// addresses are dropped. A service whose primary portal is IPv6 is skipped.
fn ipv4_portals_only(id: &ServiceIdentity, mut record: ServiceRecord) -> Option<ServiceRecord> {
    if record.portal_ip.is_ipv6() {
        tracing::warn!("Skipping service {}: IPv6 portal {} is not supported", id, record.portal_ip);
        return None;
    }
    record.public_ips.retain(|ip| {
        if ip.is_ipv6() {
            tracing::warn!("Ignoring IPv6 public address {} of service {}", ip, id);
        }
        ip.is_ipv4()
    });
    Some(record)
}

/// Ports of a service with their keys. A port whose key repeats an earlier
/// one (same number, no name) is dropped, as both would need one proxy port.
fn keyed_ports<'a>(
    id: &'a ServiceIdentity,
    service: &'a ServiceRecord,
) -> impl Iterator<Item = (ServicePortKey, &'a ServicePort)> + 'a {
    let mut seen = HashSet::new();
    service.ports.iter().filter_map(move |port| {
        let key = ServicePortKey::new(id.clone(), port.key_part());
        seen.insert(key.clone()).then_some((key, port))
    })
}

fn desired_portals(services: &BTreeMap<ServiceIdentity, ServiceRecord>) -> BTreeMap<ServicePortKey, PortalSpec> {
    let mut desired = BTreeMap::new();
    for (id, service) in services {
        let mut kept = 0;
        for (key, port) in keyed_ports(id, service) {
            kept += 1;
            desired.insert(
                key,
                PortalSpec {
                    ip: service.portal_ip,
                    port: port.port,
                    protocol: port.protocol,
                    public_ips: service.public_ips.clone(),
                },
            );
        }
        if kept < service.ports.len() {
            tracing::warn!(
                "Service {} has unnamed ports sharing a number; ignoring {} of them, name the ports to expose all",
                id,
                service.ports.len() - kept
            );
        }
    }
    desired
}
