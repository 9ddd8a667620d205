use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use serde::{Serialize, Deserialize};
use thiserror::Error;
use crate::protocol::DEFAULT_NAMESPACE;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("record in namespace {namespace:?} has no name")]
    MissingName { namespace: String },
}

/// Namespace + name pair uniquely naming a logical service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ServiceIdentity {
    namespace: String,
    name: String,
}

impl ServiceIdentity {
    /// An empty namespace normalises to `default`; an empty name is rejected.
    pub fn new(namespace: &str, name: &str) -> Result<Self, IdentityError> {
        let namespace = namespace.trim();
        let name = name.trim();
        if name.is_empty() {
            return Err(IdentityError::MissingName { namespace: namespace.to_string() });
        }
        let namespace = if namespace.is_empty() { DEFAULT_NAMESPACE } else { namespace };
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// One exposed port of a service; the unit of port allocation and rule installation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServicePortKey {
    pub service: ServiceIdentity,
    pub port: String,
}

impl ServicePortKey {
    pub fn new(service: ServiceIdentity, port: impl Into<String>) -> Self {
        Self { service, port: port.into() }
    }
}

/// Rendered as `namespace/name:port`, which is also the rule comment tag.
impl fmt::Display for ServicePortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.port)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[default]
    #[serde(rename = "TCP", alias = "tcp")]
    Tcp,
    #[serde(rename = "UDP", alias = "udp")]
    Udp,
}

impl Protocol {
    /// Lowercase form used by packet-filter match arguments
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    /// Port name; may be empty for single-port services
    #[serde(default)]
    pub name: String,

    /// Virtual (portal) port clients connect to
    pub port: u16,

    #[serde(default)]
    pub protocol: Protocol,
}

impl ServicePort {
    /// Allocation key component: the port name, or the port number when unnamed.
    pub fn key_part(&self) -> String {
        if self.name.is_empty() {
            self.port.to_string()
        } else {
            self.name.clone()
        }
    }
}

/// A service as delivered by the membership source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub name: String,

    /// Virtual address clients use to reach the service
    pub portal_ip: IpAddr,

    #[serde(default)]
    pub ports: Vec<ServicePort>,

    /// Additional public-facing virtual addresses
    #[serde(default)]
    pub public_ips: Vec<IpAddr>,

    /// Revision of the source object this record was built from
    #[serde(default)]
    pub revision: String,
}

impl ServiceRecord {
    pub fn identity(&self) -> Result<ServiceIdentity, IdentityError> {
        ServiceIdentity::new(&self.namespace, &self.name)
    }
}

/// Backend membership of a service as delivered by the membership source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRecord {
    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub addresses: BTreeSet<SocketAddr>,
}

impl EndpointRecord {
    pub fn identity(&self) -> Result<ServiceIdentity, IdentityError> {
        ServiceIdentity::new(&self.namespace, &self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_defaults_namespace() {
        let id = ServiceIdentity::new("", "foo").unwrap();
        assert_eq!(id.namespace(), "default");
        assert_eq!(id.to_string(), "default/foo");
    }

    #[test]
    fn test_identity_requires_name() {
        let err = ServiceIdentity::new("ns", "  ").unwrap_err();
        assert_eq!(err, IdentityError::MissingName { namespace: "ns".to_string() });
    }

    #[test]
    fn test_port_key_display() {
        let id = ServiceIdentity::new("ns", "foo").unwrap();
        let named = ServicePort { name: "http".to_string(), port: 80, protocol: Protocol::Tcp };
        let unnamed = ServicePort { name: String::new(), port: 53, protocol: Protocol::Udp };

        assert_eq!(ServicePortKey::new(id.clone(), named.key_part()).to_string(), "ns/foo:http");
        assert_eq!(ServicePortKey::new(id, unnamed.key_part()).to_string(), "ns/foo:53");
    }

    #[test]
    fn test_service_record_wire_format() {
        let json = r#"{
            "namespace": "ns",
            "name": "foo",
            "portal_ip": "10.0.0.10",
            "ports": [{"port": 80}, {"name": "dns", "port": 53, "protocol": "UDP"}],
            "public_ips": ["192.0.2.7"]
        }"#;
        let record: ServiceRecord = serde_json::from_str(json).unwrap();

        assert_eq!(record.identity().unwrap().to_string(), "ns/foo");
        assert_eq!(record.ports[0].protocol, Protocol::Tcp);
        assert_eq!(record.ports[1].protocol, Protocol::Udp);
        assert_eq!(record.public_ips.len(), 1);
        assert!(record.revision.is_empty());
    }
}
