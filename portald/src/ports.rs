use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use shared::types::ServicePortKey;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("no free proxy port for {key} among {count} ports starting at {base}")]
    Exhausted { key: String, base: u16, count: u16 },
}

#[derive(Default)]
struct Table {
    /// Rotating probe counter
    next: u32,
    by_key: HashMap<ServicePortKey, u16>,
    by_port: HashMap<u16, ServicePortKey>,
}

/// Hands out proxy ports from a fixed range, one per live ServicePortKey.
///
/// Assignments live in memory and are stable for as long as the key is held.
/// All reads and writes go through one lock so concurrent callers never
/// observe a port handed to two keys.
pub struct PortAllocator {
    base: u16,
    count: u16,
    table: Mutex<Table>,
}

impl PortAllocator {
    /// `base + count` must not exceed 65536; config validation guarantees this.
    pub fn new(base: u16, count: u16) -> Self {
        Self {
            base,
            count,
            table: Mutex::new(Table::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        // The table is never left half-updated, so a poisoned lock is still usable
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return the port held by `key`, assigning a free one if it has none.
    pub fn get(&self, key: &ServicePortKey) -> Result<u16, PortError> {
        let mut table = self.lock();
        if let Some(port) = table.by_key.get(key) {
            return Ok(*port);
        }

        let count = u32::from(self.count);
        for _ in 0..count {
            table.next = table.next.wrapping_add(1);
            let candidate = self.base + (table.next % count) as u16;
            if table.by_port.contains_key(&candidate) {
                continue;
            }
            table.by_key.insert(key.clone(), candidate);
            table.by_port.insert(candidate, key.clone());
            tracing::debug!("Assigned proxy port {} to {}", candidate, key);
            return Ok(candidate);
        }

        Err(PortError::Exhausted {
            key: key.to_string(),
            base: self.base,
            count: self.count,
        })
    }

    /// Free the port held by `key`. Unknown keys are ignored.
    pub fn release(&self, key: &ServicePortKey) {
        let mut table = self.lock();
        if let Some(port) = table.by_key.remove(key) {
            table.by_port.remove(&port);
            tracing::debug!("Released proxy port {} from {}", port, key);
        }
    }

    pub fn lookup(&self, key: &ServicePortKey) -> Option<u16> {
        self.lock().by_key.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;
    use shared::types::ServiceIdentity;

    fn key(ns: &str, name: &str, port: &str) -> ServicePortKey {
        ServicePortKey::new(ServiceIdentity::new(ns, name).unwrap(), port)
    }

    #[test]
    fn test_get_is_stable_for_key() {
        let pm = PortAllocator::new(40000, 20000);
        let k = key("ns", "foo", "80");

        let first = pm.get(&k).unwrap();
        let second = pm.get(&k).unwrap();

        assert_eq!(first, second);
        assert!((40000..60000).contains(&first));
        assert_eq!(pm.len(), 1);
    }

    #[test]
    fn test_ports_unique_across_release_cycles() {
        let pm = PortAllocator::new(40000, 20000);
        let n = 500;

        let first: Vec<_> = (0..n).map(|i| key("ns", &format!("svc-{}", i), "http")).collect();
        for k in &first {
            pm.get(k).unwrap();
        }
        let ports: HashSet<u16> = first.iter().map(|k| pm.lookup(k).unwrap()).collect();
        assert_eq!(ports.len(), n);

        for k in first.iter().step_by(3) {
            pm.release(k);
        }

        let second: Vec<_> = (0..n).map(|i| key("other", &format!("svc-{}", i), "53")).collect();
        for k in &second {
            pm.get(k).unwrap();
        }

        let live: Vec<_> = first
            .iter()
            .chain(second.iter())
            .filter_map(|k| pm.lookup(k))
            .collect();
        let unique: HashSet<u16> = live.iter().copied().collect();
        assert_eq!(live.len(), pm.len());
        assert_eq!(unique.len(), live.len(), "two live keys share a proxy port");
    }

    #[test]
    fn test_release_is_idempotent() {
        let pm = PortAllocator::new(40000, 10);
        let k = key("ns", "foo", "80");
        pm.get(&k).unwrap();

        pm.release(&k);
        assert!(pm.is_empty());
        pm.release(&k);
        assert!(pm.is_empty());

        pm.release(&key("ns", "never", "80"));
        assert!(pm.is_empty());
    }

    #[test]
    fn test_released_port_is_reusable() {
        let pm = PortAllocator::new(40000, 2);
        let a = key("ns", "a", "80");
        let b = key("ns", "b", "80");
        let c = key("ns", "c", "80");

        let port_a = pm.get(&a).unwrap();
        pm.get(&b).unwrap();
        assert!(pm.get(&c).is_err());

        pm.release(&a);
        assert_eq!(pm.get(&c).unwrap(), port_a);
    }

    #[test]
    fn test_exhaustion_reports_error() {
        let pm = PortAllocator::new(50000, 3);
        for i in 0..3 {
            pm.get(&key("ns", &format!("svc-{}", i), "80")).unwrap();
        }

        let err = pm.get(&key("ns", "overflow", "80")).unwrap_err();
        assert!(matches!(err, PortError::Exhausted { base: 50000, count: 3, .. }));
        assert_eq!(pm.len(), 3);
    }

    #[test]
    fn test_concurrent_allocation() {
        let pm = Arc::new(PortAllocator::new(40000, 20000));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let pm = Arc::clone(&pm);
                thread::spawn(move || {
                    (0..100)
                        .map(|i| pm.get(&key("ns", &format!("t{}-{}", t, i), "80")).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }
        let unique: HashSet<u16> = all.iter().copied().collect();
        assert_eq!(all.len(), 800);
        assert_eq!(unique.len(), 800);
    }
}
