//! DNS record propagation.
//!
//! Every (instance, network) pair is advertised under two names that must
//! always point at the same address:
//!
//! ```text
//! <index>.<job>.<network>.<deployment>.<root>
//! <uuid>.<job>.<network>.<deployment>.<root>
//! ```
//!
//! [`DnsPropagator`] builds the complete set before touching any backend, so
//! a malformed network never leaves one name form updated without the other.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::model::InstanceRecord;

/// DNS errors.
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("invalid DNS name component '{input}': {reason}")]
    InvalidCanonicalName { input: String, reason: &'static str },

    #[error("apply spec has no networks")]
    MissingNetworks,

    #[error("network '{0}' has no ip")]
    MissingIp(String),

    #[error("network '{network}' has invalid ip '{ip}'")]
    InvalidIp { network: String, ip: String },

    #[error("dns backend failed")]
    Backend(#[source] anyhow::Error),
}

/// Name → address mapping pushed to DNS backends.
pub type DnsRecordSet = BTreeMap<String, IpAddr>;

/// A DNS backend.
#[async_trait]
pub trait DnsManager: Send + Sync {
    /// Replace the records of `instance` with `records`.
    async fn update_dns_record_for_instance(
        &self,
        instance: &InstanceRecord,
        records: &DnsRecordSet,
    ) -> anyhow::Result<()>;

    async fn flush_dns_cache(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Lowercase, `_` to `-`, drop anything outside `[a-z0-9-]`. The result must
/// start with a letter and must not end with a hyphen.
pub fn canonical(input: &str) -> Result<String, DnsError> {
    let name: String = input
        .to_lowercase()
        .chars()
        .map(|c| if c == '_' { '-' } else { c })
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect();

    let invalid = |reason| DnsError::InvalidCanonicalName {
        input: input.to_string(),
        reason,
    };

    match name.chars().next() {
        None => Err(invalid("empty after canonicalization")),
        Some(first) if !first.is_ascii_lowercase() => Err(invalid("must start with a letter")),
        _ if name.ends_with('-') => Err(invalid("must not end with a hyphen")),
        _ => Ok(name),
    }
}

/// `<hostname>.<job>.<network>.<deployment>.<root_domain>`, with job,
/// network and deployment canonicalized.
pub fn dns_record_name(
    hostname: &str,
    job: &str,
    network: &str,
    deployment: &str,
    root_domain: &str,
) -> Result<String, DnsError> {
    Ok(format!(
        "{hostname}.{}.{}.{}.{root_domain}",
        canonical(job)?,
        canonical(network)?,
        canonical(deployment)?,
    ))
}

/// Pushes an instance's records to both DNS backends.
pub struct DnsPropagator {
    authoritative: Arc<dyn DnsManager>,
    local: Arc<dyn DnsManager>,
    root_domain: String,
}

impl DnsPropagator {
    pub fn new(
        authoritative: Arc<dyn DnsManager>,
        local: Arc<dyn DnsManager>,
        root_domain: impl Into<String>,
    ) -> Self {
        Self {
            authoritative,
            local,
            root_domain: root_domain.into(),
        }
    }

    /// Index and uuid names for every network in the instance's apply-spec.
    pub fn records_for(&self, instance: &InstanceRecord) -> Result<DnsRecordSet, DnsError> {
        let networks = instance
            .spec
            .as_ref()
            .and_then(|spec| spec.get("networks"))
            .and_then(|networks| networks.as_object())
            .ok_or(DnsError::MissingNetworks)?;

        let index = instance.index.to_string();
        let uuid = instance.uuid.to_string();
        let mut records = DnsRecordSet::new();

        for (network_name, network) in networks {
            let raw_ip = network
                .get("ip")
                .and_then(|ip| ip.as_str())
                .ok_or_else(|| DnsError::MissingIp(network_name.clone()))?;
            let ip: IpAddr = raw_ip.parse().map_err(|_| DnsError::InvalidIp {
                network: network_name.clone(),
                ip: raw_ip.to_string(),
            })?;

            for hostname in [&index, &uuid] {
                let name = dns_record_name(
                    hostname,
                    &instance.job,
                    network_name,
                    &instance.deployment.name,
                    &self.root_domain,
                )?;
                records.insert(name, ip);
            }
        }

        Ok(records)
    }

    /// Push the full record set to both backends, then flush caches.
    pub async fn propagate(&self, instance: &InstanceRecord) -> Result<DnsRecordSet, DnsError> {
        let records = self.records_for(instance)?;

        debug!(instance = %instance.name(), records = ?records, "Updating DNS records");

        self.authoritative
            .update_dns_record_for_instance(instance, &records)
            .await
            .map_err(DnsError::Backend)?;
        self.local
            .update_dns_record_for_instance(instance, &records)
            .await
            .map_err(DnsError::Backend)?;

        self.authoritative
            .flush_dns_cache()
            .await
            .map_err(DnsError::Backend)?;
        self.local
            .flush_dns_cache()
            .await
            .map_err(DnsError::Backend)?;

        info!(instance = %instance.name(), count = records.len(), "DNS records updated");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{self, RecordingDnsManager};
    use rstest::rstest;

    #[rstest]
    #[case("worker", "worker")]
    #[case("Web_Server", "web-server")]
    #[case("db.primary!", "dbprimary")]
    fn test_canonical(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(canonical(input).unwrap(), expected);
    }

    #[rstest]
    #[case("1st")]
    #[case("-lead")]
    #[case("trail_")]
    #[case("!!!")]
    fn test_canonical_rejects(#[case] input: &str) {
        assert!(matches!(
            canonical(input),
            Err(DnsError::InvalidCanonicalName { .. })
        ));
    }

    #[test]
    fn test_dns_record_name() {
        assert_eq!(
            dns_record_name("0", "worker", "a", "d1", "bosh").unwrap(),
            "0.worker.a.d1.bosh"
        );
        assert_eq!(
            dns_record_name("u1", "Web_Job", "private_net", "My_Dep", "internal").unwrap(),
            "u1.web-job.private-net.my-dep.internal"
        );
    }

    #[test]
    fn test_records_two_names_per_network() {
        let mut instance = fakes::instance_record();
        instance.spec = Some(serde_json::json!({
            "networks": {
                "a": {"ip": "10.0.0.5"},
                "b": {"ip": "10.1.0.5"},
            }
        }));

        let propagator = DnsPropagator::new(
            Arc::new(RecordingDnsManager::new()),
            Arc::new(RecordingDnsManager::new()),
            "bosh",
        );
        let records = propagator.records_for(&instance).unwrap();
        let uuid = instance.uuid;

        assert_eq!(records.len(), 4);
        assert_eq!(records["0.worker.a.d1.bosh"], "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(
            records[&format!("{uuid}.worker.a.d1.bosh")],
            "10.0.0.5".parse::<IpAddr>().unwrap()
        );
        assert_eq!(records["0.worker.b.d1.bosh"], "10.1.0.5".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_bad_network_pushes_nothing() {
        let mut instance = fakes::instance_record();
        instance.spec = Some(serde_json::json!({
            "networks": {
                "a": {"ip": "10.0.0.5"},
                "b": {"type": "dynamic"},
            }
        }));

        let authoritative = Arc::new(RecordingDnsManager::new());
        let local = Arc::new(RecordingDnsManager::new());
        let propagator = DnsPropagator::new(authoritative.clone(), local.clone(), "bosh");

        assert!(matches!(
            propagator.propagate(&instance).await,
            Err(DnsError::MissingIp(network)) if network == "b"
        ));
        assert!(authoritative.updates().is_empty());
        assert!(local.updates().is_empty());
    }

    #[tokio::test]
    async fn test_propagate_updates_both_and_flushes() {
        let instance = fakes::instance_record();
        let authoritative = Arc::new(RecordingDnsManager::new());
        let local = Arc::new(RecordingDnsManager::new());
        let propagator = DnsPropagator::new(authoritative.clone(), local.clone(), "bosh");

        let records = propagator.propagate(&instance).await.unwrap();

        assert_eq!(authoritative.updates(), vec![records.clone()]);
        assert_eq!(local.updates(), vec![records]);
        assert_eq!(authoritative.flushes(), 1);
    }
}
