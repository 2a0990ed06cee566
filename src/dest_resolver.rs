//! Destination Descriptor Resolver (component A): parses the destination
//! handshake blob into a [`DestDescriptor`] and classifies the migration as
//! intra- or cross-cluster. Pure — no database writes, only a lookup.

use crate::collaborators::Database;
use crate::config::EngineConfig;
use crate::error::MigrateError;
use crate::model::{DestDescriptor, HostRef};
use crate::Result;
use std::collections::HashMap;

const REQUIRED_KEYS: &[&str] = &["master", "xenops", "SM", "host", "session_id"];

/// Parses `dest` (the cluster-facing handshake map) against the local
/// database, classifying the destination host as same-cluster or not, and
/// applying the scheme-forcing policy: `sm_url` is forced to plaintext when
/// the destination resolves to the VM's own source host (no point in
/// encrypting a loopback storage call); `master_url`/`xenops_url` are forced
/// to TLS when bootstrapping cross-cluster and `use_tls_for_dest` is set.
pub async fn resolve(
    db: &dyn Database,
    config: &EngineConfig,
    dest: &HashMap<String, String>,
    source_host: Option<&HostRef>,
) -> Result<DestDescriptor> {
    for key in REQUIRED_KEYS {
        if !dest.contains_key(*key) {
            return Err(MigrateError::OperationNotAllowed(format!(
                "destination descriptor missing required key '{}'",
                key
            )));
        }
    }

    let mut master_url = dest["master"].clone();
    let mut xenops_url = dest["xenops"].clone();
    let mut sm_url = dest["SM"].clone();
    let session_handle = dest["session_id"].clone();
    let host_uuid = &dest["host"];

    let remote_ip = extract_host(&master_url)?;
    let remote_master_ip = remote_ip.clone();
    // The xenops and SM URLs must themselves be well-formed, even though we
    // only need the master's host component for cross-cluster detection.
    extract_host(&xenops_url)?;
    extract_host(&sm_url)?;

    let local_host = db.resolve_host_by_uuid(host_uuid).await?;
    let cross_cluster = local_host.is_none();
    let dest_host_ref = local_host.unwrap_or_else(|| HostRef(host_uuid.clone()));

    if cross_cluster && config.use_tls_for_dest {
        master_url = force_scheme(&master_url, "https");
        xenops_url = force_scheme(&xenops_url, "https");
    }
    if source_host == Some(&dest_host_ref) {
        sm_url = force_scheme(&sm_url, "http");
    }

    Ok(DestDescriptor {
        master_url,
        xenops_url,
        sm_url,
        session_handle,
        dest_host_ref,
        remote_ip,
        remote_master_ip,
        cross_cluster,
    })
}

fn force_scheme(url: &str, scheme: &str) -> String {
    match url.split_once("://") {
        Some((_, rest)) => format!("{}://{}", scheme, rest),
        None => format!("{}://{}", scheme, url),
    }
}

fn extract_host(url: &str) -> Result<String> {
    let without_scheme = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    let host_part = without_scheme
        .split(['/', '?'])
        .next()
        .unwrap_or(without_scheme);
    let host_only = host_part.rsplit_once('@').map(|(_, h)| h).unwrap_or(host_part);
    let host_only = host_only.split(':').next().unwrap_or(host_only);
    if host_only.is_empty() {
        return Err(MigrateError::OperationNotAllowed(format!(
            "malformed destination URL '{}'",
            url
        )));
    }
    Ok(host_only.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::FakeDatabase;

    fn dest_map(host: &str) -> HashMap<String, String> {
        HashMap::from([
            ("master".to_string(), "https://10.0.0.5/".to_string()),
            ("xenops".to_string(), "https://10.0.0.5:8080/xenops".to_string()),
            ("SM".to_string(), "https://10.0.0.5/sm".to_string()),
            ("host".to_string(), host.to_string()),
            ("session_id".to_string(), "tok-123".to_string()),
        ])
    }

    #[tokio::test]
    async fn classifies_cross_cluster_when_host_unresolvable() {
        let db = FakeDatabase::new();
        let config = EngineConfig::default();
        let dest = dest_map("unknown-host-uuid");
        let resolved = resolve(&db, &config, &dest, None).await.unwrap();
        assert!(resolved.cross_cluster);
        assert_eq!(resolved.remote_ip, "10.0.0.5");
    }

    #[tokio::test]
    async fn classifies_intra_cluster_when_host_resolves() {
        use crate::model::HostRef;
        let db = FakeDatabase::new();
        let config = EngineConfig::default();
        db.put_host("host-uuid-1", HostRef("host-ref-1".into()), vec![1, 0], true);
        let dest = dest_map("host-uuid-1");
        let resolved = resolve(&db, &config, &dest, None).await.unwrap();
        assert!(!resolved.cross_cluster);
        assert_eq!(resolved.dest_host_ref, HostRef("host-ref-1".into()));
    }

    #[tokio::test]
    async fn rejects_missing_key() {
        let db = FakeDatabase::new();
        let config = EngineConfig::default();
        let mut dest = dest_map("host-uuid-1");
        dest.remove("session_id");
        assert!(resolve(&db, &config, &dest, None).await.is_err());
    }

    #[tokio::test]
    async fn forces_tls_for_dest_urls_when_cross_cluster_and_configured() {
        let db = FakeDatabase::new();
        let mut config = EngineConfig::default();
        config.use_tls_for_dest = true;
        let dest = HashMap::from([
            ("master".to_string(), "http://10.0.0.5/".to_string()),
            ("xenops".to_string(), "http://10.0.0.5:8080/xenops".to_string()),
            ("SM".to_string(), "http://10.0.0.5/sm".to_string()),
            ("host".to_string(), "unknown-host-uuid".to_string()),
            ("session_id".to_string(), "tok-123".to_string()),
        ]);
        let resolved = resolve(&db, &config, &dest, None).await.unwrap();
        assert!(resolved.master_url.starts_with("https://"));
        assert!(resolved.xenops_url.starts_with("https://"));
    }

    #[tokio::test]
    async fn forces_plaintext_sm_url_when_dest_resolves_to_source_host() {
        use crate::model::HostRef;
        let db = FakeDatabase::new();
        let config = EngineConfig::default();
        db.put_host("host-uuid-1", HostRef("host-ref-1".into()), vec![1, 0], true);
        let dest = dest_map("host-uuid-1");
        let resolved = resolve(&db, &config, &dest, Some(&HostRef("host-ref-1".into())))
            .await
            .unwrap();
        assert!(resolved.sm_url.starts_with("http://"));
        assert!(!resolved.sm_url.starts_with("https://"));
    }
}
