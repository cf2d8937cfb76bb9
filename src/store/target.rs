//! HTTP probe for the jiva controller's replica listing.
//!
//! The controller pod serves a small REST API on its management port; the
//! replica collection at `/v1/replicas` reports each registered replica's
//! data-plane address and mode. Modes map onto sync states, so this
//! listing is the authoritative rebuild signal for status aggregation.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::domain::{ReplicaApiStatus, ReplicaMode, ReplicaProbe};
use crate::error::{Error, Result};
use crate::reconcile::resolver::API_PORT;

// ===== Wire Types =====

#[derive(Debug, Deserialize)]
struct WireReplica {
    address: String,
    mode: String,
}

/// Collection envelope the controller wraps listings in.
#[derive(Debug, Deserialize)]
struct WireReplicaList {
    #[serde(default)]
    data: Vec<WireReplica>,
}

// ===== Probe =====

/// Probe backed by the controller's REST API.
pub struct TargetApiProbe {
    http: reqwest::Client,
}

impl TargetApiProbe {
    /// Build a probe whose requests give up after `timeout`. Controller
    /// pods that are present but wedged must not stall a reconcile pass.
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::TargetApi)?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ReplicaProbe for TargetApiProbe {
    async fn list_replicas(&self, host: &str) -> Result<Vec<ReplicaApiStatus>> {
        let url = format!("http://{host}:{API_PORT}/v1/replicas");
        let response = self.http.get(&url).send().await?.error_for_status()?;
        let body = response.text().await?;
        let replicas = parse_replica_listing(&body)?;
        debug!(host, count = replicas.len(), "fetched replica listing");
        Ok(replicas)
    }
}

/// Decode a replica collection body. Unknown modes are an error rather
/// than a skip: a mode this operator cannot classify means engine version
/// skew, and silently dropping the entry would misreport sync state.
fn parse_replica_listing(body: &str) -> Result<Vec<ReplicaApiStatus>> {
    let listing: WireReplicaList = serde_json::from_str(body)
        .map_err(|err| Error::TargetResponseParse(format!("invalid replica listing: {err}")))?;
    listing
        .data
        .into_iter()
        .map(|entry| {
            let mode = entry
                .mode
                .parse::<ReplicaMode>()
                .map_err(Error::TargetResponseParse)?;
            Ok(ReplicaApiStatus {
                address: entry.address,
                mode,
            })
        })
        .collect()
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parses_replica_listing() {
        let body = r#"{
            "data": [
                {"address": "tcp://10.1.2.3:9502", "mode": "RW"},
                {"address": "tcp://10.1.2.4:9502", "mode": "WO"}
            ]
        }"#;

        let replicas = parse_replica_listing(body).unwrap();
        assert_eq!(replicas.len(), 2);
        assert_eq!(replicas[0].address, "tcp://10.1.2.3:9502");
        assert_eq!(replicas[0].mode, ReplicaMode::RW);
        assert_eq!(replicas[1].mode, ReplicaMode::WO);
    }

    #[test]
    fn test_empty_and_missing_data_are_empty_listings() {
        assert!(parse_replica_listing(r#"{"data": []}"#).unwrap().is_empty());
        assert!(parse_replica_listing(r#"{}"#).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_mode_is_a_parse_error() {
        let body = r#"{"data": [{"address": "tcp://10.1.2.3:9502", "mode": "REBUILD"}]}"#;
        assert_matches!(
            parse_replica_listing(body),
            Err(Error::TargetResponseParse(msg)) if msg.contains("REBUILD")
        );
    }

    #[test]
    fn test_non_json_body_is_a_parse_error() {
        assert_matches!(
            parse_replica_listing("<html>bad gateway</html>"),
            Err(Error::TargetResponseParse(_))
        );
    }
}
