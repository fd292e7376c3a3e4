//! HTTP client for the member control API

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{HealthSnapshot, MemberControl, MemberHealth};
use crate::backoff::{retry_with_backoff, RetryConfig};
use crate::Error;

const MEMBERS_PATH: &str = "api/v1/members";
const HEALTH_PATH: &str = "api/v1/health";
const TRANSFER_LEADER_PATH: &str = "api/v1/leader/transfer";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberInfo {
    name: String,
    #[serde(default)]
    member_id: u64,
}

#[derive(Debug, Deserialize)]
struct MembersResponse {
    #[serde(default)]
    members: Vec<MemberInfo>,
    #[serde(default)]
    leader: Option<MemberInfo>,
}

#[derive(Debug, Deserialize)]
struct HealthInfo {
    name: String,
    #[serde(default)]
    health: bool,
}

/// Member control API client over HTTP(S)
///
/// Reads are retried with backoff; a leadership transfer is sent once since
/// the caller re-observes leadership on the next pass anyway.
pub struct HttpMemberControl {
    base_url: String,
    client: reqwest::Client,
    retry: RetryConfig,
}

impl HttpMemberControl {
    /// Create a client for the API at `base_url`
    ///
    /// `ca_bundle` is a PEM bundle trusted in addition to the system roots.
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        ca_bundle: Option<&[u8]>,
        retry: RetryConfig,
    ) -> Result<Self, Error> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(pem) = ca_bundle {
            for cert in reqwest::Certificate::from_pem_bundle(pem)? {
                builder = builder.add_root_certificate(cert);
            }
        }
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: builder.build()?,
            retry,
        })
    }

    /// Base URL this client talks to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let url = format!("{}/{}", self.base_url, path);
        let (client, url) = (&self.client, url.as_str());
        retry_with_backoff(&self.retry, path, move || async move {
            let resp = client.get(url).send().await?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(Error::control_plane(format!(
                    "GET {url} returned {status}: {body}"
                )));
            }
            Ok(resp.json::<T>().await?)
        })
        .await
    }
}

#[async_trait]
impl MemberControl for HttpMemberControl {
    #[instrument(skip(self), fields(url = %self.base_url))]
    async fn health_snapshot(&self) -> Result<HealthSnapshot, Error> {
        let members: MembersResponse = self.get_json(MEMBERS_PATH).await?;
        let health: Vec<HealthInfo> = self.get_json(HEALTH_PATH).await?;

        let health: HashMap<String, bool> = health.into_iter().map(|h| (h.name, h.health)).collect();
        let leader = members.leader.map(|l| l.name);

        let snapshot = HealthSnapshot::from_members(members.members.into_iter().map(|m| {
            MemberHealth {
                health: health.get(&m.name).copied().unwrap_or(false),
                is_leader: leader.as_deref() == Some(m.name.as_str()),
                name: m.name,
                id: m.member_id,
            }
        }));
        debug!(
            members = snapshot.members.len(),
            leader = ?snapshot.leader,
            "fetched member health"
        );
        Ok(snapshot)
    }

    fn refresh(&self) {}

    #[instrument(skip(self), fields(url = %self.base_url))]
    async fn transfer_leadership(&self, target: &str) -> Result<(), Error> {
        let url = format!("{}/{}/{}", self.base_url, TRANSFER_LEADER_PATH, target);
        let resp = self.client.post(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::control_plane(format!(
                "leader transfer to {target} returned {status}: {body}"
            )));
        }
        Ok(())
    }
}
