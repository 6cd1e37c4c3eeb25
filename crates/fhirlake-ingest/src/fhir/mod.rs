//! FHIR search backed count oracle
//!
//! Counts use `_summary=count` searches bounded by two `_lastUpdated`
//! parameters; first and last timestamps come from single-entry searches
//! sorted by `_lastUpdated` ascending or descending.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fhirlake_common::time::{format_instant, parse_instant};
use serde::Deserialize;
use tracing::debug;

use crate::config::FhirServerConfig;
use crate::error::{IngestError, Result};
use crate::framework::oracle::ResourceCountOracle;

#[derive(Debug, Deserialize)]
struct Bundle {
    total: Option<i64>,
    #[serde(default)]
    entry: Vec<BundleEntry>,
}

#[derive(Debug, Deserialize)]
struct BundleEntry {
    resource: Option<Resource>,
}

#[derive(Debug, Deserialize)]
struct Resource {
    meta: Option<Meta>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Meta {
    last_updated: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Group {
    #[serde(default)]
    member: Vec<GroupMember>,
}

#[derive(Debug, Deserialize)]
struct GroupMember {
    entity: Reference,
}

#[derive(Debug, Deserialize)]
struct Reference {
    reference: Option<String>,
}

#[derive(Clone)]
pub struct FhirSearchOracle {
    client: reqwest::Client,
    base_url: String,
}

impl FhirSearchOracle {
    pub fn new(config: &FhirServerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .user_agent(concat!("fhirlake-ingest/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn range_params(start: Option<DateTime<Utc>>, end: DateTime<Utc>) -> Vec<(&'static str, String)> {
        let mut params = vec![("_lastUpdated", format!("lt{}", format_instant(&end)))];
        if let Some(start) = start {
            params.push(("_lastUpdated", format!("ge{}", format_instant(&start))));
        }
        params
    }

    async fn search(&self, resource_type: &str, params: &[(&str, String)]) -> Result<Bundle> {
        let url = format!("{}/{}", self.base_url, resource_type);
        debug!(url = %url, ?params, "FHIR search");
        let bundle = self
            .client
            .get(&url)
            .header("Accept", "application/fhir+json")
            .query(params)
            .send()
            .await?
            .error_for_status()?
            .json::<Bundle>()
            .await?;
        Ok(bundle)
    }

    async fn edge_timestamp(
        &self,
        resource_type: &str,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
        sort: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let mut params = Self::range_params(start, end);
        params.push(("_count", "1".to_string()));
        params.push(("_sort", sort.to_string()));

        let bundle = self.search(resource_type, &params).await?;
        let last_updated = bundle
            .entry
            .into_iter()
            .next()
            .and_then(|entry| entry.resource)
            .and_then(|resource| resource.meta)
            .and_then(|meta| meta.last_updated);

        match last_updated {
            Some(raw) => Ok(Some(parse_instant(&raw)?)),
            None => Ok(None),
        }
    }

    /// Patient ids referenced by a `Group` resource
    pub async fn group_patient_ids(&self, group_id: &str) -> Result<Vec<String>> {
        let url = format!("{}/Group/{}", self.base_url, group_id);
        let group = self
            .client
            .get(&url)
            .header("Accept", "application/fhir+json")
            .send()
            .await?
            .error_for_status()?
            .json::<Group>()
            .await?;

        Ok(group
            .member
            .into_iter()
            .filter_map(|member| member.entity.reference)
            .filter_map(|reference| reference.strip_prefix("Patient/").map(str::to_string))
            .collect())
    }
}

#[async_trait]
impl ResourceCountOracle for FhirSearchOracle {
    async fn count(
        &self,
        resource_type: &str,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> Result<i64> {
        let mut params = Self::range_params(start, end);
        params.push(("_summary", "count".to_string()));

        let bundle = self.search(resource_type, &params).await?;
        bundle.total.ok_or_else(|| {
            IngestError::Oracle(format!("count search for {} returned no total", resource_type))
        })
    }

    async fn first_timestamp(
        &self,
        resource_type: &str,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        self.edge_timestamp(resource_type, start, end, "_lastUpdated")
            .await
    }

    async fn last_timestamp(
        &self,
        resource_type: &str,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        self.edge_timestamp(resource_type, start, end, "-_lastUpdated")
            .await
    }
}
