// Google Search Console, Search Analytics query endpoint.
// https://developers.google.com/webmaster-tools/v1/searchanalytics/query

use std::time::Duration;

use async_trait::async_trait;
use jiff::civil::Date;
use reqwest::{Client, Url};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::EtlError;

const API_ROOT: &str = "https://searchconsole.googleapis.com/webmasters/v3/sites/";

/// Request body of a Search Analytics query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub start_date: Date,
    pub end_date: Date,
    pub dimensions: Vec<String>,
    pub row_limit: usize,
    pub start_row: usize,
}

/// The API leaves out `rows` entirely when there is no data, and any metric
/// that doesn't apply.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub rows: Vec<ApiRow>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiRow {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default, deserialize_with = "whole_number")]
    pub clicks: u64,
    #[serde(default, deserialize_with = "whole_number")]
    pub impressions: u64,
    #[serde(default)]
    pub ctr: f64,
    #[serde(default)]
    pub position: f64,
}

/// Counts are typed as doubles by the API, e.g. `3` or `3.0`.
fn whole_number<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let v = f64::deserialize(deserializer)?;
    Ok(v.max(0.0).round() as u64)
}

/// Anything that can answer one page of a Search Analytics query.
#[async_trait]
pub trait SearchSource: Send + Sync {
    async fn query(&self, request: &QueryRequest) -> Result<QueryResponse, EtlError>;
}

pub struct GscClient {
    client: Client,
    endpoint: Url,
    access_token: String,
}

impl GscClient {
    pub fn new(site_url: &str, access_token: String) -> Result<Self, EtlError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(GscClient {
            client,
            endpoint: query_url(site_url)?,
            access_token,
        })
    }
}

/// The site url is a single path segment, so any `/` in it gets
/// percent-encoded.
pub fn query_url(site_url: &str) -> Result<Url, EtlError> {
    let mut url = Url::parse(API_ROOT).map_err(|e| EtlError::InvalidVar {
        name: "SITE_URL",
        reason: e.to_string(),
    })?;
    url.path_segments_mut()
        .map_err(|_| EtlError::InvalidVar {
            name: "SITE_URL",
            reason: "cannot build query url".to_string(),
        })?
        .pop_if_empty()
        .push(site_url)
        .push("searchAnalytics")
        .push("query");
    Ok(url)
}

#[async_trait]
impl SearchSource for GscClient {
    async fn query(&self, request: &QueryRequest) -> Result<QueryResponse, EtlError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.access_token)
            .json(request)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(EtlError::Api {
                service: "search console",
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use std::{error::Error, path::Path};

    use jiff::civil::date;

    use super::*;

    #[test]
    fn site_url_is_one_segment() -> Result<(), Box<dyn Error>> {
        let url = query_url("https://www.example.com/")?;
        assert_eq!(
            url.as_str(),
            "https://searchconsole.googleapis.com/webmasters/v3/sites/https:%2F%2Fwww.example.com%2F/searchAnalytics/query"
        );
        let url = query_url("sc-domain:example.com")?;
        assert!(url.path().ends_with("/sites/sc-domain:example.com/searchAnalytics/query"));
        Ok(())
    }

    #[test]
    fn request_body() -> Result<(), Box<dyn Error>> {
        let request = QueryRequest {
            start_date: date(2025, 3, 1),
            end_date: date(2025, 3, 1),
            dimensions: vec!["query".to_string()],
            row_limit: 25000,
            start_row: 0,
        };
        let json = serde_json::to_value(&request)?;
        assert_eq!(
            json,
            serde_json::json!({
                "startDate": "2025-03-01",
                "endDate": "2025-03-01",
                "dimensions": ["query"],
                "rowLimit": 25000,
                "startRow": 0,
            })
        );
        Ok(())
    }

    #[test]
    fn parse_response() -> Result<(), Box<dyn Error>> {
        let body = r#"{
            "rows": [
                {"keys": ["rust csv"], "clicks": 3, "impressions": 40, "ctr": 0.075, "position": 4.2},
                {"keys": ["duckdb merge"], "impressions": 12, "position": 9.5},
                {"keys": ["jiff dates"], "clicks": 2.0, "impressions": 31.0, "ctr": 0.0645, "position": 1.0}
            ],
            "responseAggregationType": "byProperty"
        }"#;
        let res: QueryResponse = serde_json::from_str(body)?;
        assert_eq!(res.rows.len(), 3);
        assert_eq!(res.rows[0].clicks, 3);
        assert_eq!(res.rows[1].clicks, 0);
        assert_eq!(res.rows[1].impressions, 12);
        assert_eq!((res.rows[2].clicks, res.rows[2].impressions), (2, 31));
        assert_eq!(res.rows[1].ctr, 0.0);
        assert_eq!(res.rows[1].keys, vec!["duckdb merge"]);

        let empty: QueryResponse = serde_json::from_str(r#"{"responseAggregationType": "auto"}"#)?;
        assert!(empty.rows.is_empty());
        Ok(())
    }

    #[ignore]
    #[tokio::test]
    async fn live_query() -> Result<(), Box<dyn Error>> {
        dotenvy::from_path(Path::new(".env/test.env"))?;
        let config = crate::config::Config::from_env()?;
        let token = crate::utils::lib_gauth::access_token(
            &config.google_credentials,
            &[crate::utils::lib_gauth::WEBMASTERS_READONLY],
        )
        .await?;
        let client = GscClient::new(&config.site_url, token)?;
        let res = client
            .query(&QueryRequest {
                start_date: date(2025, 1, 1),
                end_date: date(2025, 1, 1),
                dimensions: vec!["query".to_string()],
                row_limit: 10,
                start_row: 0,
            })
            .await?;
        println!("{:?}", res);
        Ok(())
    }
}
