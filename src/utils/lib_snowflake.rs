// Minimal Snowflake session over the REST endpoints the official drivers
// use: password login, synchronous statements, session delete.

use std::time::Duration;

use async_trait::async_trait;
use jiff::Timestamp;
use log::{debug, info};
use reqwest::{
    header::{ACCEPT, AUTHORIZATION},
    Client, RequestBuilder,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{config::SnowflakeSettings, error::EtlError};

// Snowflake only accepts known driver ids here, report as the Go driver.
const CLIENT_APP_ID: &str = "Go";
const CLIENT_APP_VERSION: &str = "1.6.22";

/// Codes Snowflake returns while a statement is still running.
const QUERY_IN_PROGRESS: [&str; 2] = ["333333", "333334"];

/// A SQL session that runs one statement at a time.
#[async_trait]
pub trait Warehouse: Send {
    async fn execute(&mut self, sql: &str) -> Result<QueryResult, EtlError>;

    /// Release the session.  Calling it more than once is fine.
    async fn close(&mut self) -> Result<(), EtlError>;
}

/// Result set of a statement, all values as text the way Snowflake sends them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl QueryResult {
    /// Sum of a numeric column over all rows.  Column names are matched
    /// ignoring case; a missing column or unparsable value counts as zero.
    pub fn sum(&self, column: &str) -> u64 {
        let Some(ix) = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
        else {
            return 0;
        };
        self.rows
            .iter()
            .filter_map(|row| row.get(ix).cloned().flatten())
            .filter_map(|v| v.parse::<u64>().ok())
            .sum()
    }
}

/// Quote a value as a SQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Value,
    code: Option<String>,
    message: Option<String>,
    #[serde(default)]
    success: bool,
}

impl Envelope {
    fn into_error(self) -> EtlError {
        EtlError::Warehouse {
            code: self.code.unwrap_or_else(|| "unknown".to_string()),
            message: self
                .message
                .unwrap_or_else(|| "request was not successful".to_string()),
        }
    }

    fn in_progress(&self) -> bool {
        matches!(&self.code, Some(code) if QUERY_IN_PROGRESS.contains(&code.as_str()))
    }
}

#[derive(Debug, Deserialize)]
struct LoginData {
    token: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryData {
    #[serde(default, rename = "rowtype")]
    row_type: Vec<ColumnType>,
    #[serde(default, rename = "rowset")]
    row_set: Vec<Vec<Value>>,
    get_result_url: Option<String>,
    query_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ColumnType {
    name: String,
}

impl QueryData {
    /// DDL and some DML come back without any data at all.
    fn from_value(value: Value) -> Result<Self, EtlError> {
        if value.is_null() {
            return Ok(QueryData::default());
        }
        Ok(serde_json::from_value(value)?)
    }
}

impl From<QueryData> for QueryResult {
    fn from(data: QueryData) -> Self {
        QueryResult {
            columns: data.row_type.into_iter().map(|c| c.name).collect(),
            rows: data
                .row_set
                .into_iter()
                .map(|row| {
                    row.into_iter()
                        .map(|v| match v {
                            Value::Null => None,
                            Value::String(s) => Some(s),
                            other => Some(other.to_string()),
                        })
                        .collect()
                })
                .collect(),
        }
    }
}

pub struct SnowflakeSession {
    client: Client,
    base_url: String,
    token: Option<String>,
    sequence_id: u64,
}

/// `xy12345.us-east-1` logs in as account `xy12345` on host
/// `xy12345.us-east-1.snowflakecomputing.com`.
pub fn base_url(settings: &SnowflakeSettings) -> String {
    match &settings.host {
        Some(host) if host.starts_with("http://") || host.starts_with("https://") => {
            host.trim_end_matches('/').to_string()
        }
        Some(host) => format!("https://{}", host.trim_end_matches('/')),
        None => format!("https://{}.snowflakecomputing.com", settings.account),
    }
}

fn login_body(settings: &SnowflakeSettings) -> Value {
    let account_name = settings
        .account
        .split('.')
        .next()
        .unwrap_or(&settings.account);
    json!({
        "data": {
            "CLIENT_APP_ID": CLIENT_APP_ID,
            "CLIENT_APP_VERSION": CLIENT_APP_VERSION,
            "ACCOUNT_NAME": account_name,
            "LOGIN_NAME": settings.user,
            "PASSWORD": settings.password,
        }
    })
}

fn login_params(settings: &SnowflakeSettings) -> Vec<(&'static str, String)> {
    let mut params = vec![("request_id", Uuid::new_v4().to_string())];
    for (name, value) in [
        ("warehouse", &settings.warehouse),
        ("databaseName", &settings.database),
        ("schemaName", &settings.schema),
        ("roleName", &settings.role),
    ] {
        if let Some(value) = value {
            params.push((name, value.clone()));
        }
    }
    params
}

async fn send(builder: RequestBuilder) -> Result<Envelope, EtlError> {
    let response = builder.header(ACCEPT, "application/json").send().await?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(EtlError::Api {
            service: "snowflake",
            status: status.as_u16(),
            body,
        });
    }
    Ok(serde_json::from_str(&body)?)
}

impl SnowflakeSession {
    /// Log in with user and password.  The session stays open until
    /// [`Warehouse::close`] is called.
    pub async fn connect(settings: &SnowflakeSettings) -> Result<Self, EtlError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        let base_url = base_url(settings);

        let envelope = send(
            client
                .post(format!("{}/session/v1/login-request", base_url))
                .query(&login_params(settings))
                .json(&login_body(settings)),
        )
        .await?;
        if !envelope.success {
            return Err(envelope.into_error());
        }
        let login: LoginData = serde_json::from_value(envelope.data)?;
        info!("Connected to Snowflake.");

        Ok(SnowflakeSession {
            client,
            base_url,
            token: Some(login.token),
            sequence_id: 0,
        })
    }

    fn token(&self) -> Result<String, EtlError> {
        match &self.token {
            Some(token) => Ok(format!("Snowflake Token=\"{}\"", token)),
            None => Err(EtlError::Warehouse {
                code: "closed".to_string(),
                message: "session is already closed".to_string(),
            }),
        }
    }
}

#[async_trait]
impl Warehouse for SnowflakeSession {
    async fn execute(&mut self, sql: &str) -> Result<QueryResult, EtlError> {
        let auth = self.token()?;
        self.sequence_id += 1;
        let body = json!({
            "sqlText": sql,
            "asyncExec": false,
            "sequenceId": self.sequence_id,
            "querySubmissionTime": Timestamp::now().as_millisecond(),
        });
        let mut envelope = send(
            self.client
                .post(format!("{}/queries/v1/query-request", self.base_url))
                .query(&[("requestId", Uuid::new_v4().to_string())])
                .header(AUTHORIZATION, &auth)
                .json(&body),
        )
        .await?;

        // long statements come back as "still running" with a url to poll
        while envelope.in_progress() {
            let data = QueryData::from_value(envelope.data)?;
            let Some(url) = data.get_result_url else {
                return Err(EtlError::Warehouse {
                    code: "no_result_url".to_string(),
                    message: "statement still running but no result url given".to_string(),
                });
            };
            debug!("query {:?} still running", data.query_id);
            tokio::time::sleep(Duration::from_millis(500)).await;
            envelope = send(
                self.client
                    .get(format!("{}{}", self.base_url, url))
                    .header(AUTHORIZATION, &auth),
            )
            .await?;
        }

        if !envelope.success {
            return Err(envelope.into_error());
        }
        Ok(QueryData::from_value(envelope.data)?.into())
    }

    async fn close(&mut self) -> Result<(), EtlError> {
        let Ok(auth) = self.token() else {
            return Ok(());
        };
        self.token = None;
        let envelope = send(
            self.client
                .post(format!("{}/session", self.base_url))
                .query(&[("delete", "true")])
                .header(AUTHORIZATION, auth),
        )
        .await?;
        if !envelope.success {
            return Err(envelope.into_error());
        }
        info!("Snowflake session closed.");
        Ok(())
    }
}
