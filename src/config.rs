use std::{env, fmt, path::PathBuf, str::FromStr, sync::OnceLock};

use regex::Regex;

use crate::error::EtlError;

pub const DEFAULT_BATCH_SIZE: usize = 100_000;
pub const DEFAULT_CLIENT_TAG: &str = "ocf";
pub const DEFAULT_AWS_REGION: &str = "us-east-1";
/// Largest page the Search Analytics API will return.
pub const MAX_GSC_ROW_LIMIT: usize = 25_000;

/// Everything the job needs, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub site_url: String,
    pub google_credentials: PathBuf,
    pub client_tag: String,
    pub batch_size: usize,
    pub gsc_row_limit: usize,
    pub work_dir: PathBuf,
    pub target_table: String,
    pub staging_table: String,
    pub s3: S3Settings,
    pub snowflake: SnowflakeSettings,
}

#[derive(Clone)]
pub struct S3Settings {
    pub bucket: String,
    /// Prefix of the staged files, without leading or trailing slashes.
    pub folder: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

#[derive(Clone)]
pub struct SnowflakeSettings {
    pub account: String,
    pub user: String,
    pub password: String,
    pub warehouse: Option<String>,
    pub database: Option<String>,
    pub schema: Option<String>,
    pub role: Option<String>,
    pub host: Option<String>,
}

impl fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Settings")
            .field("bucket", &self.bucket)
            .field("folder", &self.folder)
            .field("region", &self.region)
            .field("access_key_id", &"***")
            .field("secret_access_key", &"***")
            .finish()
    }
}

impl fmt::Debug for SnowflakeSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnowflakeSettings")
            .field("account", &self.account)
            .field("user", &self.user)
            .field("password", &"***")
            .field("warehouse", &self.warehouse)
            .field("database", &self.database)
            .field("schema", &self.schema)
            .field("role", &self.role)
            .field("host", &self.host)
            .finish()
    }
}

fn table_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*(\.[A-Za-z_][A-Za-z0-9_$]*){0,2}$").unwrap()
    })
}

struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    /// Unset and blank values are treated the same.
    fn optional(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, name: &'static str) -> Result<String, EtlError> {
        self.optional(name).ok_or(EtlError::MissingVar(name))
    }

    fn parsed<T>(&self, name: &'static str, default: T) -> Result<T, EtlError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.optional(name) {
            None => Ok(default),
            Some(v) => v.parse::<T>().map_err(|e| EtlError::InvalidVar {
                name,
                reason: format!("{v:?}: {e}"),
            }),
        }
    }

    fn table(&self, name: &'static str) -> Result<String, EtlError> {
        let value = self.required(name)?;
        if !table_name_regex().is_match(&value) {
            return Err(EtlError::InvalidVar {
                name,
                reason: format!("{value:?} is not a plain table identifier"),
            });
        }
        Ok(value)
    }
}

impl Config {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, EtlError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    ///
    /// Warehouse credentials are checked first, so a run without them fails
    /// before anything else is looked at.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, EtlError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let snowflake = SnowflakeSettings {
            account: vars.required("SNOWFLAKE_ACCOUNT")?,
            user: vars.required("SNOWFLAKE_USER")?,
            password: vars.required("SNOWFLAKE_PASSWORD")?,
            warehouse: vars.optional("SNOWFLAKE_WAREHOUSE"),
            database: vars.optional("SNOWFLAKE_DATABASE"),
            schema: vars.optional("SNOWFLAKE_SCHEMA"),
            role: vars.optional("SNOWFLAKE_ROLE"),
            host: vars.optional("SNOWFLAKE_HOST"),
        };
        let target_table = vars.table("SNOWFLAKE_TABLE")?;
        let staging_table = vars.table("STAGING_TABLE")?;
        if target_table.eq_ignore_ascii_case(&staging_table) {
            return Err(EtlError::InvalidVar {
                name: "STAGING_TABLE",
                reason: "must differ from SNOWFLAKE_TABLE".to_string(),
            });
        }

        let folder = vars.required("FOLDER")?.trim_matches('/').to_string();
        if folder.is_empty() {
            return Err(EtlError::InvalidVar {
                name: "FOLDER",
                reason: "must name a folder, not the bucket root".to_string(),
            });
        }
        let s3 = S3Settings {
            bucket: vars.required("BUCKET")?,
            folder,
            region: vars
                .optional("AWS_REGION")
                .unwrap_or_else(|| DEFAULT_AWS_REGION.to_string()),
            access_key_id: vars.required("AWS_ACCESS_KEY_ID")?,
            secret_access_key: vars.required("AWS_SECRET_ACCESS_KEY")?,
        };

        let batch_size = vars.parsed("BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        if batch_size == 0 {
            return Err(EtlError::InvalidVar {
                name: "BATCH_SIZE",
                reason: "must be positive".to_string(),
            });
        }
        let gsc_row_limit = vars.parsed("GSC_ROW_LIMIT", MAX_GSC_ROW_LIMIT)?;
        if gsc_row_limit == 0 || gsc_row_limit > MAX_GSC_ROW_LIMIT {
            return Err(EtlError::InvalidVar {
                name: "GSC_ROW_LIMIT",
                reason: format!("must be between 1 and {MAX_GSC_ROW_LIMIT}"),
            });
        }

        Ok(Config {
            site_url: vars.required("SITE_URL")?,
            google_credentials: PathBuf::from(vars.required("GOOGLE_APPLICATION_CREDENTIALS")?),
            client_tag: vars
                .optional("CLIENT_TAG")
                .unwrap_or_else(|| DEFAULT_CLIENT_TAG.to_string()),
            batch_size,
            gsc_row_limit,
            work_dir: vars
                .optional("WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(env::temp_dir),
            target_table,
            staging_table,
            s3,
            snowflake,
        })
    }
}
