// Daily search query performance from Google Search Console, staged in S3
// and merged into a Snowflake table.
//
// The staging table is loaded by position, its columns have to be in the
// order of `Row`:
//   query, clicks, impressions, ctr, position, start_dt, end_dt, client, timestamp

use std::path::PathBuf;

use itertools::Itertools;
use jiff::civil::Date;
use log::{info, warn};
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::utils::{
    lib_gsc::{ApiRow, QueryRequest, SearchSource},
    lib_s3::Stage,
    lib_snowflake::{quote_literal, Warehouse},
};
use crate::error::EtlError;

/// Columns written by the merge, in insert order.
const MERGE_COLUMNS: [&str; 8] = [
    "query",
    "clicks",
    "impressions",
    "ctr",
    "position",
    "start_dt",
    "end_dt",
    "client",
];
const MERGE_KEY: [&str; 3] = ["query", "start_dt", "end_dt"];
const MERGE_UPDATES: [&str; 5] = ["clicks", "impressions", "ctr", "position", "client"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    pub query: String,
    pub clicks: u64,
    pub impressions: u64,
    pub ctr: f64,
    pub position: f64,
    pub start_dt: Date,
    pub end_dt: Date,
    pub client: String,
    /// Always empty, the column is kept for the table layout.
    pub timestamp: Option<String>,
}

pub struct SearchPerformanceArchive {
    pub client_tag: String,
    pub batch_size: usize,
    pub row_limit: usize,
    pub work_dir: PathBuf,
    pub target_table: String,
    pub staging_table: String,
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub rows_loaded: u64,
    pub errors_seen: u64,
    pub rows_inserted: u64,
    pub rows_updated: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub start: Date,
    pub end: Date,
    pub rows_fetched: usize,
    pub staged_keys: Vec<String>,
    /// `None` when there was nothing to load.
    pub load: Option<LoadReport>,
    pub objects_deleted: usize,
}

/// Number of batch files for `n` rows.  A row count that is an exact
/// multiple of the batch size doesn't get an extra empty file.
pub fn batch_count(n: usize, batch_size: usize) -> usize {
    n.div_ceil(batch_size)
}

pub fn batch_filename(i: usize) -> String {
    format!("batch_{}.csv", i)
}

impl SearchPerformanceArchive {
    fn to_row(&self, api_row: ApiRow, start: Date, end: Date) -> Row {
        Row {
            query: api_row.keys.into_iter().next().unwrap_or_default(),
            clicks: api_row.clicks,
            impressions: api_row.impressions,
            ctr: api_row.ctr,
            position: api_row.position,
            start_dt: start,
            end_dt: end,
            client: self.client_tag.clone(),
            timestamp: None,
        }
    }

    /// Get the per query metrics for the date range, both ends inclusive.
    /// Pages through the results until a short page comes back.
    pub async fn fetch_rows(
        &self,
        source: &dyn SearchSource,
        start: Date,
        end: Date,
    ) -> Result<Vec<Row>, EtlError> {
        let mut rows: Vec<Row> = Vec::new();
        let mut start_row = 0;
        loop {
            let request = QueryRequest {
                start_date: start,
                end_date: end,
                dimensions: vec!["query".to_string()],
                row_limit: self.row_limit,
                start_row,
            };
            let page = source.query(&request).await?;
            let n = page.rows.len();
            info!("fetched {} rows starting at row {}", n, start_row);
            rows.extend(page.rows.into_iter().map(|r| self.to_row(r, start, end)));
            if n < self.row_limit {
                break;
            }
            start_row += n;
        }
        if rows.is_empty() {
            info!("No data found.");
        }
        Ok(rows)
    }

    /// Write one batch to a CSV file in the work directory.  The file is
    /// removed when the returned handle is dropped.
    pub fn write_batch(&self, rows: &[Row]) -> Result<NamedTempFile, EtlError> {
        let mut file = tempfile::Builder::new()
            .prefix("batch_")
            .suffix(".csv")
            .tempfile_in(&self.work_dir)?;
        {
            let mut wtr = csv::Writer::from_writer(file.as_file_mut());
            for row in rows {
                wtr.serialize(row)?;
            }
            wtr.flush()?;
        }
        Ok(file)
    }

    /// Upload the rows in batches of at most `batch_size` rows, as
    /// `batch_1.csv`, `batch_2.csv`, ...  Each local file is gone by the time
    /// the next batch is written, whether its upload worked or not.
    pub async fn stage_rows(
        &self,
        stage: &dyn Stage,
        rows: &[Row],
    ) -> Result<Vec<String>, EtlError> {
        let mut keys: Vec<String> = Vec::with_capacity(batch_count(rows.len(), self.batch_size));
        for (i, batch) in rows.chunks(self.batch_size).enumerate() {
            let name = batch_filename(i + 1);
            let file = self.write_batch(batch)?;
            let key = stage.upload(file.path(), &name).await?;
            file.close()?;
            info!("Uploaded {} to S3.", name);
            keys.push(key);
        }
        Ok(keys)
    }

    pub fn copy_sql(&self, location: &str) -> String {
        format!(
            r#"COPY INTO {}
FROM {}
CREDENTIALS = (AWS_KEY_ID = {} AWS_SECRET_KEY = {})
FILE_FORMAT = (TYPE = 'CSV' FIELD_OPTIONALLY_ENCLOSED_BY = '"' SKIP_HEADER = 1)
ON_ERROR = 'CONTINUE';"#,
            self.staging_table,
            quote_literal(location),
            quote_literal(&self.aws_access_key_id),
            quote_literal(&self.aws_secret_access_key),
        )
    }

    /// Upsert the staging rows.  Rows are identified by the query and the
    /// period; a matched row takes the metrics and client tag of the new one.
    pub fn merge_sql(&self) -> String {
        format!(
            r#"MERGE INTO {} AS tgt
USING {} AS src
ON {}
WHEN MATCHED THEN
    UPDATE SET {}
WHEN NOT MATCHED THEN
    INSERT ({})
    VALUES ({});"#,
            self.target_table,
            self.staging_table,
            MERGE_KEY
                .iter()
                .map(|c| format!("tgt.{c} = src.{c}"))
                .join("\n    AND "),
            MERGE_UPDATES
                .iter()
                .map(|c| format!("{c} = src.{c}"))
                .join(",\n        "),
            MERGE_COLUMNS.iter().join(", "),
            MERGE_COLUMNS.iter().map(|c| format!("src.{c}")).join(", "),
        )
    }

    pub fn truncate_sql(&self) -> String {
        format!("TRUNCATE TABLE {};", self.staging_table)
    }

    /// Load everything currently staged: copy into the staging table, merge
    /// into the target table, empty the staging table.
    pub async fn update_warehouse(
        &self,
        warehouse: &mut dyn Warehouse,
        stage: &dyn Stage,
    ) -> Result<LoadReport, EtlError> {
        let copied = warehouse.execute(&self.copy_sql(&stage.location())).await?;
        info!("Data copied into staging table.");
        let merged = warehouse.execute(&self.merge_sql()).await?;
        warehouse.execute(&self.truncate_sql()).await?;
        info!("Data merged into target table.");

        let report = LoadReport {
            rows_loaded: copied.sum("rows_loaded"),
            errors_seen: copied.sum("errors_seen"),
            rows_inserted: merged.sum("number of rows inserted"),
            rows_updated: merged.sum("number of rows updated"),
        };
        info!("{:?}", report);
        Ok(report)
    }

    /// Delete every object under the stage prefix.  Returns how many were
    /// deleted.
    pub async fn clear_stage(&self, stage: &dyn Stage) -> Result<usize, EtlError> {
        let keys = stage.list().await?;
        if keys.is_empty() {
            info!("No objects found to delete.");
        }
        for key in &keys {
            stage.delete(key).await?;
        }
        Ok(keys.len())
    }

    /// Fetch, stage, load and clean up one date range.  An empty result from
    /// the source is a successful run that does nothing else.  On error the
    /// staged files are left in place.
    pub async fn update(
        &self,
        source: &dyn SearchSource,
        stage: &dyn Stage,
        warehouse: &mut dyn Warehouse,
        start: Date,
        end: Date,
    ) -> Result<RunSummary, EtlError> {
        let rows = self.fetch_rows(source, start, end).await?;
        let mut summary = RunSummary {
            start,
            end,
            rows_fetched: rows.len(),
            staged_keys: Vec::new(),
            load: None,
            objects_deleted: 0,
        };
        if rows.is_empty() {
            return Ok(summary);
        }

        summary.staged_keys = self.stage_rows(stage, &rows).await?;
        summary.load = Some(self.update_warehouse(warehouse, stage).await?);
        summary.objects_deleted = self.clear_stage(stage).await?;
        Ok(summary)
    }

    /// Same as [`Self::update`], and the warehouse session is closed
    /// afterwards whatever the outcome.
    pub async fn run(
        &self,
        source: &dyn SearchSource,
        stage: &dyn Stage,
        warehouse: &mut dyn Warehouse,
        start: Date,
        end: Date,
    ) -> Result<RunSummary, EtlError> {
        let outcome = self.update(source, stage, warehouse, start, end).await;
        let closed = warehouse.close().await;
        match (outcome, closed) {
            (Ok(summary), closed) => {
                closed?;
                Ok(summary)
            }
            (Err(e), Err(close_err)) => {
                warn!("Failed to close the warehouse session: {}", close_err);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }
}
