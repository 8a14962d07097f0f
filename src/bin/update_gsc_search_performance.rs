use std::{error::Error, path::Path};

use clap::Parser;
use gsc_etl::{
    config::Config,
    db::{gsc::search_performance_archive::RunSummary, prod_db::ProdDb},
    utils::{
        lib_gauth::{self, WEBMASTERS_READONLY},
        lib_gsc::GscClient,
        lib_s3::S3Stage,
        lib_snowflake::SnowflakeSession,
    },
};
use jiff::{civil::Date, Zoned};
use log::{error, info};
use tabled::{builder::Builder, settings::Style};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Environment name, e.g., test, prod
    #[arg(short, long, default_value = "prod")]
    env: String,

    /// First day to load, e.g. 2025-03-01.  Defaults to yesterday.
    #[arg(long)]
    start: Option<Date>,

    /// Last day to load, inclusive.  Defaults to the first day.
    #[arg(long)]
    end: Option<Date>,
}

fn date_range(args: &Args) -> Result<(Date, Date), Box<dyn Error>> {
    let start = match args.start {
        Some(day) => day,
        None => Zoned::now().date().yesterday()?,
    };
    let end = args.end.unwrap_or(start);
    if end < start {
        return Err(format!("end date {} is before start date {}", end, start).into());
    }
    Ok((start, end))
}

/// Make an ASCII table from the run summary
fn summary_table(summary: &RunSummary) -> tabled::Table {
    let load = summary.load.clone().unwrap_or_default();
    let mut builder = Builder::new();
    builder.push_record(vec![
        "Start",
        "End",
        "Rows fetched",
        "Files staged",
        "Rows loaded",
        "Load errors",
        "Inserted",
        "Updated",
        "Objects deleted",
    ]);
    builder.push_record(vec![
        summary.start.to_string(),
        summary.end.to_string(),
        summary.rows_fetched.to_string(),
        summary.staged_keys.len().to_string(),
        load.rows_loaded.to_string(),
        load.errors_seen.to_string(),
        load.rows_inserted.to_string(),
        load.rows_updated.to_string(),
        summary.objects_deleted.to_string(),
    ]);
    let mut table = builder.build();
    table.with(Style::sharp());
    table
}

/// Connect to all three services and load one date range.  The warehouse
/// session is closed before this returns.
async fn load(args: &Args) -> Result<RunSummary, Box<dyn Error>> {
    let env_file = format!(".env/{}.env", args.env);
    if Path::new(&env_file).exists() {
        dotenvy::from_path(Path::new(&env_file))?;
    } else {
        info!("{} not found, using the process environment", env_file);
    }
    let config = Config::from_env()?;
    let (start, end) = date_range(args)?;
    info!("Loading search performance for {} to {}", start, end);

    let token = lib_gauth::access_token(&config.google_credentials, &[WEBMASTERS_READONLY]).await?;
    let source = GscClient::new(&config.site_url, token)?;
    let stage = S3Stage::new(&config.s3)?;
    let mut warehouse = SnowflakeSession::connect(&config.snowflake).await?;
    let archive = ProdDb::gsc_search_performance(&config);

    let summary = archive.run(&source, &stage, &mut warehouse, start, end).await?;
    Ok(summary)
}

/// Run this job every day, after Search Console has published yesterday's data.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    match load(&args).await {
        Ok(summary) => {
            if summary.load.is_none() {
                info!("ETL process completed with no data to process.");
            } else {
                println!("{}", summary_table(&summary));
                info!("ETL process completed successfully.");
            }
            Ok(())
        }
        Err(e) => {
            error!("ETL process failed: {}", e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_before_start_is_rejected() {
        let args = Args::parse_from([
            "update_gsc_search_performance",
            "--start",
            "2025-03-02",
            "--end",
            "2025-03-01",
        ]);
        assert!(date_range(&args).is_err());
    }

    #[tokio::test]
    async fn setup_errors_come_back_from_load() {
        let args = Args::parse_from([
            "update_gsc_search_performance",
            "--start",
            "2025-03-02",
            "--end",
            "2025-03-01",
        ]);
        // missing config or a bad range, either way before any connection
        assert!(load(&args).await.is_err());
    }
}
