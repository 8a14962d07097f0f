use std::{error::Error, path::Path};

use clap::Parser;
use gsc_etl::{
    config::Config,
    db::prod_db::ProdDb,
    error::EtlError,
    utils::{
        lib_s3::{S3Stage, Stage},
        lib_snowflake::{SnowflakeSession, Warehouse},
    },
};
use log::{error, info};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Environment name, e.g., test, prod
    #[arg(short, long, default_value = "prod")]
    env: String,
}

/// Load the files a failed run left in the stage folder, then clear the folder.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let env_file = format!(".env/{}.env", args.env);
    if Path::new(&env_file).exists() {
        dotenvy::from_path(Path::new(&env_file))?;
    }
    let config = Config::from_env()?;

    let stage = S3Stage::new(&config.s3)?;
    let staged = stage.list().await?;
    if staged.is_empty() {
        info!("Nothing staged under {}", stage.location());
        return Ok(());
    }
    info!("{} files staged under {}", staged.len(), stage.location());

    let archive = ProdDb::gsc_search_performance(&config);
    let mut warehouse = SnowflakeSession::connect(&config.snowflake).await?;
    let outcome = async {
        let report = archive.update_warehouse(&mut warehouse, &stage).await?;
        let deleted = archive.clear_stage(&stage).await?;
        Ok::<_, EtlError>((report, deleted))
    }
    .await;
    let closed = warehouse.close().await;

    match outcome {
        Ok((report, deleted)) => {
            info!("{:?}, {} objects deleted", report, deleted);
            closed?;
            Ok(())
        }
        Err(e) => {
            error!("Reload failed: {}", e);
            Err(e.into())
        }
    }
}
