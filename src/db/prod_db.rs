use crate::config::Config;

use super::gsc::search_performance_archive::SearchPerformanceArchive;

pub struct ProdDb {}

impl ProdDb {
    pub fn gsc_search_performance(config: &Config) -> SearchPerformanceArchive {
        SearchPerformanceArchive {
            client_tag: config.client_tag.clone(),
            batch_size: config.batch_size,
            row_limit: config.gsc_row_limit,
            work_dir: config.work_dir.clone(),
            target_table: config.target_table.clone(),
            staging_table: config.staging_table.clone(),
            aws_access_key_id: config.s3.access_key_id.clone(),
            aws_secret_access_key: config.s3.secret_access_key.clone(),
        }
    }
}
