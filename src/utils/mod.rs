pub mod lib_gauth;
pub mod lib_gsc;
pub mod lib_s3;
pub mod lib_snowflake;
