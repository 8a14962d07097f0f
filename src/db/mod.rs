pub mod gsc;
pub mod prod_db;
