pub mod search_performance_archive;
