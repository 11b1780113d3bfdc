pub mod audit;
pub mod config;
pub mod content_type;
pub mod data_dir;
pub mod db;
pub mod export;
pub mod import;
pub mod retry;
pub mod routes;
pub mod storage;
pub mod weeks;
