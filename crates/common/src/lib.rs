pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod redis_pool;
pub mod types;
