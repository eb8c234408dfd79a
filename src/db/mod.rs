pub mod checkpoint_repository;
pub mod connection;
pub mod deal_repository;
pub mod job_repository;
pub mod migrations;
pub mod models;
