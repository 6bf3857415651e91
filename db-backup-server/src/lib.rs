//! Scheduled xtrabackup full and incremental backups, tracked in SQLite,
//! pruned by a retention count and mirrored to remote storage with rclone.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
pub mod utils;

#[cfg(test)]
mod testing;
