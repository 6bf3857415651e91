pub mod db_backup;
pub mod executor;
pub mod retention;
pub mod scheduler;
pub mod tools;
pub mod tracker;
pub mod transfers;
