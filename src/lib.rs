pub mod audit;
pub mod auth;
pub mod authz;
pub mod backoffice;
pub mod config;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod limits;
pub mod model;
pub mod observability;
pub mod permission;
pub mod reaper;
pub mod role;
pub mod sql;
pub mod wal;
pub mod wire;
