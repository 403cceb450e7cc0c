//! Backup broker: database backups over optional SSH tunnels, stored on
//! local or S3-compatible volumes and served back through short-lived links.

pub mod backup;
pub mod config;
pub mod db;
pub mod routes;
