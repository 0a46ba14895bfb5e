pub mod db;
pub mod diagnostic;
pub mod error;
pub mod init;
pub mod models;
pub mod paths;
pub mod remote;
pub mod schema;
pub mod sync;
