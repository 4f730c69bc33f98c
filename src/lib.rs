pub mod api;
pub mod auth;
pub mod blobstore;
pub mod db;
pub mod errors;
pub mod models;
pub mod output;
pub mod server;
