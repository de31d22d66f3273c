//! imagesheet - replace image URLs in spreadsheet cells with embedded images.
//!
//! The library exposes the conversion pipeline, the progress bus and the HTTP
//! service so the binary, the web server and integration tests share one
//! implementation.

pub mod cli;
pub mod config;
pub mod fetch;
pub mod models;
pub mod server;
pub mod services;
pub mod workbook;
