//! Admin API

pub mod http;

pub use http::HttpApi;
