//! Administrative API

mod http;

pub use http::{ApiResponse, HttpApi};
