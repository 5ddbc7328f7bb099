//! Public HTTP API

pub mod http;

pub use http::{create_router, ApiState};
