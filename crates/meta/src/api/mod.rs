//! HTTP API

mod http;

pub use http::{Envelope, HttpApi};
