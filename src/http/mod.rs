//! HTTP/1.x client engine: C3 (`transaction`) and C4 (`auth`), plus supporting
//! codecs (`chunked`) and the request/callback surface (`request`).

pub mod auth;
pub mod chunked;
mod des;
mod md4;
pub mod request;
pub mod transaction;

pub use request::{HttpVersion, Method, Request, RequestHandler};
