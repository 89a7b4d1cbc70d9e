//! Base types and error handling.
//!
//! - [`NetError`](neterror::NetError): transport error taxonomy
//! - [`IoResultExt`](context::IoResultExt): io error conversion with context

pub mod context;
pub mod neterror;
