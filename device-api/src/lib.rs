//! HTTP facade over a cloud device registry and its device messaging channel.

pub mod backend;
pub mod config;
pub mod connection_string;
pub mod errors;
pub mod facade;
pub mod metrics;
pub mod model;
pub mod rest;
pub mod validate;

pub use errors::{Error, ErrorKind, Result};
pub use facade::{DeletePolicy, DeviceFacade, FacadeOptions};
