//! Hook implementations shipped with the proxy.

pub mod debug;
