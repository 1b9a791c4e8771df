//! nodetrust node agent: configuration and local key material

#![deny(missing_docs)]

pub mod config;
pub mod pki;
