//! Library crate for courtside-link, exposing the sync node, its storage seams and the
//! local HTTP bridge to the binary, the OpenAPI generator and integration tests.

pub mod config;
pub mod dao;
pub mod dto;
pub mod error;
pub mod net;
pub mod routes;
pub mod services;
pub mod state;
pub mod time_source;
