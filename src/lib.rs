//! Portcullis - authorization, session and admission control for a multi-tenant
//! resource API.
//!
//! This library provides the core components behind the `portcullis` binary.
//! It exposes all modules for testing purposes.

pub mod admission;
pub mod authz;
pub mod credentials;
pub mod entities;
pub mod errors;
pub mod jobs;
pub mod jwks;
pub mod session;
pub mod settings;
pub mod storage;
pub mod web;
