#![allow(dead_code)]

pub mod db;
pub mod server;

pub use db::TestDb;
pub use server::{seed, seeded_memory_store, TestServer, PASSWORD};
