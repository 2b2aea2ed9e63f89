#![allow(async_fn_in_trait)]
pub mod auth;
pub mod config;
pub mod drive;
pub mod earth_engine;
pub mod error;
pub mod export;
pub mod gee_service;
pub mod polling;
pub mod polygon;
pub mod render;
pub mod satellite;

#[cfg(test)]
mod testing;
