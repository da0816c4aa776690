pub mod archive;
pub mod batcher;
pub mod cli;
pub mod config;
pub mod delivery;
pub mod destination;
pub mod registry;
pub mod storage;
