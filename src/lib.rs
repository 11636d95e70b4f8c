pub mod analysis;
pub mod config;
pub mod design;
pub mod engine;
pub mod logging;
pub mod persist;
pub mod record;
pub mod remote;
pub mod retry;
pub mod rng;
pub mod storage;
