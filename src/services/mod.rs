pub mod admission;
pub mod cache;
pub mod catalog;
pub mod cleanup;
pub mod crypto;
pub mod failover;
pub mod health;
pub mod matching;
pub mod playback;
pub mod pool;
pub mod streaming;
pub mod upstream;
pub mod xtream;
