//! Cluster observation coordinator.
//!
//! A coordinator process splits cluster-wide work over the shards of an
//! observation: it starts one worker per host over ssh, accepts their
//! connections back, and drives them through a private binary protocol.
//! Results are merged (statistics, histograms), collected per shard
//! (antennas, bands) or scattered into a global time/frequency grid (rows).

pub mod cli;
pub mod config;
pub mod error;
pub mod observation;
pub mod payload;
pub mod remote;
pub mod store;
