//! wormscan-data crate
//!
//! Ingestion side of the explorer: node client, block decoder, SQLite store
//! and the pipeline that ties them together.

pub mod amount;
pub mod classify;
pub mod config;
pub mod decode;
pub mod error;
pub mod logs;
pub mod node;
pub mod pipeline;
pub mod signature;
pub mod stats;
pub mod store;
pub mod trace;
pub mod types;
pub mod wormholes;

pub use config::Config;
pub use decode::BlockDecoder;
pub use error::{DecodeError, RpcError};
pub use node::{Capabilities, Node};
pub use pipeline::{boot_check, Pipeline, PipelineOptions};
pub use stats::Stats;
pub use store::{CommitOutcome, Store};
pub use types::{Account, Block, Header, InternalTx, Log, Parsed, Transaction};
