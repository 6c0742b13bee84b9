//! Async half of the storage-proof gateway.
//!
//! A [`Prover`](prover::Prover) evaluates [`GatewayRequest`]s against a
//! [`StateAccessor`](accessor::StateAccessor) pinned to one block, fetching
//! state through coalescing [caches](cache), and turns the recorded needs into
//! a deduplicated [`ProofSequence`](prover::ProofSequence). A
//! [`Rollup`](rollup::Rollup) picks the block to prove against and encodes
//! the witness its verifier contract decodes.

pub mod accessor;
pub mod cache;
pub mod env;
pub mod error;
pub mod memory;
pub mod provider;
pub mod prover;
pub mod replay;
pub mod rollup;
pub mod rpc;
pub mod tracing;

pub use error::GatewayError;
pub use gateway_vm::{GatewayProgram, GatewayRequest};
