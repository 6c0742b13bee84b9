//! Storage-proof request programs and the machine that evaluates them.
//!
//! A [`GatewayRequest`] is a compact stack program describing which storage
//! locations of which contracts to read, follow and combine. Evaluating it
//! with a [`Machine`] yields the requested outputs together with a
//! [`NeedSet`]: the ordered list of account and storage locations that must
//! be backed by Merkle proofs for an on-chain verifier to replay the same
//! program.
//!
//! This crate performs no I/O. The machine reads from a [`StateView`] and
//! reports what it is missing; fetching is left to the caller.
//!
//! # Usage
//!
//! ```
//! use alloy::primitives::{Address, U256};
//! use gateway_vm::{GatewayRequest, Machine, Outcome, Snapshot};
//!
//! let target = Address::repeat_byte(0x11);
//! let mut req = GatewayRequest::new(0);
//! req.set_target(target).set_slot(U256::from(3)).read().add_output();
//!
//! let mut state = Snapshot::default();
//! state.insert_storage(target, U256::from(3), U256::from(42));
//!
//! let Outcome::Done(result) = Machine::default().evaluate(&req, &state).unwrap() else {
//!     unreachable!()
//! };
//! let output = result.outputs[0].materialize(&state).unwrap();
//! assert_eq!(U256::from_be_slice(&output), U256::from(42));
//! assert_eq!(result.needs.len(), 2);
//! ```

pub mod disasm;
pub mod machine;
pub mod need;
pub mod ops;
pub mod program;
pub mod state;
pub mod value;

pub use disasm::{disassemble, Action, DecodeError, Disassembly, Instruction};
pub use machine::{
    Machine, MachineConfig, MachineError, MachineResult, Missing, Outcome, REQUIRE_FAILED,
};
pub use need::{Need, NeedSet};
pub use ops::{LoopFlags, Op};
pub use program::{GatewayProgram, GatewayRequest};
pub use state::{Snapshot, StateView};
pub use value::Value;
