//! ABI layouts of the witnesses verifier contracts decode.

use alloy::primitives::{Bytes, B256, U256};
use alloy::sol_types::SolValue;

use crate::prover::ProofSequence;

/// Witness of adapters identified by a block index:
/// `(uint256 index, bytes[] proofs, bytes order)`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IndexedWitness {
    pub index: u64,
    pub proofs: ProofSequence,
}

impl IndexedWitness {
    pub fn encode(index: u64, proofs: &ProofSequence) -> Bytes {
        (U256::from(index), proofs.proofs.clone(), proofs.order.clone())
            .abi_encode_params()
            .into()
    }

    pub fn decode(data: &[u8]) -> Result<Self, alloy::sol_types::Error> {
        let (index, proofs, order) = <(U256, Vec<Bytes>, Bytes)>::abi_decode_params(data, true)?;
        Ok(Self {
            index: index.saturating_to::<u64>(),
            proofs: ProofSequence { proofs, order },
        })
    }
}

/// Witness of the trusted adapter:
/// `(bytes signature, uint64 signedAt, bytes32 stateRoot, bytes[] proofs, bytes order)`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignedWitness {
    pub signature: Bytes,
    pub signed_at: u64,
    pub state_root: B256,
    pub proofs: ProofSequence,
}

impl SignedWitness {
    pub fn encode(
        signature: &Bytes,
        signed_at: u64,
        state_root: B256,
        proofs: &ProofSequence,
    ) -> Bytes {
        (
            signature.clone(),
            signed_at,
            state_root,
            proofs.proofs.clone(),
            proofs.order.clone(),
        )
            .abi_encode_params()
            .into()
    }

    pub fn decode(data: &[u8]) -> Result<Self, alloy::sol_types::Error> {
        let (signature, signed_at, state_root, proofs, order) =
            <(Bytes, u64, B256, Vec<Bytes>, Bytes)>::abi_decode_params(data, true)?;
        Ok(Self {
            signature,
            signed_at,
            state_root,
            proofs: ProofSequence { proofs, order },
        })
    }
}
