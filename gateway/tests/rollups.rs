use alloy::primitives::{keccak256, Address, Signature, U256};
use alloy::signers::local::PrivateKeySigner;
use gateway::memory::{MemoryChain, MemoryProofVerifier, MemoryState};
use gateway::replay::replay;
use gateway::rollup::trusted::signed_digest;
use gateway::rollup::witness::SignedWitness;
use gateway::rollup::{
    Rollup, RollupError, SelfConfig, SelfRollup, TrustedConfig, TrustedRollup,
};
use gateway_vm::{GatewayRequest, MachineConfig};

const TARGET: Address = Address::repeat_byte(0x3c);

fn chain(blocks: u64) -> MemoryChain {
    let chain = MemoryChain::new(2);
    let mut state = MemoryState::default();
    for i in 0..blocks {
        state.set_storage(TARGET, U256::ZERO, U256::from(i + 1));
        chain.push_block(state.clone());
    }
    chain
}

fn signer() -> PrivateKeySigner {
    PrivateKeySigner::from_bytes(&keccak256("gateway")).unwrap()
}

#[tokio::test]
async fn recent_commits_strictly_decrease() {
    for step in [1, 3, 5] {
        let rollup = SelfRollup::new(
            chain(20),
            SelfConfig {
                step,
                ..Default::default()
            },
        );
        let commits = rollup.fetch_recent_commits(4).await.unwrap();
        assert!(!commits.is_empty() && commits.len() <= 4);
        for pair in commits.windows(2) {
            assert!(pair[1].index < pair[0].index);
            assert_eq!(pair[1].index % step, 0);
        }
    }
}

#[tokio::test]
async fn commits_see_their_own_state() {
    let rollup = SelfRollup::new(chain(3), SelfConfig::default());
    for commit in rollup.fetch_recent_commits(3).await.unwrap() {
        let value = commit.prover.get_storage(TARGET, U256::ZERO).await.unwrap();
        assert_eq!(value, U256::from(commit.index + 1));
    }
}

#[tokio::test]
async fn missing_block_is_a_fetch_error() {
    let rollup = SelfRollup::new(chain(2), SelfConfig::default());
    assert!(rollup.fetch_commit(9).await.is_err());
    let empty = SelfRollup::new(MemoryChain::new(1), SelfConfig::default());
    assert!(matches!(
        empty.fetch_latest_commit().await,
        Err(RollupError::Latest(_))
    ));
}

#[tokio::test]
async fn trusted_commits_are_signed() {
    let signer = signer();
    let address = signer.address();
    let rollup = TrustedRollup::new(chain(2), signer, TrustedConfig::default());
    assert_eq!(rollup.signer_address(), address);

    let commit = rollup.fetch_latest_commit().await.unwrap();
    assert_eq!(commit.index, commit.meta.signed_at);
    assert_eq!(commit.meta.block.number, 1);
    let signature = Signature::try_from(&commit.meta.signature[..]).unwrap();
    let recovered = signature
        .recover_address_from_prehash(&signed_digest(commit.meta.signed_at, commit.state_root))
        .unwrap();
    assert_eq!(recovered, address);

    // Within the TTL the same commit is reused and can be looked up.
    let again = rollup.fetch_latest_commit().await.unwrap();
    assert_eq!(again.index, commit.index);
    assert!(rollup.fetch_commit(commit.index).await.is_ok());
    assert!(rollup.fetch_commit(commit.index + 1).await.is_err());

    // Only one commit is ever visible.
    assert_eq!(rollup.fetch_recent_commits(5).await.unwrap().len(), 1);
    assert_eq!(rollup.window_from_sec(3_600), 3_600);
}

#[tokio::test]
async fn trusted_indices_increase_between_signings() {
    let rollup = TrustedRollup::new(
        chain(2),
        signer(),
        TrustedConfig {
            ttl_sec: 0,
            ..Default::default()
        },
    );
    let mut last = 0;
    for _ in 0..3 {
        let commit = rollup.fetch_latest_commit().await.unwrap();
        assert!(commit.index > last);
        last = commit.index;
    }
}

#[tokio::test]
async fn trusted_witness_replays() {
    let rollup = TrustedRollup::new(chain(2), signer(), TrustedConfig::default());
    let commit = rollup.fetch_latest_commit().await.unwrap();
    let mut req = GatewayRequest::new(0);
    req.set_target(TARGET).read().add_output();

    let witness = rollup.prove_request(&commit, &req).await.unwrap();
    let decoded = SignedWitness::decode(&witness).unwrap();
    assert_eq!(decoded.signed_at, commit.meta.signed_at);
    assert_eq!(decoded.state_root, commit.state_root);
    assert_eq!(decoded.signature, commit.meta.signature);

    let replayed = replay(
        &MemoryProofVerifier,
        decoded.state_root,
        &req,
        &decoded.proofs,
        MachineConfig::default(),
    )
    .unwrap();
    assert_eq!(U256::from_be_slice(&replayed.outputs[0]), U256::from(2));
}
