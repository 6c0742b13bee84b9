use alloy::primitives::{b256, B256};

/// The hash value of an account empty EVM code.
/// 0xc5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470
pub const EMPTY_CODE_HASH: B256 =
    b256!("c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470");

/// The hash of an empty Merkle Patricia trie.
/// 0x56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421
pub const EMPTY_TRIE_HASH: B256 =
    b256!("56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421");

/// Number of bytes in an EVM storage word.
pub const WORD_SIZE: usize = 32;

/// Returns true if an account with this code hash has deployed code.
///
/// Non-existent accounts report a zero code hash from `eth_getProof`, while
/// existing accounts without code report [`EMPTY_CODE_HASH`].
pub fn has_code(code_hash: B256) -> bool {
    code_hash != B256::ZERO && code_hash != EMPTY_CODE_HASH
}

#[test]
fn test_empty_code_hash() {
    assert_eq!(EMPTY_CODE_HASH, alloy::primitives::keccak256([]));
}

#[test]
fn test_empty_trie_hash() {
    // `rlp("")`
    assert_eq!(EMPTY_TRIE_HASH, alloy::primitives::keccak256([0x80]));
}

#[test]
fn test_has_code() {
    assert!(!has_code(B256::ZERO));
    assert!(!has_code(EMPTY_CODE_HASH));
    assert!(has_code(B256::repeat_byte(1)));
}
