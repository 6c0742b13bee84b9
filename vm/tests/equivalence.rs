mod common;

use alloy::primitives::{Address, U256};
use common::{evaluate, outputs, World};
use gateway_vm::machine::follow;
use gateway_vm::value::word;
use gateway_vm::{GatewayRequest, Op};

const TARGET: Address = Address::repeat_byte(0x51);

fn world() -> World {
    let mut world = World::default();
    world
        .set(TARGET, U256::from(3), U256::from(11))
        .set(TARGET, U256::from(8), U256::from(22))
        .set(TARGET, follow(&word(U256::from(7)), U256::from(3)), U256::from(33));
    world
}

fn request() -> GatewayRequest {
    let mut req = GatewayRequest::new(0);
    req.set_target(TARGET).set_slot(U256::from(3));
    req
}

/// Both programs differ in encoding but agree on every output and the exit
/// code.
fn assert_equivalent(a: &GatewayRequest, b: &GatewayRequest) {
    assert_ne!(a.ops().len(), b.ops().len());
    let world = world();
    let a_result = evaluate(a, &world).unwrap();
    let b_result = evaluate(b, &world).unwrap();
    assert_eq!(outputs(&a_result, &world), outputs(&b_result, &world));
    assert_eq!(a_result.exit_code, b_result.exit_code);
}

#[test]
fn follow_matches_explicit_keccak() {
    let mut a = request();
    a.push_u64(7).follow().read().add_output();
    a.push_slot().add_output();

    let mut b = request();
    b.push_u64(7).push_slot().concat(2).keccak().slot().read().add_output();
    b.push_slot().add_output();

    assert_equivalent(&a, &b);
    let world = world();
    let out = outputs(&evaluate(&a, &world).unwrap(), &world);
    assert_eq!(out[0], word(U256::from(33)));
}

#[test]
fn add_slot_matches_explicit_plus() {
    let mut a = request();
    a.push_u64(5).add_slot().read().add_output();

    let mut b = request();
    b.push_slot().push_u64(5).plus().slot().read().add_output();

    assert_equivalent(&a, &b);
    let world = world();
    let out = outputs(&evaluate(&b, &world).unwrap(), &world);
    assert_eq!(out[0], word(U256::from(22)));
}

#[test]
fn push_stack_matches_explicit_dup() {
    let mut a = request();
    a.push_u64(10).push_u64(20).push_u64(30);
    let mut b = a.clone();

    a.push_stack(1).add_output();
    b.stack_size()
        .push_u64(2)
        .subtract()
        .op(Op::Dup)
        .add_output();

    assert_equivalent(&a, &b);
    let world = world();
    let out = outputs(&evaluate(&a, &world).unwrap(), &world);
    assert_eq!(out[0], word(U256::from(20)));
}

#[test]
fn reversed_comparison_with_dup() {
    for (x, y) in [(3u64, 5u64), (5, 3), (4, 4)] {
        let mut a = request();
        a.push_u64(x).push_u64(y);
        let mut b = a.clone();

        a.dup(1).dup(1).lt().add_output();
        b.dup(0).dup(2).gt().add_output();

        assert_equivalent(&a, &b);
        let world = world();
        let out = outputs(&evaluate(&a, &world).unwrap(), &world);
        assert_eq!(out[0], word(U256::from((x < y) as u8)));
    }
}

#[test]
fn requirement_failures_agree() {
    let mut a = request();
    a.set_slot(U256::from(99)).read().require_nonzero(0).add_output();

    let mut b = request();
    b.push_u64(96)
        .push_u64(3)
        .plus()
        .slot()
        .read()
        .require_nonzero(0)
        .add_output();

    assert_equivalent(&a, &b);
    let world = world();
    assert_eq!(evaluate(&a, &world).unwrap().exit_code, 1);
}
