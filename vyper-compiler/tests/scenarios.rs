//! End-to-end scenarios over the full pipeline, driven through the
//! test-helper front-end.

use std::collections::HashSet;
use std::path::PathBuf;

use ethereum_types::U256;
use serde_json::json;

use vyper_compiler::ast::method_id;
use vyper_compiler::input_bundle::JsonInputBundle;
use vyper_compiler::selector_table::generate_dense_jumptable_info;
use vyper_compiler::util::{compile_source, compile_with_bundle, Evm, Outcome};
use vyper_compiler::vyper_asm::{AssemblyItem, EvmVersion, JumpType, Label};
use vyper_compiler::{OptimizationLevel, Settings};

fn settings(optimize: OptimizationLevel, evm_version: EvmVersion) -> Settings {
    Settings {
        compiler_version: None,
        optimize: Some(optimize),
        evm_version: Some(evm_version),
    }
}

fn shanghai_gas() -> Settings {
    settings(OptimizationLevel::Gas, EvmVersion::Shanghai)
}

fn count_subslice(haystack: &[u8], needle: &[u8]) -> usize {
    haystack
        .windows(needle.len())
        .filter(|w| *w == needle)
        .count()
}

fn count_ops(items: &[AssemblyItem], mnemonic: &str) -> usize {
    items
        .iter()
        .filter(|i| i.mnemonic() == Some(mnemonic))
        .count()
}

fn call(runtime: &[u8], calldata: Vec<u8>) -> Outcome {
    Evm::new(runtime.to_vec()).with_calldata(calldata).run()
}

fn selector_calldata(signature: &str) -> Vec<u8> {
    method_id(signature).to_be_bytes().to_vec()
}

// S1: trivial returner
#[test]
fn trivial_returner() {
    let src = "@external\ndef foo() -> uint256:\n    return 42\n";
    let data = compile_source(src, shanghai_gas()).unwrap();

    assert_eq!(
        data.method_identifiers.get("foo()").map(String::as_str),
        Some("0xc2985578")
    );

    // exactly one PUSH1 0x2a, with an MSTORE and a RETURN after it
    let runtime = &data.bytecode_runtime;
    assert_eq!(count_subslice(runtime, &[0x60, 0x2a]), 1);
    let pos = runtime
        .windows(2)
        .position(|w| w == [0x60, 0x2a])
        .unwrap();
    let tail = &runtime[pos..];
    let mstore = tail.iter().position(|&b| b == 0x52).unwrap();
    assert!(tail[mstore..].contains(&0xF3));

    // no internal functions, so no i/o jumps
    assert!(data
        .runtime
        .source_map
        .pc_jump_map
        .values()
        .all(|j| *j == JumpType::Regular));

    assert_eq!(data.metadata.immutables_length, 0);

    // the dispatcher routes the selector to the function
    match call(runtime, selector_calldata("foo()")) {
        Outcome::Return(out) => {
            assert_eq!(U256::from_big_endian(&out), U256::from(42))
        }
        other => panic!("expected a return, got {other:?}"),
    }
    // and anything else to the (reverting) default fallback
    assert_eq!(
        call(runtime, vec![0xde, 0xad, 0xbe, 0xef]),
        Outcome::Revert(vec![])
    );
}

// S2: nonreentrant pair
#[test]
fn nonreentrant_pair() {
    let src = "\
@external
@nonreentrant
def f() -> uint256:
    return 1

@external
@nonreentrant
def g() -> uint256:
    return 2
";

    // shanghai: the lock lives in storage at slot 0
    let data = compile_source(src, shanghai_gas()).unwrap();
    let storage_layout = data.layout_export.get("storage_layout").unwrap();
    assert_eq!(
        storage_layout.get("$.nonreentrant_key").unwrap(),
        &json!({"type": "nonreentrant lock", "slot": 0, "n_slots": 1})
    );

    // each prologue probes and sets the lock through storage
    let sloads = count_ops(&data.runtime_items, "SLOAD");
    assert_eq!(sloads, 2);
    assert_eq!(count_ops(&data.runtime_items, "TLOAD"), 0);

    // cancun: same shape, through transient storage
    let data = compile_source(
        src,
        settings(OptimizationLevel::Gas, EvmVersion::Cancun),
    )
    .unwrap();
    let transient_layout =
        data.layout_export.get("transient_storage_layout").unwrap();
    assert_eq!(
        transient_layout.get("$.nonreentrant_key").unwrap(),
        &json!({"type": "nonreentrant lock", "slot": 0, "n_slots": 1})
    );
    let tloads = count_ops(&data.runtime_items, "TLOAD");
    assert_eq!(tloads, 2);
    // acquire and release per function
    assert_eq!(count_ops(&data.runtime_items, "TSTORE"), 4);

    // a held lock makes the call revert
    let mut evm = Evm::new(data.bytecode_runtime.clone())
        .with_calldata(selector_calldata("f()"));
    evm.transient.insert(U256::zero(), U256::one());
    assert_eq!(evm.run(), Outcome::Revert(vec![]));

    // an open lock lets it through
    let mut evm = Evm::new(data.bytecode_runtime.clone())
        .with_calldata(selector_calldata("f()"));
    match evm.run() {
        Outcome::Return(out) => {
            assert_eq!(U256::from_big_endian(&out), U256::one())
        }
        other => panic!("expected a return, got {other:?}"),
    }
    // and the lock is released on the way out
    assert_eq!(
        evm.transient.get(&U256::zero()).copied().unwrap_or_default(),
        U256::zero()
    );
}

// S3: dense selector table
#[test]
fn dense_selector_table() {
    let method_ids: Vec<u32> =
        (0..30).map(|i| method_id(&format!("foo{i}()"))).collect();
    let (n_buckets, buckets) =
        generate_dense_jumptable_info(&method_ids).unwrap();
    assert_eq!(n_buckets, 3);
    let sizes: Vec<usize> =
        buckets.values().map(|b| b.bucket_size()).collect();
    assert_eq!(sizes, vec![10, 12, 8]);

    // end to end: every method dispatches correctly under codesize mode
    let mut src = String::new();
    for i in 0..30 {
        src.push_str(&format!(
            "@external\ndef foo{i}() -> uint256:\n    return {}\n\n",
            i + 100
        ));
    }
    let data = compile_source(
        &src,
        settings(OptimizationLevel::Codesize, EvmVersion::Shanghai),
    )
    .unwrap();

    for i in 0..30u64 {
        let calldata = selector_calldata(&format!("foo{i}()"));
        match call(&data.bytecode_runtime, calldata) {
            Outcome::Return(out) => {
                assert_eq!(U256::from_big_endian(&out), U256::from(i + 100))
            }
            other => panic!("foo{i} dispatch failed: {other:?}"),
        }
    }
    // unknown selectors fall through to the reverting fallback
    assert_eq!(
        call(&data.bytecode_runtime, vec![0xff, 0xff, 0xff, 0xff]),
        Outcome::Revert(vec![])
    );
}

// S4: division by zero routes through the shared failure block
#[test]
fn division_by_zero_revert() {
    let src = "\
@external
def g(x: uint256, y: uint256) -> uint256:
    return x // y
";
    let data = compile_source(src, shanghai_gas()).unwrap();

    let tags: Vec<&str> = data
        .runtime
        .source_map
        .error_map
        .values()
        .map(String::as_str)
        .collect();
    assert_eq!(tags, vec!["safediv"]);

    // the shared revert block is emitted exactly once
    let revert0 = data
        .runtime_items
        .iter()
        .filter(|i| **i == AssemblyItem::Label(Label::new("revert0")))
        .count();
    assert_eq!(revert0, 1);

    let mut calldata = selector_calldata("g(uint256,uint256)");
    calldata.extend([0u8; 31]);
    calldata.push(10);
    calldata.extend([0u8; 31]);
    calldata.push(2);
    match call(&data.bytecode_runtime, calldata.clone()) {
        Outcome::Return(out) => {
            assert_eq!(U256::from_big_endian(&out), U256::from(5))
        }
        other => panic!("expected 10 // 2, got {other:?}"),
    }

    // zero divisor reverts through revert0
    let len = calldata.len();
    calldata[len - 1] = 0;
    assert_eq!(call(&data.bytecode_runtime, calldata), Outcome::Revert(vec![]));
}

// S5: internal function referenced only from the constructor
#[test]
fn dead_internal_function() {
    let src = "\
s: uint256

@internal
def dead():
    self.s = 1

@external
def live() -> uint256:
    return self.s

@external
def __init__():
    self.dead()
";
    let data = compile_source(src, shanghai_gas()).unwrap();

    let has_label = |items: &[AssemblyItem]| {
        items
            .iter()
            .any(|i| *i == AssemblyItem::Label(Label::new("internal_dead")))
    };
    assert!(!has_label(&data.runtime_items));
    assert!(has_label(&data.deploy_items));
}

// S6: integrity sum is stable across unrelated search-path orderings
#[test]
fn integrity_sum_stability() {
    let a = "import b as b\n\n@external\ndef f() -> uint256:\n    return 1\n";
    let b = "import c as c\n\nx: uint256\n";
    let c = "y: uint256\n";

    let files = [
        (PathBuf::from("lib/b.vy"), json!({"content": b})),
        (PathBuf::from("lib/c.vy"), json!({"content": c})),
    ];

    let mut bundle1 = JsonInputBundle::new(
        files.clone(),
        vec![PathBuf::from("lib")],
    )
    .unwrap();
    let data1 = compile_with_bundle(a, shanghai_gas(), &mut bundle1).unwrap();

    // a second compilation with an extra (useless) search path in front
    let mut bundle2 = JsonInputBundle::new(
        files,
        vec![PathBuf::from("elsewhere"), PathBuf::from("lib")],
    )
    .unwrap();
    let data2 = compile_with_bundle(a, shanghai_gas(), &mut bundle2).unwrap();

    assert_eq!(data1.imports.integrity_sum, data2.imports.integrity_sum);
    assert_eq!(data1.bytecode, data2.bytecode);
}

// storage layout composition and hashmap access
#[test]
fn storage_variables_and_maps() {
    let src = "\
owner: public(address)
balances: HashMap[address, uint256]
total: public(uint256)

@external
def deposit(amount: uint256):
    self.balances[msg.sender] = self.balances[msg.sender] + amount
    self.total = self.total + amount

@external
def balance_of(who: address) -> uint256:
    return self.balances[who]
";
    let data = compile_source(src, shanghai_gas()).unwrap();

    let layout = data.layout_export.get("storage_layout").unwrap();
    assert_eq!(layout["owner"]["slot"], json!(0));
    assert_eq!(layout["balances"]["slot"], json!(1));
    assert_eq!(layout["balances"]["n_slots"], json!(1));
    assert_eq!(layout["total"]["slot"], json!(2));

    // deposit twice from the same caller, then read the balance back
    let caller = U256::from(0x1234);
    let mut calldata = selector_calldata("deposit(uint256)");
    calldata.extend([0u8; 31]);
    calldata.push(7);

    let mut evm = Evm::new(data.bytecode_runtime.clone())
        .with_calldata(calldata.clone())
        .with_caller(caller);
    assert_eq!(evm.run(), Outcome::Stop);

    let mut evm2 = Evm::new(data.bytecode_runtime.clone())
        .with_calldata(calldata)
        .with_caller(caller);
    evm2.storage = evm.storage.clone();
    assert_eq!(evm2.run(), Outcome::Stop);

    let mut query = selector_calldata("balance_of(address)");
    let mut word = [0u8; 32];
    caller.to_big_endian(&mut word);
    query.extend(word);
    let mut evm3 =
        Evm::new(data.bytecode_runtime.clone()).with_calldata(query);
    evm3.storage = evm2.storage.clone();
    match evm3.run() {
        Outcome::Return(out) => {
            assert_eq!(U256::from_big_endian(&out), U256::from(14))
        }
        other => panic!("expected balance, got {other:?}"),
    }

    // the public getter for `total` reads slot 2
    let mut evm4 = Evm::new(data.bytecode_runtime.clone())
        .with_calldata(selector_calldata("total()"));
    evm4.storage.insert(U256::from(2), U256::from(99));
    match evm4.run() {
        Outcome::Return(out) => {
            assert_eq!(U256::from_big_endian(&out), U256::from(99))
        }
        other => panic!("expected getter value, got {other:?}"),
    }
}

// loops, internal calls and the i/o jump classification
#[test]
fn loops_and_internal_calls() {
    let src = "\
@internal
def double(x: uint256) -> uint256:
    return x * 2

@external
def sum_doubled(n: uint256) -> uint256:
    acc: uint256 = 0
    for i in range(10):
        if i >= n:
            break
        acc = acc + self.double(i)
    return acc
";
    let data = compile_source(src, shanghai_gas()).unwrap();

    // internal call sites classify as i, the cleanup return path as o
    let jumps: HashSet<JumpType> = data
        .runtime
        .source_map
        .pc_jump_map
        .values()
        .copied()
        .collect();
    assert!(jumps.contains(&JumpType::In));
    assert!(jumps.contains(&JumpType::Out));

    // sum of 2*i for i in 0..4 = 12
    let mut calldata = selector_calldata("sum_doubled(uint256)");
    calldata.extend([0u8; 31]);
    calldata.push(4);
    match call(&data.bytecode_runtime, calldata) {
        Outcome::Return(out) => {
            assert_eq!(U256::from_big_endian(&out), U256::from(12))
        }
        other => panic!("expected loop sum, got {other:?}"),
    }
}

// calldata that is too short is rejected at the prologue
#[test]
fn calldatasize_check() {
    let src = "\
@external
def g(x: uint256) -> uint256:
    return x
";
    let data = compile_source(src, shanghai_gas()).unwrap();

    // selector only, no argument word
    assert_eq!(
        call(&data.bytecode_runtime, selector_calldata("g(uint256)")),
        Outcome::Revert(vec![])
    );
}

// nonpayable functions reject value transfers
#[test]
fn nonpayable_check() {
    let src = "@external\ndef f() -> uint256:\n    return 1\n";
    let data = compile_source(src, shanghai_gas()).unwrap();
    let outcome = Evm::new(data.bytecode_runtime.clone())
        .with_calldata(selector_calldata("f()"))
        .with_callvalue(U256::one())
        .run();
    assert_eq!(outcome, Outcome::Revert(vec![]));
}

// events lower to LOG with the signature topic
#[test]
fn event_logging() {
    let src = "\
event Ping:
    sender: indexed(address)
    value: uint256

@external
def ping(v: uint256):
    log Ping(msg.sender, v)
";
    let data = compile_source(src, shanghai_gas()).unwrap();
    // LOG2: topic0 plus one indexed field
    assert_eq!(count_ops(&data.runtime_items, "LOG2"), 1);

    let mut calldata = selector_calldata("ping(uint256)");
    calldata.extend([0u8; 32]);
    assert_eq!(call(&data.bytecode_runtime, calldata), Outcome::Stop);
}

// constructor wiring: immutables are written at deploy time and read from
// code at runtime
#[test]
fn immutables_roundtrip() {
    let src = "\
LIMIT: immutable(uint256)

@external
def __init__():
    self.LIMIT = 123

@external
def limit() -> uint256:
    return self.LIMIT
";
    let data = compile_source(src, shanghai_gas()).unwrap();
    assert_eq!(data.metadata.immutables_length, 32);

    let code_layout = data.layout_export.get("code_layout").unwrap();
    assert_eq!(code_layout["LIMIT"]["offset"], json!(0));
    assert_eq!(code_layout["LIMIT"]["length"], json!(32));

    // run the deploy program; it returns runtime code plus immutables
    let mut evm = Evm::new(data.deploy.bytecode.clone());
    let deployed = match evm.run() {
        Outcome::Return(code) => code,
        other => panic!("deploy failed: {other:?}"),
    };
    assert_eq!(
        deployed.len(),
        data.bytecode_runtime.len() + data.metadata.immutables_length
    );
    assert!(deployed.starts_with(&data.bytecode_runtime));

    // the deployed code (with immutables appended) serves the getter
    match call(&deployed, selector_calldata("limit()")) {
        Outcome::Return(out) => {
            assert_eq!(U256::from_big_endian(&out), U256::from(123))
        }
        other => panic!("expected immutable value, got {other:?}"),
    }
}

// metadata trailer: runtime length and a parseable 2-byte suffix
#[test]
fn metadata_trailer_shape() {
    let src = "@external\ndef foo() -> uint256:\n    return 42\n";
    let data = compile_source(src, shanghai_gas()).unwrap();

    assert_eq!(data.metadata.runtime_length, data.bytecode_runtime.len());

    let n = data.bytecode.len();
    let suffix =
        u16::from_be_bytes([data.bytecode[n - 2], data.bytecode[n - 1]]);
    // deploy code, CBOR blob, suffix
    assert_eq!(
        data.bytecode.len(),
        data.deploy.bytecode.len() + suffix as usize + 2
    );
}
