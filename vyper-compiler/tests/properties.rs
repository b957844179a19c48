//! The quantified-invariant suite: determinism, symbol closure, layout
//! disjointness, selector-table correctness, perfect hashing, map
//! coverage, push-width minimality and dead-code safety.

use std::collections::{BTreeSet, HashSet};

use ethereum_types::U256;
use quickcheck_macros::quickcheck;

use vyper_compiler::ast::method_id;
use vyper_compiler::selector_table::generate_dense_jumptable_info;
use vyper_compiler::util::{compile_source, Evm, Outcome};
use vyper_compiler::vyper_asm::{
    byte_length, compress, expand, push_int, AssemblyItem, DataItem,
    EvmVersion, Label, SymbolRef, SYMBOL_SIZE,
};
use vyper_compiler::{OptimizationLevel, Settings};

fn settings(optimize: OptimizationLevel) -> Settings {
    Settings {
        compiler_version: None,
        optimize: Some(optimize),
        evm_version: Some(EvmVersion::Shanghai),
    }
}

// a contract with a bit of everything, used by several properties
const KITCHEN_SINK: &str = "\
owner: public(address)
counts: HashMap[address, uint256]
total: uint256

event Bump:
    who: indexed(address)
    amount: uint256

@internal
def _bump(amount: uint256) -> uint256:
    return amount + 1

@external
def bump() -> uint256:
    acc: uint256 = 0
    for i in range(4):
        acc = acc + self._bump(i)
    self.total = self.total + acc
    log Bump(msg.sender, acc)
    return acc

@external
def peek() -> uint256:
    return self.total
";

// property 1: byte-for-byte determinism
#[test]
fn compilation_is_deterministic() {
    let a = compile_source(KITCHEN_SINK, settings(OptimizationLevel::Gas))
        .unwrap();
    let b = compile_source(KITCHEN_SINK, settings(OptimizationLevel::Gas))
        .unwrap();

    assert_eq!(a.bytecode, b.bytecode);
    assert_eq!(a.bytecode_runtime, b.bytecode_runtime);
    assert_eq!(a.metadata, b.metadata);
    assert_eq!(
        a.runtime.source_map.pc_jump_map,
        b.runtime.source_map.pc_jump_map
    );
    assert_eq!(
        a.runtime.source_map.error_map,
        b.runtime.source_map.error_map
    );
    assert_eq!(
        compress(&a.runtime.source_map.entries(), 0),
        compress(&b.runtime.source_map.entries(), 0)
    );
}

// property 2: every pushed label resolves to an in-bounds PC that is a
// JUMPDEST or lies inside a data section
#[test]
fn symbol_closure() {
    for optimize in [OptimizationLevel::Gas, OptimizationLevel::Codesize] {
        let data = compile_source(KITCHEN_SINK, settings(optimize)).unwrap();

        // data-section ranges, from the header label to the section's end
        let mut data_ranges = Vec::new();
        let mut section_start: Option<usize> = None;
        let mut cursor = 0usize;
        for item in &data.runtime_items {
            match item {
                AssemblyItem::DataHeader(label) => {
                    if let Some(start) = section_start.take() {
                        data_ranges.push(start..cursor);
                    }
                    let pc = data.runtime.symbol_map.label(label).unwrap();
                    section_start = Some(pc);
                    cursor = pc;
                }
                AssemblyItem::Data(DataItem::Bytes(bytes)) => {
                    cursor += bytes.len()
                }
                AssemblyItem::Data(DataItem::Label(_)) => {
                    cursor += SYMBOL_SIZE
                }
                _ => {}
            }
        }
        if let Some(start) = section_start {
            data_ranges.push(start..cursor);
        }

        for item in &data.runtime_items {
            let label = match item {
                AssemblyItem::PushLabel(l) => l,
                AssemblyItem::PushOffset(SymbolRef::Label(l), _) => l,
                AssemblyItem::Data(DataItem::Label(l)) => l,
                _ => continue,
            };
            let pc = data
                .runtime
                .symbol_map
                .label(label)
                .unwrap_or_else(|| panic!("unresolved label {label}"));
            assert!(pc <= data.bytecode_runtime.len(), "{label} out of bounds");
            let is_jumpdest =
                data.bytecode_runtime.get(pc) == Some(&0x5B);
            let in_data = data_ranges.iter().any(|r| r.contains(&pc));
            let is_code_end = pc == data.bytecode_runtime.len();
            assert!(
                is_jumpdest || in_data || is_code_end,
                "{label} points at {pc}, neither jumpdest nor data"
            );
        }
    }
}

// property 3: storage slots assigned to distinct variables are disjoint
#[quickcheck]
fn storage_non_overlap(n_vars: u8) -> bool {
    let n_vars = (n_vars % 12) as usize + 1;
    let mut src = String::new();
    for i in 0..n_vars {
        if i % 3 == 0 {
            src.push_str(&format!("m{i}: HashMap[address, uint256]\n"));
        } else {
            src.push_str(&format!("v{i}: uint256\n"));
        }
    }
    src.push_str("\n@external\ndef f() -> uint256:\n    return 0\n");

    let data = compile_source(&src, settings(OptimizationLevel::Gas)).unwrap();
    let layout = data.layout_export.get("storage_layout").unwrap();

    let mut seen: BTreeSet<u64> = BTreeSet::new();
    for (_, leaf) in layout.as_object().unwrap() {
        let slot = leaf["slot"].as_u64().unwrap();
        let n_slots = leaf["n_slots"].as_u64().unwrap();
        for s in slot..slot + n_slots {
            if !seen.insert(s) {
                return false;
            }
        }
    }
    true
}

// property 4: the dispatcher routes every selector to its method and
// everything else to the fallback
#[quickcheck]
fn selector_dispatch_routes_correctly(n_methods: u8, probe: u32) -> bool {
    let n_methods = (n_methods % 6) as usize + 1;
    let mut src = String::new();
    for i in 0..n_methods {
        src.push_str(&format!(
            "@external\ndef m{i}() -> uint256:\n    return {}\n\n",
            i + 1000
        ));
    }

    for optimize in [OptimizationLevel::Gas, OptimizationLevel::Codesize] {
        let data = compile_source(&src, settings(optimize)).unwrap();

        for i in 0..n_methods {
            let selector = method_id(&format!("m{i}()"));
            let outcome = Evm::new(data.bytecode_runtime.clone())
                .with_calldata(selector.to_be_bytes().to_vec())
                .run();
            match outcome {
                Outcome::Return(out)
                    if U256::from_big_endian(&out)
                        == U256::from(i as u64 + 1000) => {}
                _ => return false,
            }
        }

        // a selector outside the set reverts through the fallback
        let known: HashSet<u32> = (0..n_methods)
            .map(|i| method_id(&format!("m{i}()")))
            .collect();
        if !known.contains(&probe) {
            let outcome = Evm::new(data.bytecode_runtime.clone())
                .with_calldata(probe.to_be_bytes().to_vec())
                .run();
            if outcome != Outcome::Revert(vec![]) {
                return false;
            }
        }
    }
    true
}

// property 5: each dense bucket's inner image is a permutation
#[quickcheck]
fn dense_buckets_are_perfect(selectors: Vec<u32>) -> bool {
    let selectors: Vec<u32> = selectors
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .take(16)
        .collect();
    if selectors.is_empty() {
        return true;
    }
    let Ok((n_buckets, buckets)) = generate_dense_jumptable_info(&selectors)
    else {
        // no perfect hash found for this adversarial set; nothing to check
        return true;
    };
    if buckets.len() != n_buckets {
        return false;
    }
    buckets.values().all(|bucket| {
        let mut image = bucket.image();
        image.sort();
        image == (0..bucket.bucket_size()).collect::<Vec<_>>()
    })
}

// property 6: every tagged PC carries a valid node id
#[test]
fn pc_ast_map_coverage() {
    let data =
        compile_source(KITCHEN_SINK, settings(OptimizationLevel::Gas)).unwrap();
    let map = &data.runtime.source_map.pc_raw_ast_map;
    assert!(!map.is_empty());
    for (&pc, ast) in map {
        assert!(pc < data.bytecode_runtime.len());
        assert!(ast.node_id > 0);
    }
}

// property 7: source-map compression round-trips (end to end)
#[test]
fn source_map_round_trip() {
    let data =
        compile_source(KITCHEN_SINK, settings(OptimizationLevel::Gas)).unwrap();
    let entries = data.runtime.source_map.entries();
    assert_eq!(expand(&compress(&entries, 0)).unwrap(), entries);
}

// property 8: pushes take the minimal width
#[quickcheck]
fn push_width_minimality(value: u64, shift: u8) -> bool {
    let value = U256::from(value) << (shift % 192);
    let items = push_int(value, EvmVersion::Shanghai);
    let immediates = items.len() - 1;
    if value.is_zero() {
        // PUSH0 on shanghai
        immediates == 0
    } else {
        immediates == byte_length(value)
    }
}

// property 9: no surviving label's body is a lone jump to a removed label
#[test]
fn dead_code_safety() {
    let data =
        compile_source(KITCHEN_SINK, settings(OptimizationLevel::Gas)).unwrap();

    let defined: HashSet<&Label> = data
        .runtime_items
        .iter()
        .filter_map(|i| match i {
            AssemblyItem::Label(l) | AssemblyItem::DataHeader(l) => Some(l),
            _ => None,
        })
        .collect();

    for window in data.runtime_items.windows(3) {
        if let (
            AssemblyItem::Label(_),
            AssemblyItem::PushLabel(target),
            AssemblyItem::Op(op),
        ) = (&window[0], &window[1], &window[2])
        {
            if op == "JUMP" {
                assert!(
                    defined.contains(target),
                    "surviving label jumps to removed target {target}"
                );
            }
        }
    }
}
