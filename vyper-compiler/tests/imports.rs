//! Import-graph behavior through the public pipeline: cycles, duplicates,
//! suffix search order, ABI interfaces and builtins.

use std::path::PathBuf;

use serde_json::json;

use vyper_compiler::input_bundle::JsonInputBundle;
use vyper_compiler::util::compile_with_bundle;
use vyper_compiler::{CompileError, Settings};

fn bundle(
    files: Vec<(&str, serde_json::Value)>,
) -> JsonInputBundle {
    JsonInputBundle::new(
        files
            .into_iter()
            .map(|(p, v)| (PathBuf::from(p), v)),
        vec![PathBuf::from("lib")],
    )
    .unwrap()
}

#[test]
fn import_cycle_is_detected() {
    let mut bundle = bundle(vec![
        ("lib/b.vy", json!({"content": "import c as c\n"})),
        ("lib/c.vy", json!({"content": "import b as b\n"})),
    ]);
    let err = compile_with_bundle(
        "import b as b\n@external\ndef f():\n    pass\n",
        Settings::default(),
        &mut bundle,
    )
    .unwrap_err();
    assert!(matches!(err, CompileError::ImportCycle(_)), "{err}");
    assert!(err.to_string().contains("imports"));
}

#[test]
fn duplicate_import_is_detected() {
    let mut bundle = bundle(vec![(
        "lib/b.vy",
        json!({"content": "x: uint256\n"}),
    )]);
    let err = compile_with_bundle(
        "import b as b1\nimport b as b2\n@external\ndef f():\n    pass\n",
        Settings::default(),
        &mut bundle,
    )
    .unwrap_err();
    assert!(matches!(err, CompileError::DuplicateImport(_)), "{err}");
}

#[test]
fn missing_module_is_reported() {
    let mut bundle = bundle(vec![]);
    let err = compile_with_bundle(
        "import nothing as n\n@external\ndef f():\n    pass\n",
        Settings::default(),
        &mut bundle,
    )
    .unwrap_err();
    assert!(matches!(err, CompileError::ModuleNotFound(_)), "{err}");
}

#[test]
fn plain_dotted_import_requires_alias() {
    let mut bundle = bundle(vec![(
        "lib/a/b.vy",
        json!({"content": "x: uint256\n"}),
    )]);
    let err = compile_with_bundle(
        "import a.b\n@external\ndef f():\n    pass\n",
        Settings::default(),
        &mut bundle,
    )
    .unwrap_err();
    assert!(err.to_string().contains("`as`"), "{err}");
}

#[test]
fn json_abi_interfaces_resolve() {
    let abi = json!({"abi": [
        {"type": "function", "name": "f", "inputs": [], "outputs": []}
    ]});
    let mut bundle = bundle(vec![("lib/iface.json", abi)]);
    let data = compile_with_bundle(
        "import iface as iface\n@external\ndef f():\n    pass\n",
        Settings::default(),
        &mut bundle,
    )
    .unwrap();
    assert_eq!(data.imports.compiler_inputs.len(), 1);
}

#[test]
fn vy_is_preferred_over_json() {
    let mut bundle = bundle(vec![
        ("lib/m.vy", json!({"content": "x: uint256\n"})),
        ("lib/m.json", json!({"abi": []})),
    ]);
    let data = compile_with_bundle(
        "import m as m\n@external\ndef f():\n    pass\n",
        Settings::default(),
        &mut bundle,
    )
    .unwrap();
    let input = &data.imports.compiler_inputs[0];
    assert_eq!(
        input.path().extension().and_then(|s| s.to_str()),
        Some("vy")
    );
}

#[test]
fn builtin_interfaces_resolve_without_search_paths() {
    let mut bundle = bundle(vec![]);
    let data = compile_with_bundle(
        "from ethereum.ercs import IERC20\n@external\ndef f():\n    pass\n",
        Settings::default(),
        &mut bundle,
    )
    .unwrap();
    let input = &data.imports.compiler_inputs[0];
    assert!(input.source_id() == vyper_compiler::input_bundle::BUILTIN);
}

#[test]
fn builtin_miss_hints_at_renamed_interfaces() {
    let mut bundle = bundle(vec![]);
    let err = compile_with_bundle(
        "from ethereum.ercs import ERC20\n@external\ndef f():\n    pass\n",
        Settings::default(),
        &mut bundle,
    )
    .unwrap_err();
    assert!(err.to_string().contains("IERC20"), "{err}");
}

#[test]
fn integrity_sum_covers_transitive_sources() {
    let mk = |c_body: &str| {
        let mut bundle = bundle(vec![
            ("lib/b.vy", json!({"content": "import c as c\n"})),
            ("lib/c.vy", json!({"content": c_body})),
        ]);
        compile_with_bundle(
            "import b as b\n@external\ndef f():\n    pass\n",
            Settings::default(),
            &mut bundle,
        )
        .unwrap()
        .imports
        .integrity_sum
    };

    // changing a leaf module two imports away changes the sum
    assert_ne!(mk("y: uint256\n"), mk("z: uint256\n"));
    // and equal inputs give equal sums
    assert_eq!(mk("y: uint256\n"), mk("y: uint256\n"));
}
