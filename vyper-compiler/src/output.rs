//! Artifact builders: everything a caller can request from a compilation.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use vyper_asm::{compress, disassemble, render_assembly};

use crate::ast::{Module, VariableDecl, Visibility, VyType};
use crate::codegen::synthesize_getter;
use crate::error::CompileError;
use crate::phases::CompilerData;

/// The artifact kinds callers can request.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum OutputKind {
    /// Deploy bytecode as a hex string.
    Bytecode,
    /// Runtime bytecode as a hex string.
    BytecodeRuntime,
    /// ABI v2 JSON array.
    Abi,
    /// `signature -> 0x<8 hex>` map.
    MethodIdentifiers,
    /// Source map bundle for the runtime program.
    SourceMap,
    /// Persistent storage layout.
    StorageLayout,
    /// Transient storage layout.
    TransientStorageLayout,
    /// Code (immutables) layout.
    CodeLayout,
    /// Metadata dictionary (mirrors the CBOR trailer).
    Metadata,
    /// Integrity hash of the import closure.
    Integrity,
    /// Textual assembly of both programs.
    Asm,
    /// Disassembly of the deploy bytecode.
    Opcodes,
    /// Disassembly of the runtime bytecode.
    OpcodesRuntime,
}

/// Build one artifact.
pub fn build_output(
    data: &CompilerData,
    kind: OutputKind,
) -> Result<Value, CompileError> {
    Ok(match kind {
        OutputKind::Bytecode => {
            json!(format!("0x{}", hex::encode(&data.bytecode)))
        }
        OutputKind::BytecodeRuntime => {
            json!(format!("0x{}", hex::encode(&data.bytecode_runtime)))
        }
        OutputKind::Abi => build_abi(&data.module),
        OutputKind::MethodIdentifiers => json!(data.method_identifiers),
        OutputKind::SourceMap => build_source_map(data),
        OutputKind::StorageLayout => data
            .layout_export
            .get("storage_layout")
            .cloned()
            .unwrap_or_else(|| json!({})),
        OutputKind::TransientStorageLayout => data
            .layout_export
            .get("transient_storage_layout")
            .cloned()
            .unwrap_or_else(|| json!({})),
        OutputKind::CodeLayout => data
            .layout_export
            .get("code_layout")
            .cloned()
            .unwrap_or_else(|| json!({})),
        OutputKind::Metadata => data.metadata.to_json(),
        OutputKind::Integrity => json!(data.imports.integrity_sum),
        OutputKind::Asm => {
            let mut out = render_assembly(&data.deploy_items);
            out.push_str("\nruntime:\n");
            out.push_str(&render_assembly(&data.runtime_items));
            json!(out)
        }
        OutputKind::Opcodes => {
            json!(disassemble(&data.bytecode, data.settings.evm_version))
        }
        OutputKind::OpcodesRuntime => {
            json!(disassemble(
                &data.bytecode_runtime,
                data.settings.evm_version
            ))
        }
    })
}

/// Build the requested artifacts, keyed by output name.
pub fn build_outputs(
    data: &CompilerData,
    kinds: &[OutputKind],
) -> Result<BTreeMap<String, Value>, CompileError> {
    kinds
        .iter()
        .map(|&kind| Ok((kind.to_string(), build_output(data, kind)?)))
        .collect()
}

fn abi_io(name: &str, typ: &VyType) -> Value {
    json!({"name": name, "type": typ.abi_type()})
}

fn build_abi(module: &Module) -> Value {
    let mut abi = Vec::new();

    for event in module.events() {
        let inputs: Vec<Value> = event
            .args
            .iter()
            .map(|a| {
                json!({
                    "name": a.name,
                    "type": a.typ.abi_type(),
                    "indexed": a.indexed,
                })
            })
            .collect();
        abi.push(json!({
            "type": "event",
            "name": event.name,
            "inputs": inputs,
            "anonymous": false,
        }));
    }

    let getters: Vec<_> = module
        .variables()
        .filter(|v| v.is_public && v.is_state_variable())
        .map(|v: &VariableDecl| synthesize_getter(v))
        .collect();

    for def in module.functions().chain(getters.iter()) {
        if def.visibility != Visibility::External {
            continue;
        }
        if def.is_constructor() {
            abi.push(json!({
                "type": "constructor",
                "inputs": def
                    .args
                    .iter()
                    .map(|a| abi_io(&a.name, &a.typ))
                    .collect::<Vec<_>>(),
                "stateMutability": def.mutability.as_abi(),
            }));
            continue;
        }
        if def.is_fallback() {
            abi.push(json!({
                "type": "fallback",
                "stateMutability": def.mutability.as_abi(),
            }));
            continue;
        }
        let outputs: Vec<Value> = def
            .returns
            .iter()
            .map(|t| abi_io("", t))
            .collect();
        abi.push(json!({
            "type": "function",
            "name": def.name,
            "inputs": def
                .args
                .iter()
                .map(|a| abi_io(&a.name, &a.typ))
                .collect::<Vec<_>>(),
            "outputs": outputs,
            "stateMutability": def.mutability.as_abi(),
        }));
    }

    Value::Array(abi)
}

fn build_source_map(data: &CompilerData) -> Value {
    let source_map = &data.runtime.source_map;

    let pc_pos_map: BTreeMap<String, Value> = source_map
        .pc_pos_map()
        .into_iter()
        .map(|(pc, (start, length, source_id))| {
            (pc.to_string(), json!([start, length, source_id]))
        })
        .collect();

    let pc_jump_map: BTreeMap<String, Value> = source_map
        .pc_jump_map
        .iter()
        .map(|(pc, jump)| (pc.to_string(), json!(jump.as_str())))
        .collect();

    let pc_raw_ast_map: BTreeMap<String, Value> = source_map
        .pc_raw_ast_map
        .iter()
        .map(|(pc, ast)| (pc.to_string(), json!(ast.node_id)))
        .collect();

    let error_map: BTreeMap<String, Value> = source_map
        .error_map
        .iter()
        .map(|(pc, tag)| (pc.to_string(), json!(tag)))
        .collect();

    let compressed = compress(
        &source_map.entries(),
        data.module.source_id.max(0) as u32,
    );

    json!({
        "breakpoints": source_map.breakpoints,
        "pc_breakpoints": source_map.pc_breakpoints,
        "pc_pos_map": pc_pos_map,
        "pc_pos_map_compressed": compressed,
        "pc_jump_map": pc_jump_map,
        "pc_raw_ast_map": pc_raw_ast_map,
        "error_map": error_map,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use crate::util::{compile_source, parse_module};
    use strum::IntoEnumIterator;

    const SOURCE: &str = "\
total: public(uint256)

event Ping:
    value: uint256

@external
def __init__():
    pass

@external
@payable
def add(amount: uint256) -> uint256:
    self.total = self.total + amount
    return self.total
";

    #[test]
    fn abi_lists_events_functions_and_getters() {
        let module = parse_module(SOURCE, 0, "t.vy", "t.vy", false).unwrap();
        let abi = build_abi(&module);
        let entries = abi.as_array().unwrap();

        let types: Vec<&str> = entries
            .iter()
            .map(|e| e["type"].as_str().unwrap())
            .collect();
        assert_eq!(types, vec!["event", "constructor", "function", "function"]);

        let add = &entries[2];
        assert_eq!(add["name"], "add");
        assert_eq!(add["stateMutability"], "payable");
        assert_eq!(add["inputs"][0]["type"], "uint256");
        assert_eq!(add["outputs"][0]["type"], "uint256");

        // the public getter appears as a view function
        let getter = &entries[3];
        assert_eq!(getter["name"], "total");
        assert_eq!(getter["stateMutability"], "view");
    }

    #[test]
    fn every_output_kind_builds() {
        let data = compile_source(SOURCE, Settings::default()).unwrap();
        for kind in OutputKind::iter() {
            let value = build_output(&data, kind).unwrap();
            assert!(!value.is_null(), "{kind} produced null");
        }
    }

    #[test]
    fn output_names_are_snake_case() {
        assert_eq!(OutputKind::BytecodeRuntime.to_string(), "bytecode_runtime");
        assert_eq!(
            "method_identifiers".parse::<OutputKind>().unwrap(),
            OutputKind::MethodIdentifiers
        );
    }

    #[test]
    fn bytecode_outputs_are_hex() {
        let data = compile_source(SOURCE, Settings::default()).unwrap();
        let out = build_output(&data, OutputKind::Bytecode).unwrap();
        let s = out.as_str().unwrap();
        assert!(s.starts_with("0x"));
        assert!(hex::decode(&s[2..]).is_ok());
    }
}
