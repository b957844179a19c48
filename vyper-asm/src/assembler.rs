//! Two-pass assembler: pass 1 resolves compile-time constants and label
//! addresses while building the source map, pass 2 emits bytes.

use std::collections::BTreeMap;

use ethereum_types::U256;

use crate::error::AsmError;
use crate::item::{
    byte_length, AssemblyItem, ConstOperand, DataItem, Label, SymbolRef,
};
use crate::opcode::{immediate_len, mnemonic_for, opcode_info, EvmVersion, PUSH_OFFSET};
use crate::source_map::{JumpType, SourceMap};

/// Width in bytes of a code symbol (`PUSH2` operand).
pub const SYMBOL_SIZE: usize = 2;

/// The sentinel label recording the total code length.
pub const CODE_END: &str = "code_end";

/// Resolved addresses of labels and values of named constants.
#[derive(Debug, Clone, Default)]
pub struct SymbolMap {
    labels: BTreeMap<Label, usize>,
    constants: BTreeMap<String, U256>,
}

impl SymbolMap {
    /// Address of a label, if defined.
    pub fn label(&self, label: &Label) -> Option<usize> {
        self.labels.get(label).copied()
    }

    /// Value of a named constant, if resolved.
    pub fn constant(&self, name: &str) -> Option<U256> {
        self.constants.get(name).copied()
    }

    /// All labels in name order.
    pub fn labels(&self) -> impl Iterator<Item = (&Label, usize)> {
        self.labels.iter().map(|(l, &pc)| (l, pc))
    }

    fn insert_label(&mut self, label: Label, pc: usize) -> Result<(), AsmError> {
        if self.labels.contains_key(&label) {
            return Err(AsmError::DuplicateLabel(label));
        }
        self.labels.insert(label, pc);
        Ok(())
    }

    fn insert_constant(&mut self, name: String, value: U256) -> Result<(), AsmError> {
        if self.constants.contains_key(&name) {
            return Err(AsmError::DuplicateConst(name));
        }
        self.constants.insert(name, value);
        Ok(())
    }
}

/// Result of assembling one program.
#[derive(Debug, Clone)]
pub struct AssembledProgram {
    /// The final byte sequence.
    pub bytecode: Vec<u8>,
    /// Label addresses and constant values.
    pub symbol_map: SymbolMap,
    /// PC-indexed provenance.
    pub source_map: SourceMap,
}

/// Size in bytes of the minimal `PUSH` for `value` (instruction byte plus
/// immediates). Zero is a bare `PUSH0` from shanghai, `PUSH1 00` before.
pub fn push_width(value: U256, version: EvmVersion) -> usize {
    let n = byte_length(value);
    if n == 0 {
        if version.since(EvmVersion::Shanghai) {
            1
        } else {
            2
        }
    } else {
        1 + n
    }
}

fn push_bytes(value: U256, version: EvmVersion) -> Vec<u8> {
    let n = byte_length(value);
    if n == 0 && version.since(EvmVersion::Shanghai) {
        return vec![PUSH_OFFSET];
    }
    let n = n.max(1);
    let mut out = Vec::with_capacity(n + 1);
    out.push(PUSH_OFFSET + n as u8);
    let mut be = [0u8; 32];
    value.to_big_endian(&mut be);
    out.extend_from_slice(&be[32 - n..]);
    out
}

fn push_symbol_bytes(value: usize, what: &Label) -> Result<Vec<u8>, AsmError> {
    if value >> (SYMBOL_SIZE * 8) != 0 {
        return Err(AsmError::SymbolOverflow {
            label: what.clone(),
            value: value as u64,
        });
    }
    Ok(vec![
        PUSH_OFFSET + SYMBOL_SIZE as u8,
        (value >> 8) as u8,
        (value & 0xFF) as u8,
    ])
}

fn resolve_operand(op: &ConstOperand, symbols: &SymbolMap) -> Option<U256> {
    match op {
        ConstOperand::Value(v) => Some(*v),
        ConstOperand::Name(name) => symbols.constant(name),
    }
}

// Fold CONST declarations, then run CONST_ADD/CONST_MAX to fixpoint. The
// fixpoint is necessary because const ops may reference each other in any
// order.
fn resolve_constants(
    items: &[AssemblyItem],
    symbols: &mut SymbolMap,
) -> Result<(), AsmError> {
    for item in items {
        if let AssemblyItem::Const { name, value } = item {
            symbols.insert_constant(name.clone(), *value)?;
        }
    }

    loop {
        let mut changed = false;
        for item in items {
            let (name, op1, op2, is_max) = match item {
                AssemblyItem::ConstAdd { name, op1, op2 } => (name, op1, op2, false),
                AssemblyItem::ConstMax { name, op1, op2 } => (name, op1, op2, true),
                _ => continue,
            };
            if symbols.constant(name).is_some() {
                continue;
            }
            if let (Some(a), Some(b)) = (
                resolve_operand(op1, symbols),
                resolve_operand(op2, symbols),
            ) {
                let value = if is_max {
                    a.max(b)
                } else {
                    a.overflowing_add(b).0
                };
                symbols.insert_constant(name.clone(), value)?;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    Ok(())
}

/// Pass 1: build the symbol map and source map without emitting bytes.
pub fn resolve_symbols(
    items: &[AssemblyItem],
    version: EvmVersion,
) -> Result<(SymbolMap, SourceMap), AsmError> {
    let mut symbols = SymbolMap::default();
    let mut source_map = SourceMap::default();
    source_map.pc_jump_map.insert(0, JumpType::Regular);

    resolve_constants(items, &mut symbols)?;

    let mut pc: usize = 0;
    for (i, item) in items.iter().enumerate() {
        // classify jumps for the debugger map
        match item.mnemonic() {
            Some("JUMP") => {
                let class = match i.checked_sub(1).map(|j| &items[j]) {
                    Some(AssemblyItem::PushLabel(l))
                        if l.as_str().starts_with("internal") =>
                    {
                        if l.as_str().ends_with("cleanup") {
                            JumpType::Out
                        } else {
                            JumpType::In
                        }
                    }
                    _ => JumpType::Regular,
                };
                source_map.pc_jump_map.insert(pc, class);
            }
            Some("JUMPI") | Some("JUMPDEST") => {
                source_map.pc_jump_map.insert(pc, JumpType::Regular);
            }
            _ => {}
        }

        if let AssemblyItem::Tagged { src, error_msg, .. } = item {
            if let Some(src) = src {
                source_map.pc_raw_ast_map.insert(pc, *src);
            }
            if let Some(msg) = error_msg {
                source_map.error_map.insert(pc, msg.clone());
            }
        }

        match item {
            AssemblyItem::Op(_) | AssemblyItem::Tagged { .. } => pc += 1,
            AssemblyItem::Immediate(_) => pc += 1,
            AssemblyItem::Label(label) => {
                symbols.insert_label(label.clone(), pc)?;
                source_map.pc_jump_map.insert(pc, JumpType::Regular);
                pc += 1; // JUMPDEST
            }
            AssemblyItem::DataHeader(label) => {
                // the header itself emits nothing
                symbols.insert_label(label.clone(), pc)?;
            }
            AssemblyItem::PushLabel(_) => pc += SYMBOL_SIZE + 1,
            AssemblyItem::PushOffset(SymbolRef::Label(_), _) => {
                pc += SYMBOL_SIZE + 1
            }
            AssemblyItem::PushOffset(SymbolRef::Const(name), ofst) => {
                let base = symbols
                    .constant(name)
                    .ok_or_else(|| AsmError::UndefinedConst(name.clone()))?;
                pc += push_width(base.overflowing_add(*ofst).0, version);
            }
            AssemblyItem::ConstRef(name) => {
                let value = symbols
                    .constant(name)
                    .ok_or_else(|| AsmError::UndefinedConst(name.clone()))?;
                pc += push_width(value, version);
            }
            AssemblyItem::Const { .. }
            | AssemblyItem::ConstAdd { .. }
            | AssemblyItem::ConstMax { .. } => {}
            AssemblyItem::Data(DataItem::Bytes(bytes)) => pc += bytes.len(),
            AssemblyItem::Data(DataItem::Label(_)) => pc += SYMBOL_SIZE,
        }
    }

    symbols.insert_label(Label::new(CODE_END), pc)?;

    Ok((symbols, source_map))
}

/// Assemble a full program: resolve symbols, then emit the byte sequence.
pub fn assemble(
    items: &[AssemblyItem],
    version: EvmVersion,
) -> Result<AssembledProgram, AsmError> {
    let (symbol_map, source_map) = resolve_symbols(items, version)?;
    let bytecode = emit(items, &symbol_map, version)?;

    let expected = symbol_map
        .label(&Label::new(CODE_END))
        .expect("code_end recorded in pass 1");
    debug_assert_eq!(bytecode.len(), expected);

    Ok(AssembledProgram {
        bytecode,
        symbol_map,
        source_map,
    })
}

fn opcode_byte(mnemonic: &str, version: EvmVersion) -> Result<u8, AsmError> {
    match opcode_info(mnemonic, version) {
        Some(info) => Ok(info.byte),
        None => {
            // distinguish gating from typos for a more useful panic message
            if opcode_info(mnemonic, EvmVersion::Cancun).is_some() {
                Err(AsmError::OpcodeNotAvailable {
                    mnemonic: mnemonic.to_string(),
                    version,
                })
            } else {
                Err(AsmError::UnknownOpcode(mnemonic.to_string()))
            }
        }
    }
}

fn lookup_label(symbols: &SymbolMap, label: &Label) -> Result<usize, AsmError> {
    symbols
        .label(label)
        .ok_or_else(|| AsmError::UndefinedLabel(label.clone()))
}

fn emit(
    items: &[AssemblyItem],
    symbols: &SymbolMap,
    version: EvmVersion,
) -> Result<Vec<u8>, AsmError> {
    let mut out = Vec::new();

    for item in items {
        match item {
            AssemblyItem::Op(op) | AssemblyItem::Tagged { op, .. } => {
                out.push(opcode_byte(op, version)?);
            }
            AssemblyItem::Immediate(b) => out.push(*b),
            AssemblyItem::Label(_) => {
                out.push(opcode_byte("JUMPDEST", version)?);
            }
            AssemblyItem::PushLabel(label) => {
                let pc = lookup_label(symbols, label)?;
                out.extend(push_symbol_bytes(pc, label)?);
            }
            AssemblyItem::PushOffset(SymbolRef::Label(label), ofst) => {
                let pc = lookup_label(symbols, label)?;
                let value = pc + ofst.as_usize();
                out.extend(push_symbol_bytes(value, label)?);
            }
            AssemblyItem::PushOffset(SymbolRef::Const(name), ofst) => {
                let base = symbols
                    .constant(name)
                    .ok_or_else(|| AsmError::UndefinedConst(name.clone()))?;
                out.extend(push_bytes(base.overflowing_add(*ofst).0, version));
            }
            AssemblyItem::ConstRef(name) => {
                let value = symbols
                    .constant(name)
                    .ok_or_else(|| AsmError::UndefinedConst(name.clone()))?;
                out.extend(push_bytes(value, version));
            }
            AssemblyItem::Const { .. }
            | AssemblyItem::ConstAdd { .. }
            | AssemblyItem::ConstMax { .. }
            | AssemblyItem::DataHeader(_) => {}
            AssemblyItem::Data(DataItem::Bytes(bytes)) => {
                out.extend_from_slice(bytes);
            }
            AssemblyItem::Data(DataItem::Label(label)) => {
                let pc = lookup_label(symbols, label)?;
                if pc >> (SYMBOL_SIZE * 8) != 0 {
                    return Err(AsmError::SymbolOverflow {
                        label: label.clone(),
                        value: pc as u64,
                    });
                }
                out.push((pc >> 8) as u8);
                out.push((pc & 0xFF) as u8);
            }
        }
    }

    Ok(out)
}

/// Predicted byte length of every data section, in emission order.
pub fn data_segment_lengths(items: &[AssemblyItem]) -> Vec<usize> {
    let mut ret: Vec<usize> = Vec::new();
    for item in items {
        match item {
            AssemblyItem::DataHeader(_) => ret.push(0),
            AssemblyItem::Data(data) => {
                if let Some(last) = ret.last_mut() {
                    *last += match data {
                        DataItem::Bytes(bytes) => bytes.len(),
                        DataItem::Label(_) => SYMBOL_SIZE,
                    };
                }
            }
            _ => {}
        }
    }
    ret
}

/// Render the symbolic assembly as text, one item per line with PUSH
/// immediates kept inline.
pub fn render_assembly(items: &[AssemblyItem]) -> String {
    let mut out = String::new();
    let mut inline_budget = 0usize;
    for item in items {
        out.push_str(&item.to_string());
        out.push(' ');

        if inline_budget > 0 {
            inline_budget -= 1;
        } else if let Some(op) = item.mnemonic() {
            if let Some(rest) = op.strip_prefix("PUSH") {
                inline_budget = rest.parse().unwrap_or(0);
            }
        }
        if inline_budget == 0 {
            out.push('\n');
        }
    }
    out
}

/// Space-separated disassembly of raw bytecode. PUSH immediates are
/// rendered as a single hex literal; bytes with no mnemonic under the
/// active ruleset (data sections, metadata) appear as raw hex.
pub fn disassemble(bytecode: &[u8], version: EvmVersion) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut i = 0;
    while i < bytecode.len() {
        let byte = bytecode[i];
        i += 1;
        match mnemonic_for(byte, version) {
            Some(name) => {
                out.push(name.to_string());
                let imm = immediate_len(byte).min(bytecode.len() - i);
                if imm > 0 {
                    out.push(format!(
                        "0x{}",
                        hex::encode_upper(&bytecode[i..i + imm])
                    ));
                    i += imm;
                }
            }
            None => out.push(format!("0x{byte:02X}")),
        }
    }
    out.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::push_int;

    const SHANGHAI: EvmVersion = EvmVersion::Shanghai;

    fn simple_program() -> Vec<AssemblyItem> {
        // entry: PUSH1 2a; PUSHLABEL end; JUMP; LABEL mid; POP; LABEL end; STOP
        let mut items = push_int(U256::from(0x2a), SHANGHAI);
        items.push(AssemblyItem::PushLabel(Label::new("end")));
        items.push(AssemblyItem::op("JUMP"));
        items.push(AssemblyItem::Label(Label::new("mid")));
        items.push(AssemblyItem::op("POP"));
        items.push(AssemblyItem::Label(Label::new("end")));
        items.push(AssemblyItem::op("STOP"));
        items
    }

    #[test]
    fn resolves_forward_references() {
        let program = simple_program();
        let assembled = assemble(&program, SHANGHAI).unwrap();
        // PUSH1 2a = 2 bytes, PUSH2 = 3 bytes, JUMP = 1 -> mid at 6, end at 8
        let symbols = &assembled.symbol_map;
        assert_eq!(symbols.label(&Label::new("mid")), Some(6));
        assert_eq!(symbols.label(&Label::new("end")), Some(8));
        assert_eq!(symbols.label(&Label::new(CODE_END)), Some(10));
        assert_eq!(
            assembled.bytecode,
            vec![0x60, 0x2a, 0x61, 0x00, 0x08, 0x56, 0x5B, 0x50, 0x5B, 0x00]
        );
    }

    #[test]
    fn duplicate_label_is_an_error() {
        let items = vec![
            AssemblyItem::Label(Label::new("a")),
            AssemblyItem::Label(Label::new("a")),
        ];
        assert_eq!(
            resolve_symbols(&items, SHANGHAI).unwrap_err(),
            AsmError::DuplicateLabel(Label::new("a"))
        );
    }

    #[test]
    fn const_arithmetic_fixpoint() {
        let items = vec![
            // declared out of dependency order on purpose
            AssemblyItem::ConstAdd {
                name: "total".into(),
                op1: ConstOperand::Name("frame".into()),
                op2: ConstOperand::Value(U256::from(32)),
            },
            AssemblyItem::ConstMax {
                name: "frame".into(),
                op1: ConstOperand::Name("base".into()),
                op2: ConstOperand::Value(U256::from(96)),
            },
            AssemblyItem::Const {
                name: "base".into(),
                value: U256::from(64),
            },
            AssemblyItem::ConstRef("total".into()),
            AssemblyItem::op("STOP"),
        ];
        let assembled = assemble(&items, SHANGHAI).unwrap();
        assert_eq!(
            assembled.symbol_map.constant("total"),
            Some(U256::from(128))
        );
        assert_eq!(assembled.bytecode, vec![0x60, 0x80, 0x00]);
    }

    #[test]
    fn jump_classification() {
        let items = vec![
            AssemblyItem::PushLabel(Label::new("internal_foo")),
            AssemblyItem::op("JUMP"),
            AssemblyItem::PushLabel(Label::new("internal_foo_cleanup")),
            AssemblyItem::op("JUMP"),
            AssemblyItem::PushLabel(Label::new("other")),
            AssemblyItem::op("JUMP"),
            AssemblyItem::Label(Label::new("internal_foo")),
            AssemblyItem::Label(Label::new("internal_foo_cleanup")),
            AssemblyItem::Label(Label::new("other")),
        ];
        let (_, source_map) = resolve_symbols(&items, SHANGHAI).unwrap();
        assert_eq!(source_map.pc_jump_map.get(&3), Some(&JumpType::In));
        assert_eq!(source_map.pc_jump_map.get(&7), Some(&JumpType::Out));
        assert_eq!(source_map.pc_jump_map.get(&11), Some(&JumpType::Regular));
    }

    #[test]
    fn data_sections_and_lengths() {
        let items = vec![
            AssemblyItem::op("STOP"),
            AssemblyItem::DataHeader(Label::new("runtime")),
            AssemblyItem::Data(DataItem::Bytes(vec![1, 2, 3])),
            AssemblyItem::Data(DataItem::Label(Label::new("runtime"))),
            AssemblyItem::DataHeader(Label::new("table")),
            AssemblyItem::Data(DataItem::Bytes(vec![9])),
        ];
        assert_eq!(data_segment_lengths(&items), vec![5, 1]);

        let assembled = assemble(&items, SHANGHAI).unwrap();
        // data section starts right after STOP
        assert_eq!(assembled.symbol_map.label(&Label::new("runtime")), Some(1));
        assert_eq!(assembled.bytecode, vec![0x00, 1, 2, 3, 0x00, 0x01, 9]);
    }

    #[test]
    fn gated_opcode_rejected() {
        let items = vec![AssemblyItem::op("TLOAD")];
        assert!(matches!(
            assemble(&items, SHANGHAI).unwrap_err(),
            AsmError::OpcodeNotAvailable { .. }
        ));
        assert!(assemble(&items, EvmVersion::Cancun).is_ok());
    }

    #[test]
    fn disassembly_round_trip_text() {
        let assembled = assemble(&simple_program(), SHANGHAI).unwrap();
        let text = disassemble(&assembled.bytecode, SHANGHAI);
        assert_eq!(
            text,
            "PUSH1 0x2A PUSH2 0x0008 JUMP JUMPDEST POP JUMPDEST STOP"
        );
    }
}
