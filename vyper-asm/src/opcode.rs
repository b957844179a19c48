//! The static EVM opcode table and fork gating rules.
//!
//! Fork rules go from oldest (lowest value) to newest (highest value). The
//! discriminants are an internal ordering device only; they are not part of
//! the public API and must not be persisted anywhere.

use core::fmt;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Base byte of the `PUSH0`..`PUSH32` family.
pub const PUSH_OFFSET: u8 = 0x5F;
/// Base byte of the `DUP1`..`DUP16` family.
pub const DUP_OFFSET: u8 = 0x7F;
/// Base byte of the `SWAP1`..`SWAP16` family.
pub const SWAP_OFFSET: u8 = 0x8F;

/// Supported mainnet fork rulesets, oldest first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::EnumIter,
)]
#[repr(u8)]
pub enum EvmVersion {
    /// London hard fork (EIP-1559, `BASEFEE`).
    London = 0,
    /// Paris a.k.a. the merge (`PREVRANDAO`).
    Paris = 1,
    /// Shanghai hard fork (EIP-3855, `PUSH0`).
    Shanghai = 2,
    /// Cancun hard fork (EIP-1153 transient storage, EIP-5656 `MCOPY`).
    Cancun = 3,
}

impl EvmVersion {
    /// The ruleset used when no `pragma evm-version` is present.
    pub const DEFAULT: EvmVersion = EvmVersion::Shanghai;

    /// Whether this ruleset includes the rules introduced at `fork`.
    pub const fn since(self, fork: EvmVersion) -> bool {
        self as u8 >= fork as u8
    }

    /// Parse a fork name as written in the `evm-version` pragma.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "london" => Some(Self::London),
            "paris" => Some(Self::Paris),
            "shanghai" => Some(Self::Shanghai),
            "cancun" => Some(Self::Cancun),
            _ => None,
        }
    }

    /// The pragma-facing name of the fork.
    pub const fn name(self) -> &'static str {
        match self {
            Self::London => "london",
            Self::Paris => "paris",
            Self::Shanghai => "shanghai",
            Self::Cancun => "cancun",
        }
    }
}

impl fmt::Display for EvmVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Gas cost of an opcode, possibly fork-dependent.
///
/// `ByVersion` entries are indexed by [`EvmVersion`] discriminant; `None`
/// means the opcode does not exist in that ruleset.
#[derive(Debug, Clone, Copy)]
enum Gas {
    Fixed(u64),
    ByVersion([Option<u64>; 4]),
}

impl Gas {
    fn for_version(&self, version: EvmVersion) -> Option<u64> {
        match self {
            Gas::Fixed(g) => Some(*g),
            Gas::ByVersion(by) => by[version as usize],
        }
    }
}

/// A resolved opcode table entry: byte value, stack effect and gas cost
/// under a specific fork ruleset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeInfo {
    /// The opcode byte as it appears in bytecode.
    pub byte: u8,
    /// Number of stack items removed.
    pub pops: u8,
    /// Number of stack items added.
    pub pushes: u8,
    /// Base gas cost under the active ruleset.
    pub gas: u64,
}

// opcode byte, pops, pushes, gas (fixed, or per fork ruleset)
#[rustfmt::skip]
static OPCODES: &[(&str, u8, u8, u8, Gas)] = &[
    ("STOP",           0x00, 0, 0, Gas::Fixed(0)),
    ("ADD",            0x01, 2, 1, Gas::Fixed(3)),
    ("MUL",            0x02, 2, 1, Gas::Fixed(5)),
    ("SUB",            0x03, 2, 1, Gas::Fixed(3)),
    ("DIV",            0x04, 2, 1, Gas::Fixed(5)),
    ("SDIV",           0x05, 2, 1, Gas::Fixed(5)),
    ("MOD",            0x06, 2, 1, Gas::Fixed(5)),
    ("SMOD",           0x07, 2, 1, Gas::Fixed(5)),
    ("ADDMOD",         0x08, 3, 1, Gas::Fixed(8)),
    ("MULMOD",         0x09, 3, 1, Gas::Fixed(8)),
    ("EXP",            0x0A, 2, 1, Gas::Fixed(10)),
    ("SIGNEXTEND",     0x0B, 2, 1, Gas::Fixed(5)),
    ("LT",             0x10, 2, 1, Gas::Fixed(3)),
    ("GT",             0x11, 2, 1, Gas::Fixed(3)),
    ("SLT",            0x12, 2, 1, Gas::Fixed(3)),
    ("SGT",            0x13, 2, 1, Gas::Fixed(3)),
    ("EQ",             0x14, 2, 1, Gas::Fixed(3)),
    ("ISZERO",         0x15, 1, 1, Gas::Fixed(3)),
    ("AND",            0x16, 2, 1, Gas::Fixed(3)),
    ("OR",             0x17, 2, 1, Gas::Fixed(3)),
    ("XOR",            0x18, 2, 1, Gas::Fixed(3)),
    ("NOT",            0x19, 1, 1, Gas::Fixed(3)),
    ("BYTE",           0x1A, 2, 1, Gas::Fixed(3)),
    ("SHL",            0x1B, 2, 1, Gas::Fixed(3)),
    ("SHR",            0x1C, 2, 1, Gas::Fixed(3)),
    ("SAR",            0x1D, 2, 1, Gas::Fixed(3)),
    ("SHA3",           0x20, 2, 1, Gas::Fixed(30)),
    ("ADDRESS",        0x30, 0, 1, Gas::Fixed(2)),
    ("BALANCE",        0x31, 1, 1, Gas::Fixed(700)),
    ("ORIGIN",         0x32, 0, 1, Gas::Fixed(2)),
    ("CALLER",         0x33, 0, 1, Gas::Fixed(2)),
    ("CALLVALUE",      0x34, 0, 1, Gas::Fixed(2)),
    ("CALLDATALOAD",   0x35, 1, 1, Gas::Fixed(3)),
    ("CALLDATASIZE",   0x36, 0, 1, Gas::Fixed(2)),
    ("CALLDATACOPY",   0x37, 3, 0, Gas::Fixed(3)),
    ("CODESIZE",       0x38, 0, 1, Gas::Fixed(2)),
    ("CODECOPY",       0x39, 3, 0, Gas::Fixed(3)),
    ("GASPRICE",       0x3A, 0, 1, Gas::Fixed(2)),
    ("EXTCODESIZE",    0x3B, 1, 1, Gas::Fixed(2600)),
    ("EXTCODECOPY",    0x3C, 4, 0, Gas::Fixed(2600)),
    ("RETURNDATASIZE", 0x3D, 0, 1, Gas::Fixed(2)),
    ("RETURNDATACOPY", 0x3E, 3, 0, Gas::Fixed(3)),
    ("EXTCODEHASH",    0x3F, 1, 1, Gas::Fixed(2600)),
    ("BLOCKHASH",      0x40, 1, 1, Gas::Fixed(20)),
    ("COINBASE",       0x41, 0, 1, Gas::Fixed(2)),
    ("TIMESTAMP",      0x42, 0, 1, Gas::Fixed(2)),
    ("NUMBER",         0x43, 0, 1, Gas::Fixed(2)),
    ("DIFFICULTY",     0x44, 0, 1, Gas::Fixed(2)),
    ("PREVRANDAO",     0x44, 0, 1, Gas::Fixed(2)),
    ("GASLIMIT",       0x45, 0, 1, Gas::Fixed(2)),
    ("CHAINID",        0x46, 0, 1, Gas::Fixed(2)),
    ("SELFBALANCE",    0x47, 0, 1, Gas::Fixed(5)),
    ("BASEFEE",        0x48, 0, 1, Gas::Fixed(2)),
    ("POP",            0x50, 1, 0, Gas::Fixed(2)),
    ("MLOAD",          0x51, 1, 1, Gas::Fixed(3)),
    ("MSTORE",         0x52, 2, 0, Gas::Fixed(3)),
    ("MSTORE8",        0x53, 2, 0, Gas::Fixed(3)),
    ("SLOAD",          0x54, 1, 1, Gas::Fixed(2100)),
    ("SSTORE",         0x55, 2, 0, Gas::Fixed(20000)),
    ("JUMP",           0x56, 1, 0, Gas::Fixed(8)),
    ("JUMPI",          0x57, 2, 0, Gas::Fixed(10)),
    ("PC",             0x58, 0, 1, Gas::Fixed(2)),
    ("MSIZE",          0x59, 0, 1, Gas::Fixed(2)),
    ("GAS",            0x5A, 0, 1, Gas::Fixed(2)),
    ("JUMPDEST",       0x5B, 0, 0, Gas::Fixed(1)),
    ("TLOAD",          0x5C, 1, 1, Gas::ByVersion([None, None, None, Some(100)])),
    ("TSTORE",         0x5D, 2, 0, Gas::ByVersion([None, None, None, Some(100)])),
    ("MCOPY",          0x5E, 3, 0, Gas::ByVersion([None, None, None, Some(3)])),
    ("PUSH0",          0x5F, 0, 1, Gas::ByVersion([None, None, Some(2), Some(2)])),
    ("LOG0",           0xA0, 2, 0, Gas::Fixed(375)),
    ("LOG1",           0xA1, 3, 0, Gas::Fixed(750)),
    ("LOG2",           0xA2, 4, 0, Gas::Fixed(1125)),
    ("LOG3",           0xA3, 5, 0, Gas::Fixed(1500)),
    ("LOG4",           0xA4, 6, 0, Gas::Fixed(1875)),
    ("CREATE",         0xF0, 3, 1, Gas::Fixed(32000)),
    ("CALL",           0xF1, 7, 1, Gas::Fixed(2100)),
    ("CALLCODE",       0xF2, 7, 1, Gas::Fixed(2100)),
    ("RETURN",         0xF3, 2, 0, Gas::Fixed(0)),
    ("DELEGATECALL",   0xF4, 6, 1, Gas::Fixed(2100)),
    ("CREATE2",        0xF5, 4, 1, Gas::Fixed(32000)),
    ("STATICCALL",     0xFA, 6, 1, Gas::Fixed(2100)),
    ("REVERT",         0xFD, 2, 0, Gas::Fixed(0)),
    ("INVALID",        0xFE, 0, 0, Gas::Fixed(0)),
    ("SELFDESTRUCT",   0xFF, 1, 0, Gas::Fixed(25000)),
];

const PUSH_NAMES: [&str; 32] = [
    "PUSH1", "PUSH2", "PUSH3", "PUSH4", "PUSH5", "PUSH6", "PUSH7", "PUSH8",
    "PUSH9", "PUSH10", "PUSH11", "PUSH12", "PUSH13", "PUSH14", "PUSH15",
    "PUSH16", "PUSH17", "PUSH18", "PUSH19", "PUSH20", "PUSH21", "PUSH22",
    "PUSH23", "PUSH24", "PUSH25", "PUSH26", "PUSH27", "PUSH28", "PUSH29",
    "PUSH30", "PUSH31", "PUSH32",
];

const DUP_NAMES: [&str; 16] = [
    "DUP1", "DUP2", "DUP3", "DUP4", "DUP5", "DUP6", "DUP7", "DUP8", "DUP9",
    "DUP10", "DUP11", "DUP12", "DUP13", "DUP14", "DUP15", "DUP16",
];

const SWAP_NAMES: [&str; 16] = [
    "SWAP1", "SWAP2", "SWAP3", "SWAP4", "SWAP5", "SWAP6", "SWAP7", "SWAP8",
    "SWAP9", "SWAP10", "SWAP11", "SWAP12", "SWAP13", "SWAP14", "SWAP15",
    "SWAP16",
];

fn base_table() -> &'static HashMap<&'static str, (u8, u8, u8, Gas)> {
    static TABLE: OnceLock<HashMap<&'static str, (u8, u8, u8, Gas)>> =
        OnceLock::new();
    TABLE.get_or_init(|| {
        OPCODES
            .iter()
            .map(|&(name, byte, pops, pushes, gas)| {
                (name, (byte, pops, pushes, gas))
            })
            .collect()
    })
}

/// Look up an opcode by mnemonic under the given fork ruleset.
///
/// Returns `None` both for unknown mnemonics and for opcodes that do not
/// exist in the ruleset (e.g. `PUSH0` before shanghai). The `PUSHk`,
/// `DUPk` and `SWAPk` families resolve without dedicated table entries.
pub fn opcode_info(mnemonic: &str, version: EvmVersion) -> Option<OpcodeInfo> {
    if let Some(&(byte, pops, pushes, gas)) = base_table().get(mnemonic) {
        let gas = gas.for_version(version)?;
        return Some(OpcodeInfo {
            byte,
            pops,
            pushes,
            gas,
        });
    }

    if let Some(n) = family_index(mnemonic, "PUSH", 32) {
        return Some(OpcodeInfo {
            byte: PUSH_OFFSET + n,
            pops: 0,
            pushes: 1,
            gas: 3,
        });
    }
    if let Some(n) = family_index(mnemonic, "DUP", 16) {
        return Some(OpcodeInfo {
            byte: DUP_OFFSET + n,
            pops: n,
            pushes: n + 1,
            gas: 3,
        });
    }
    if let Some(n) = family_index(mnemonic, "SWAP", 16) {
        return Some(OpcodeInfo {
            byte: SWAP_OFFSET + n,
            pops: n + 1,
            pushes: n + 1,
            gas: 3,
        });
    }

    None
}

// parses e.g. "PUSH7" -> Some(7), rejecting 0 and anything above `max`
fn family_index(mnemonic: &str, prefix: &str, max: u8) -> Option<u8> {
    let suffix = mnemonic.strip_prefix(prefix)?;
    let n: u8 = suffix.parse().ok()?;
    (1..=max).contains(&n).then_some(n)
}

/// The mnemonic for a raw opcode byte under the given ruleset, used by the
/// disassembly output. Where two names share a byte (`DIFFICULTY` /
/// `PREVRANDAO`), the newer name wins.
pub fn mnemonic_for(byte: u8, version: EvmVersion) -> Option<&'static str> {
    if (PUSH_OFFSET..=PUSH_OFFSET + 32).contains(&byte) {
        let n = byte - PUSH_OFFSET;
        if n == 0 {
            return version.since(EvmVersion::Shanghai).then_some("PUSH0");
        }
        return Some(PUSH_NAMES[n as usize - 1]);
    }
    if (DUP_OFFSET + 1..=DUP_OFFSET + 16).contains(&byte) {
        return Some(DUP_NAMES[(byte - DUP_OFFSET) as usize - 1]);
    }
    if (SWAP_OFFSET + 1..=SWAP_OFFSET + 16).contains(&byte) {
        return Some(SWAP_NAMES[(byte - SWAP_OFFSET) as usize - 1]);
    }

    OPCODES
        .iter()
        .filter(|&&(name, b, ..)| {
            b == byte && opcode_info(name, version).is_some()
        })
        .map(|&(name, ..)| name)
        .last()
}

/// Number of immediate bytes following an opcode byte (nonzero only for
/// the `PUSH` family).
pub fn immediate_len(byte: u8) -> usize {
    if (PUSH_OFFSET..=PUSH_OFFSET + 32).contains(&byte) {
        (byte - PUSH_OFFSET) as usize
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use strum::IntoEnumIterator;

    #[test]
    fn version_ordering_follows_fork_history() {
        let mut prev = None;
        for v in EvmVersion::iter() {
            if let Some(p) = prev {
                assert!(v > p);
            }
            assert!(v.since(EvmVersion::London));
            prev = Some(v);
        }
    }

    #[rstest]
    #[case("PUSH0", EvmVersion::Paris, false)]
    #[case("PUSH0", EvmVersion::Shanghai, true)]
    #[case("MCOPY", EvmVersion::Shanghai, false)]
    #[case("MCOPY", EvmVersion::Cancun, true)]
    #[case("TLOAD", EvmVersion::London, false)]
    #[case("TSTORE", EvmVersion::Cancun, true)]
    #[case("BASEFEE", EvmVersion::London, true)]
    fn fork_gating(
        #[case] mnemonic: &str,
        #[case] version: EvmVersion,
        #[case] available: bool,
    ) {
        assert_eq!(opcode_info(mnemonic, version).is_some(), available);
    }

    #[test]
    fn family_opcodes_resolve() {
        let push32 = opcode_info("PUSH32", EvmVersion::London).unwrap();
        assert_eq!(push32.byte, 0x7F);
        let dup1 = opcode_info("DUP1", EvmVersion::London).unwrap();
        assert_eq!(dup1.byte, 0x80);
        let swap16 = opcode_info("SWAP16", EvmVersion::London).unwrap();
        assert_eq!(swap16.byte, 0x9F);
        assert!(opcode_info("PUSH33", EvmVersion::London).is_none());
        assert!(opcode_info("DUP0", EvmVersion::London).is_none());
    }

    #[test]
    fn disassembly_prefers_newer_names() {
        assert_eq!(mnemonic_for(0x44, EvmVersion::Paris), Some("PREVRANDAO"));
        assert_eq!(mnemonic_for(0x5B, EvmVersion::London), Some("JUMPDEST"));
        assert_eq!(mnemonic_for(0x5F, EvmVersion::Paris), None);
        assert_eq!(mnemonic_for(0x61, EvmVersion::London), Some("PUSH2"));
    }

    #[test]
    fn immediate_lengths() {
        assert_eq!(immediate_len(0x60), 1);
        assert_eq!(immediate_len(0x7F), 32);
        assert_eq!(immediate_len(0x5F), 0);
        assert_eq!(immediate_len(0x01), 0);
    }
}
