//! Source maps: PC-indexed provenance collected during symbol resolution,
//! plus the compressed interchange form.

use core::fmt;
use std::collections::BTreeMap;

use crate::error::AsmError;
use crate::item::AstRef;

/// Classification of a `JUMP`-family instruction for debuggers: `i` enters
/// an internal function, `o` exits one, `-` is everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum JumpType {
    /// Enters an internal function.
    In,
    /// Exits an internal function.
    Out,
    /// A regular jump (or `JUMPI`/`JUMPDEST`).
    #[default]
    Regular,
}

impl JumpType {
    /// The single-character interchange form.
    pub const fn as_str(self) -> &'static str {
        match self {
            JumpType::In => "i",
            JumpType::Out => "o",
            JumpType::Regular => "-",
        }
    }

    /// Parse the interchange form.
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "i" => Some(JumpType::In),
            "o" => Some(JumpType::Out),
            "-" => Some(JumpType::Regular),
            _ => None,
        }
    }
}

impl fmt::Display for JumpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for JumpType {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// PC-indexed maps produced by assembler pass 1.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SourceMap {
    /// Source line numbers with breakpoints (populated by debug
    /// instrumentation; empty in normal compilation).
    pub breakpoints: Vec<u32>,
    /// PCs with breakpoints.
    pub pc_breakpoints: Vec<u32>,
    /// Jump classification per PC of each `JUMP`/`JUMPI`/`JUMPDEST`.
    pub pc_jump_map: BTreeMap<usize, JumpType>,
    /// AST provenance per PC of each tagged instruction.
    pub pc_raw_ast_map: BTreeMap<usize, AstRef>,
    /// Revert-reason tag per PC of each tagged failure jump.
    pub error_map: BTreeMap<usize, String>,
}

impl SourceMap {
    /// The position map `pc -> (start, length, source_id)`, derived from
    /// the raw AST map.
    pub fn pc_pos_map(&self) -> BTreeMap<usize, (u32, u32, u32)> {
        self.pc_raw_ast_map
            .iter()
            .map(|(&pc, r)| (pc, (r.start, r.length, r.source_id)))
            .collect()
    }

    /// The entries fed into [`compress`], in PC order.
    pub fn entries(&self) -> Vec<PcMapEntry> {
        self.pc_raw_ast_map
            .iter()
            .map(|(&pc, r)| PcMapEntry {
                start: r.start as i64,
                length: r.length as i64,
                source_id: r.source_id as i64,
                jump: self.pc_jump_map.get(&pc).copied().unwrap_or_default(),
            })
            .collect()
    }
}

/// One uncompressed source-map entry: `[start, length, source_id, jump]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcMapEntry {
    /// Byte offset of the source span, `-1` when unknown.
    pub start: i64,
    /// Byte length of the source span, `-1` when unknown.
    pub length: i64,
    /// Source id of the file.
    pub source_id: i64,
    /// Jump classification.
    pub jump: JumpType,
}

/// Run-length compress entries into the `start:length:source_id:jump;`
/// interchange form. Fields equal to the previous entry are blanked, and
/// trailing runs of unchanged fields are omitted. The stream is seeded
/// with the sentinel `-1:-1:<source_id>:-;`.
pub fn compress(entries: &[PcMapEntry], source_id: u32) -> String {
    let mut last: [String; 4] = [
        "-1".into(),
        "-1".into(),
        source_id.to_string(),
        "-".into(),
    ];
    let mut out = format!("-1:-1:{source_id}:-;");

    for entry in entries {
        let mut fields: Vec<Option<String>> = vec![
            Some(entry.start.to_string()),
            Some(entry.length.to_string()),
            Some(entry.source_id.to_string()),
            Some(entry.jump.to_string()),
        ];

        for i in (0..4).rev() {
            let cur = fields[i].clone().expect("field still present");
            if cur != last[i] {
                last[i] = cur;
            } else if fields.len() == i + 1 {
                fields.pop();
            } else {
                fields[i] = None;
            }
        }

        let rendered: Vec<&str> = fields
            .iter()
            .map(|f| f.as_deref().unwrap_or(""))
            .collect();
        out.push_str(&rendered.join(":"));
        out.push(';');
    }

    out
}

/// Inverse of [`compress`]; the seed sentinel is consumed and not returned.
pub fn expand(compressed: &str) -> Result<Vec<PcMapEntry>, AsmError> {
    let mut chunks = compressed.split(';').collect::<Vec<_>>();
    if chunks.last() == Some(&"") {
        chunks.pop();
    }
    if chunks.is_empty() {
        return Err(AsmError::SourceMapFormat("empty source map".into()));
    }

    let parse_field = |s: &str| -> Result<i64, AsmError> {
        s.parse()
            .map_err(|_| AsmError::SourceMapFormat(format!("bad field {s:?}")))
    };

    let mut last: [i64; 3] = [0; 3];
    let mut last_jump = JumpType::Regular;
    let mut out = Vec::with_capacity(chunks.len().saturating_sub(1));

    for (n, chunk) in chunks.iter().enumerate() {
        let fields: Vec<&str> = chunk.split(':').collect();
        if fields.len() > 4 {
            return Err(AsmError::SourceMapFormat(format!(
                "too many fields in {chunk:?}"
            )));
        }
        for (i, field) in fields.iter().enumerate() {
            if field.is_empty() {
                continue;
            }
            if i < 3 {
                last[i] = parse_field(field)?;
            } else {
                last_jump = JumpType::from_str_opt(field).ok_or_else(|| {
                    AsmError::SourceMapFormat(format!("bad jump {field:?}"))
                })?;
            }
        }
        if n > 0 {
            out.push(PcMapEntry {
                start: last[0],
                length: last[1],
                source_id: last[2],
                jump: last_jump,
            });
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(start: i64, length: i64, source_id: i64, jump: JumpType) -> PcMapEntry {
        PcMapEntry {
            start,
            length,
            source_id,
            jump,
        }
    }

    #[test]
    fn compress_omits_unchanged_fields() {
        let entries = vec![
            entry(0, 10, 0, JumpType::Regular),
            entry(0, 10, 0, JumpType::Regular),
            entry(4, 10, 0, JumpType::In),
            entry(4, 2, 0, JumpType::Regular),
        ];
        let compressed = compress(&entries, 0);
        assert_eq!(compressed, "-1:-1:0:-;0:10;;4:::i;:2::-;");
    }

    #[test]
    fn expand_round_trips() {
        let entries = vec![
            entry(0, 33, 0, JumpType::Regular),
            entry(5, 7, 1, JumpType::In),
            entry(5, 7, 1, JumpType::Out),
            entry(-1, -1, 1, JumpType::Regular),
        ];
        let compressed = compress(&entries, 0);
        assert_eq!(expand(&compressed).unwrap(), entries);
    }

    #[test]
    fn expand_rejects_garbage() {
        assert!(expand("").is_err());
        assert!(expand("-1:-1:0:-;a:b;").is_err());
        assert!(expand("-1:-1:0:-;1:2:3:x;").is_err());
    }

    #[quickcheck_macros::quickcheck]
    fn compress_expand_round_trip(raw: Vec<(u32, u32, u8, u8)>) -> bool {
        let entries: Vec<PcMapEntry> = raw
            .into_iter()
            .map(|(start, length, source_id, jump)| PcMapEntry {
                start: start as i64,
                length: length as i64,
                source_id: source_id as i64,
                jump: match jump % 3 {
                    0 => JumpType::Regular,
                    1 => JumpType::In,
                    _ => JumpType::Out,
                },
            })
            .collect();
        expand(&compress(&entries, 0)).unwrap() == entries
    }
}
