//! Source pre-parsing: pragma extraction, compound-keyword rewriting, and
//! for-loop annotation capture.
//!
//! The scanner understands just enough of the lexical grammar (strings,
//! comments, identifiers) to do its job; full parsing happens downstream.

use std::collections::BTreeMap;

use crate::error::{CompileError, SourceLocation};
use crate::settings::{
    validate_version_pragma, OptimizationLevel, Settings,
};
use vyper_asm::EvmVersion;

/// Keywords rewritten to `class`, recorded as `<Kind>Def`.
const CLASS_TYPES: &[&str] = &["interface", "struct", "flag", "event"];

/// Keywords rewritten to `yield`.
const EXPRESSION_TYPES: &[&str] = &["log"];

/// Everything the pre-parser extracts from one source file.
#[derive(Debug, Clone, Default)]
pub struct PreParseResult {
    /// Settings from pragma directives.
    pub settings: Settings,
    /// For-loop iterator annotations, keyed by the `for` statement's line.
    pub loop_var_annotations: BTreeMap<u32, String>,
    /// Original keyword kind per rewritten occurrence, keyed by
    /// `(line, column)` of the keyword in the original source.
    pub modification_offsets: BTreeMap<(u32, u32), String>,
    /// The rewritten source handed to the parser.
    pub code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StringMode {
    None,
    Single(u8),
    Triple(u8),
}

struct Scanner<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    col: u32,
}

impl<'a> Scanner<'a> {
    fn new(src: &'a str) -> Self {
        Scanner {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
            col: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.src.get(self.pos + ahead).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.col = 0;
        } else {
            self.col += 1;
        }
        Some(b)
    }

    fn location(&self) -> SourceLocation {
        SourceLocation::at(self.line, self.col)
    }
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_continue(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Pre-parse one source file.
pub fn pre_parse(code: &str) -> Result<PreParseResult, CompileError> {
    let mut result = PreParseResult::default();
    let mut out = String::with_capacity(code.len());
    let mut scanner = Scanner::new(code);

    // for-loop annotation state
    let mut in_for = false;
    let mut after_loop_var = false;
    let mut for_line = 0u32;
    let mut annotation = String::new();

    let mut string_mode = StringMode::None;

    while let Some(b) = scanner.peek() {
        match string_mode {
            StringMode::Single(delim) => {
                let c = scanner.bump().expect("peeked");
                out.push(c as char);
                if c == b'\\' {
                    if let Some(next) = scanner.bump() {
                        out.push(next as char);
                    }
                } else if c == delim || c == b'\n' {
                    string_mode = StringMode::None;
                }
                continue;
            }
            StringMode::Triple(delim) => {
                if scanner.peek() == Some(delim)
                    && scanner.peek_at(1) == Some(delim)
                    && scanner.peek_at(2) == Some(delim)
                {
                    for _ in 0..3 {
                        out.push(scanner.bump().expect("peeked") as char);
                    }
                    string_mode = StringMode::None;
                } else {
                    out.push(scanner.bump().expect("peeked") as char);
                }
                continue;
            }
            StringMode::None => {}
        }

        if b == b'"' || b == b'\'' {
            if scanner.peek_at(1) == Some(b) && scanner.peek_at(2) == Some(b) {
                for _ in 0..3 {
                    out.push(scanner.bump().expect("peeked") as char);
                }
                string_mode = StringMode::Triple(b);
            } else {
                out.push(scanner.bump().expect("peeked") as char);
                string_mode = StringMode::Single(b);
            }
            continue;
        }

        if b == b'#' {
            // comment until end of line; maybe a pragma
            let location = scanner.location();
            let start = scanner.pos;
            while scanner.peek().is_some() && scanner.peek() != Some(b'\n') {
                scanner.bump();
            }
            let comment =
                std::str::from_utf8(&scanner.src[start..scanner.pos])
                    .map_err(|_| {
                        CompileError::syntax(
                            "source is not valid UTF-8",
                            Some(location),
                        )
                    })?;
            out.push_str(comment);
            handle_comment(&comment[1..], location, &mut result.settings)?;
            continue;
        }

        if b == b';' {
            return Err(CompileError::syntax(
                "Semi-colon statements not allowed",
                Some(scanner.location()),
            ));
        }

        if is_ident_start(b) {
            let location = scanner.location();
            let start = scanner.pos;
            while scanner.peek().map_or(false, is_ident_continue) {
                scanner.bump();
            }
            let word = std::str::from_utf8(&scanner.src[start..scanner.pos])
                .expect("identifier bytes are ascii");

            if word == "class" || word == "yield" {
                return Err(CompileError::syntax(
                    format!("The `{word}` keyword is not allowed"),
                    Some(location),
                ));
            }

            if after_loop_var && word != "in" {
                annotation.push_str(word);
                continue;
            }

            if word == "for" {
                in_for = true;
                after_loop_var = false;
                for_line = location.lineno;
                annotation.clear();
                out.push_str(word);
                continue;
            }

            if in_for && word == "in" {
                if after_loop_var {
                    result
                        .loop_var_annotations
                        .insert(for_line, annotation.trim().to_string());
                    if !out.ends_with(char::is_whitespace) {
                        out.push(' ');
                    }
                }
                in_for = false;
                after_loop_var = false;
                annotation.clear();
                out.push_str(word);
                continue;
            }

            if CLASS_TYPES.contains(&word) && location.col_offset == 0 {
                let mut kind = word.to_string();
                if let Some(first) = kind.get_mut(0..1) {
                    first.make_ascii_uppercase();
                }
                result.modification_offsets.insert(
                    (location.lineno, location.col_offset),
                    format!("{kind}Def"),
                );
                out.push_str("class");
                continue;
            }

            if EXPRESSION_TYPES.contains(&word) {
                result.modification_offsets.insert(
                    (location.lineno, location.col_offset),
                    "Log".to_string(),
                );
                out.push_str("yield");
                continue;
            }

            out.push_str(word);
            continue;
        }

        // the annotation between `:` and `in` is captured, not copied
        if in_for && b == b':' && !after_loop_var {
            after_loop_var = true;
            scanner.bump();
            continue;
        }
        if after_loop_var {
            if b == b'\n' {
                // a for statement header ends on its line
                in_for = false;
                after_loop_var = false;
            } else {
                annotation.push(b as char);
                scanner.bump();
                continue;
            }
        }

        out.push(scanner.bump().expect("peeked") as char);
    }

    result.code = out;
    Ok(result)
}

fn handle_comment(
    contents: &str,
    location: SourceLocation,
    settings: &mut Settings,
) -> Result<(), CompileError> {
    let contents = contents.trim();

    if let Some(rest) = contents.strip_prefix("@version") {
        if settings.compiler_version.is_some() {
            return Err(CompileError::structure(
                "compiler version specified twice!",
                Some(location),
            ));
        }
        let spec = rest.trim();
        validate_version_pragma(spec, location)?;
        settings.compiler_version = Some(spec.to_string());
        return Ok(());
    }

    let Some(pragma) = contents.strip_prefix("pragma ") else {
        return Ok(());
    };
    let pragma = pragma.trim();

    if let Some(spec) = pragma.strip_prefix("version ") {
        if settings.compiler_version.is_some() {
            return Err(CompileError::structure(
                "pragma version specified twice!",
                Some(location),
            ));
        }
        let spec = spec.trim();
        validate_version_pragma(spec, location)?;
        settings.compiler_version = Some(spec.to_string());
    } else if let Some(mode) = pragma.strip_prefix("optimize") {
        if settings.optimize.is_some() {
            return Err(CompileError::structure(
                "pragma optimize specified twice!",
                Some(location),
            ));
        }
        let mode = mode.trim();
        settings.optimize =
            Some(OptimizationLevel::from_name(mode).ok_or_else(|| {
                CompileError::structure(
                    format!("Invalid optimization mode `{mode}`"),
                    Some(location),
                )
            })?);
    } else if let Some(name) = pragma.strip_prefix("evm-version") {
        if settings.evm_version.is_some() {
            return Err(CompileError::structure(
                "pragma evm-version specified twice!",
                Some(location),
            ));
        }
        let name = name.trim();
        settings.evm_version =
            Some(EvmVersion::from_name(name).ok_or_else(|| {
                CompileError::structure(
                    format!("Invalid evm version: `{name}`"),
                    Some(location),
                )
            })?);
    } else {
        let head = pragma.split_whitespace().next().unwrap_or(pragma);
        return Err(CompileError::structure(
            format!("Unknown pragma `{head}`"),
            Some(location),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_pragmas() {
        let src = "# pragma version >=0.1.0\n# pragma optimize codesize\n# pragma evm-version cancun\nx: uint256\n";
        let result = pre_parse(src).unwrap();
        assert_eq!(result.settings.compiler_version.as_deref(), Some(">=0.1.0"));
        assert_eq!(
            result.settings.optimize,
            Some(OptimizationLevel::Codesize)
        );
        assert_eq!(result.settings.evm_version, Some(EvmVersion::Cancun));
    }

    #[test]
    fn legacy_version_pragma() {
        let src = "# @version >=0.1.0\n";
        let result = pre_parse(src).unwrap();
        assert_eq!(result.settings.compiler_version.as_deref(), Some(">=0.1.0"));
    }

    #[test]
    fn duplicate_pragma_rejected() {
        let src = "# pragma optimize gas\n# pragma optimize none\n";
        assert!(matches!(
            pre_parse(src),
            Err(CompileError::Structure(_))
        ));

        let src = "# @version >=0.1.0\n# pragma version >=0.1.0\n";
        assert!(matches!(pre_parse(src), Err(CompileError::Structure(_))));
    }

    #[test]
    fn unknown_pragma_rejected() {
        let src = "# pragma frobnicate on\n";
        let err = pre_parse(src).unwrap_err();
        assert!(err.to_string().contains("Unknown pragma `frobnicate`"));
    }

    #[test]
    fn incompatible_version_rejected() {
        let src = "# pragma version ==99.0.0\n";
        assert!(matches!(pre_parse(src), Err(CompileError::Version(_))));
    }

    #[test]
    fn rewrites_compound_keywords() {
        let src = "event Transfer:\n    amount: uint256\n\nstruct Point:\n    x: uint256\n";
        let result = pre_parse(src).unwrap();
        assert!(result.code.starts_with("class Transfer:"));
        assert!(result.code.contains("class Point:"));
        assert_eq!(
            result.modification_offsets.get(&(1, 0)).map(String::as_str),
            Some("EventDef")
        );
        assert_eq!(
            result.modification_offsets.get(&(4, 0)).map(String::as_str),
            Some("StructDef")
        );
    }

    #[test]
    fn rewrites_log_to_yield() {
        let src = "def f():\n    log Transfer(1)\n";
        let result = pre_parse(src).unwrap();
        assert!(result.code.contains("yield Transfer(1)"));
        assert_eq!(
            result.modification_offsets.get(&(2, 4)).map(String::as_str),
            Some("Log")
        );
    }

    #[test]
    fn keyword_not_rewritten_when_indented() {
        // only column 0 occurrences denote declarations
        let src = "def f():\n    event = 1\n";
        let result = pre_parse(src).unwrap();
        assert!(result.code.contains("event = 1"));
    }

    #[test]
    fn captures_loop_annotations() {
        let src = "def f():\n    for i: uint256 in range(10):\n        pass\n";
        let result = pre_parse(src).unwrap();
        assert_eq!(
            result.loop_var_annotations.get(&2).map(String::as_str),
            Some("uint256")
        );
        assert!(result.code.contains("for i in range(10):"));
    }

    #[test]
    fn untyped_loop_unchanged() {
        let src = "def f():\n    for i in range(10):\n        pass\n";
        let result = pre_parse(src).unwrap();
        assert!(result.loop_var_annotations.is_empty());
        assert!(result.code.contains("for i in range(10):"));
    }

    #[test]
    fn rejects_semicolons_outside_strings() {
        assert!(matches!(
            pre_parse("x: uint256 = 1; y: uint256 = 2\n"),
            Err(CompileError::Syntax(_))
        ));
        // inside a string it is fine
        assert!(pre_parse("s: String[4] = \"a;b\"\n").is_ok());
        // inside a comment it is fine
        assert!(pre_parse("# a; b\n").is_ok());
    }

    #[test]
    fn rejects_reserved_keywords() {
        assert!(matches!(
            pre_parse("class Foo:\n    pass\n"),
            Err(CompileError::Syntax(_))
        ));
        assert!(matches!(
            pre_parse("def f():\n    yield 1\n"),
            Err(CompileError::Syntax(_))
        ));
    }

    #[test]
    fn keeps_string_contents_verbatim(){
        let src = "s: String[20] = \"interface log for\"\n";
        let result = pre_parse(src).unwrap();
        assert!(result.code.contains("\"interface log for\""));
    }
}
