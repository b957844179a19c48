//! The typed error taxonomy surfaced to callers.
//!
//! Every user-facing error carries an optional source location; rendering
//! (context lines, colors) is the caller's responsibility. The pipeline has
//! no recovery points: the first error aborts compilation.

use core::fmt;

/// Position of the offending construct in its source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct SourceLocation {
    /// 1-based line.
    pub lineno: u32,
    /// 0-based column.
    pub col_offset: u32,
    /// 1-based end line, when known.
    pub end_lineno: Option<u32>,
    /// 0-based end column, when known.
    pub end_col_offset: Option<u32>,
    /// Stable id of the AST node, when the error is attached to one.
    pub node_id: Option<u32>,
}

impl SourceLocation {
    /// Location from a bare line/column pair.
    pub fn at(lineno: u32, col_offset: u32) -> Self {
        SourceLocation {
            lineno,
            col_offset,
            ..Default::default()
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}:{}", self.lineno, self.col_offset)
    }
}

/// All compilation failures. The variant is the error kind of the original
/// taxonomy; the payload is a message plus an optional location.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    /// The pre-parser rejected a token.
    #[error("{0}")]
    Syntax(ErrorDetail),
    /// Malformed pragma, duplicate pragma, bad import form, or other
    /// structural problem.
    #[error("{0}")]
    Structure(ErrorDetail),
    /// Version pragma incompatible with this compiler.
    #[error("{0}")]
    Version(ErrorDetail),
    /// The import graph has a cycle.
    #[error("import cycle: {0}")]
    ImportCycle(ErrorDetail),
    /// The same module was imported twice from one module.
    #[error("{0}")]
    DuplicateImport(ErrorDetail),
    /// An imported module could not be located.
    #[error("could not find module: {0}")]
    ModuleNotFound(ErrorDetail),
    /// Storage layout override collision or out-of-bounds slot.
    #[error("{0}")]
    StorageLayout(ErrorDetail),
    /// Malformed JSON input (interface files, standard-JSON bundles,
    /// layout overrides).
    #[error("{0}")]
    Json(ErrorDetail),
    /// Internal invariant violation. Always a compiler bug.
    #[error("compiler panic: {0}; please report this")]
    Panic(ErrorDetail),
}

/// Message plus optional location, shared by all variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    /// Human-readable message.
    pub message: String,
    /// Where it happened, when known.
    pub location: Option<SourceLocation>,
    /// Optional remediation hint.
    pub hint: Option<String>,
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(loc) = &self.location {
            write!(f, " ({loc})")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, " (hint: {hint})")?;
        }
        Ok(())
    }
}

impl ErrorDetail {
    fn new(message: impl Into<String>, location: Option<SourceLocation>) -> Self {
        ErrorDetail {
            message: message.into(),
            location,
            hint: None,
        }
    }
}

impl CompileError {
    /// `SyntaxException`.
    pub fn syntax(
        message: impl Into<String>,
        location: Option<SourceLocation>,
    ) -> Self {
        CompileError::Syntax(ErrorDetail::new(message, location))
    }

    /// `StructureException`.
    pub fn structure(
        message: impl Into<String>,
        location: Option<SourceLocation>,
    ) -> Self {
        CompileError::Structure(ErrorDetail::new(message, location))
    }

    /// `VersionException`.
    pub fn version(
        message: impl Into<String>,
        location: Option<SourceLocation>,
    ) -> Self {
        CompileError::Version(ErrorDetail::new(message, location))
    }

    /// `ImportCycle`.
    pub fn import_cycle(message: impl Into<String>) -> Self {
        CompileError::ImportCycle(ErrorDetail::new(message, None))
    }

    /// `DuplicateImport`.
    pub fn duplicate_import(
        message: impl Into<String>,
        location: Option<SourceLocation>,
    ) -> Self {
        CompileError::DuplicateImport(ErrorDetail::new(message, location))
    }

    /// `ModuleNotFound`, with an optional rename hint.
    pub fn module_not_found(
        module: impl Into<String>,
        hint: Option<String>,
    ) -> Self {
        let mut detail = ErrorDetail::new(module, None);
        detail.hint = hint;
        CompileError::ModuleNotFound(detail)
    }

    /// `StorageLayoutException`.
    pub fn storage_layout(
        message: impl Into<String>,
        location: Option<SourceLocation>,
    ) -> Self {
        CompileError::StorageLayout(ErrorDetail::new(message, location))
    }

    /// `JSONError`.
    pub fn json(message: impl Into<String>) -> Self {
        CompileError::Json(ErrorDetail::new(message, None))
    }

    /// `CompilerPanic`: an internal invariant was violated.
    pub fn panic(message: impl Into<String>) -> Self {
        CompileError::Panic(ErrorDetail::new(message, None))
    }

    /// The location payload, for callers that format errors themselves.
    pub fn location(&self) -> Option<SourceLocation> {
        self.detail().location
    }

    /// The shared message/location payload.
    pub fn detail(&self) -> &ErrorDetail {
        match self {
            CompileError::Syntax(d)
            | CompileError::Structure(d)
            | CompileError::Version(d)
            | CompileError::ImportCycle(d)
            | CompileError::DuplicateImport(d)
            | CompileError::ModuleNotFound(d)
            | CompileError::StorageLayout(d)
            | CompileError::Json(d)
            | CompileError::Panic(d) => d,
        }
    }
}

impl From<vyper_asm::AsmError> for CompileError {
    fn from(e: vyper_asm::AsmError) -> Self {
        // anything the assembler rejects was produced by codegen
        CompileError::panic(e.to_string())
    }
}

impl From<vyper_ir::IrError> for CompileError {
    fn from(e: vyper_ir::IrError) -> Self {
        match e {
            vyper_ir::IrError::StaticClampViolation(msg) => {
                CompileError::structure(msg, None)
            }
            other => CompileError::panic(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_location_and_hint() {
        let err = CompileError::structure(
            "pragma version specified twice!",
            Some(SourceLocation::at(3, 0)),
        );
        assert_eq!(
            err.to_string(),
            "pragma version specified twice! (line 3:0)"
        );

        let err = CompileError::module_not_found(
            "vyper.interfaces.ERC20",
            Some("try renaming `vyper.interfaces` to `ethereum.ercs`".into()),
        );
        assert!(err.to_string().contains("hint:"));
    }

    #[test]
    fn asm_errors_become_panics() {
        let err: CompileError =
            vyper_asm::AsmError::UnknownOpcode("FROB".into()).into();
        assert!(matches!(err, CompileError::Panic(_)));
    }
}
