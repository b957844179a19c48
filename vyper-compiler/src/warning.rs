//! Non-fatal diagnostics. Warnings are collected on the pipeline result and
//! mirrored through `tracing`; they never affect outputs.

use crate::error::SourceLocation;

/// Warning kinds the pipeline can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    /// Runtime code exceeds the EIP-170 deployed-size cap.
    ContractSizeLimit,
    /// Use of a deprecated construct.
    Deprecation,
}

/// One collected warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    /// The kind.
    pub kind: WarningKind,
    /// Human-readable message.
    pub message: String,
    /// Where it happened, when known.
    pub location: Option<SourceLocation>,
}

/// Append-only warning collector threaded through the pipeline.
#[derive(Debug, Default)]
pub struct WarningSink {
    warnings: Vec<Warning>,
}

impl WarningSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a warning and mirror it to the log.
    pub fn warn(
        &mut self,
        kind: WarningKind,
        message: impl Into<String>,
        location: Option<SourceLocation>,
    ) {
        let message = message.into();
        tracing::warn!(?kind, "{message}");
        self.warnings.push(Warning {
            kind,
            message,
            location,
        });
    }

    /// Everything collected so far, in emission order.
    pub fn into_warnings(self) -> Vec<Warning> {
        self.warnings
    }

    /// Borrowing accessor.
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }
}
