//! Compilation settings and the version-pragma specifier language.

use core::fmt;

use vyper_asm::EvmVersion;

use crate::error::{CompileError, SourceLocation};

/// How hard the optimizer works, and toward what.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimizationLevel {
    /// No IR rewrites, no assembly cleanup.
    None,
    /// Optimize for gas (the default).
    #[default]
    Gas,
    /// Optimize for code size (dense selector tables).
    Codesize,
}

impl OptimizationLevel {
    /// Parse the pragma-facing name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(Self::None),
            "gas" => Some(Self::Gas),
            "codesize" => Some(Self::Codesize),
            _ => None,
        }
    }
}

impl fmt::Display for OptimizationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Gas => "gas",
            Self::Codesize => "codesize",
        })
    }
}

/// Settings accumulated from pragmas and the caller; `None` means
/// "not specified here".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    /// The accepted `pragma version` specifier, verbatim.
    pub compiler_version: Option<String>,
    /// `pragma optimize`.
    pub optimize: Option<OptimizationLevel>,
    /// `pragma evm-version`.
    pub evm_version: Option<EvmVersion>,
}

impl Settings {
    /// Fill unspecified fields from `other` (caller-provided settings have
    /// lower precedence than in-source pragmas).
    pub fn merge_defaults(mut self, other: &Settings) -> Settings {
        self.compiler_version = self
            .compiler_version
            .or_else(|| other.compiler_version.clone());
        self.optimize = self.optimize.or(other.optimize);
        self.evm_version = self.evm_version.or(other.evm_version);
        self
    }

    /// Resolve against the documented defaults.
    pub fn finalize(&self) -> ResolvedSettings {
        ResolvedSettings {
            optimize: self.optimize.unwrap_or_default(),
            evm_version: self.evm_version.unwrap_or(EvmVersion::DEFAULT),
        }
    }
}

/// Fully resolved settings the pipeline runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedSettings {
    /// Optimization mode.
    pub optimize: OptimizationLevel,
    /// Fork ruleset.
    pub evm_version: EvmVersion,
}

/// The compiler's own version, from the crate manifest with any
/// prerelease/build tags stripped.
pub fn compiler_version() -> (u64, u64, u64) {
    parse_version(env!("CARGO_PKG_VERSION")).expect("crate version is valid")
}

fn parse_version(s: &str) -> Option<(u64, u64, u64)> {
    let core = s.split(['-', '+']).next()?;
    let core = core.strip_prefix('v').unwrap_or(core);
    let mut parts = core.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().unwrap_or("0").parse().ok()?;
    let patch = parts.next().unwrap_or("0").parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpecOp {
    Eq,
    Ne,
    Le,
    Ge,
    Lt,
    Gt,
    Compatible, // ~=
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SpecClause {
    op: SpecOp,
    version: (u64, u64, u64),
    // how many components the user actually wrote, for ~= semantics
    precision: usize,
}

/// A version specifier: comma-separated clauses, all of which must hold.
///
/// Accepts the common subset of PEP440 specifiers: `==`, `!=`, `<=`, `>=`,
/// `<`, `>`, `~=`. A bare `X.Y.Z` (or `vX.Y.Z`) is shorthand for
/// `==X.Y.Z`; a leading `^` is rewritten to `~=`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionSpec {
    clauses: Vec<SpecClause>,
}

impl VersionSpec {
    /// Parse a specifier string as written in a version pragma.
    pub fn parse(spec: &str) -> Option<VersionSpec> {
        let spec = spec.trim();
        if spec.is_empty() {
            return None;
        }

        // npm-style caret rewrites to a compatible-release clause
        let spec = if let Some(rest) = spec.strip_prefix('^') {
            format!("~={rest}")
        } else if spec.starts_with(|c: char| c.is_ascii_digit() || c == 'v') {
            format!("=={spec}")
        } else {
            spec.to_string()
        };

        let mut clauses = Vec::new();
        for raw in spec.split(',') {
            let raw = raw.trim();
            let (op, rest) = if let Some(r) = raw.strip_prefix("==") {
                (SpecOp::Eq, r)
            } else if let Some(r) = raw.strip_prefix("!=") {
                (SpecOp::Ne, r)
            } else if let Some(r) = raw.strip_prefix("<=") {
                (SpecOp::Le, r)
            } else if let Some(r) = raw.strip_prefix(">=") {
                (SpecOp::Ge, r)
            } else if let Some(r) = raw.strip_prefix("~=") {
                (SpecOp::Compatible, r)
            } else if let Some(r) = raw.strip_prefix('<') {
                (SpecOp::Lt, r)
            } else if let Some(r) = raw.strip_prefix('>') {
                (SpecOp::Gt, r)
            } else {
                return None;
            };

            let rest = rest.trim();
            let rest = rest.strip_prefix('v').unwrap_or(rest);
            let precision = rest.split('.').count();
            if precision == 0 || precision > 3 {
                return None;
            }
            let version = parse_version(rest)?;
            clauses.push(SpecClause {
                op,
                version,
                precision,
            });
        }

        if clauses.is_empty() {
            return None;
        }
        Some(VersionSpec { clauses })
    }

    /// Whether the given version satisfies every clause.
    pub fn matches(&self, version: (u64, u64, u64)) -> bool {
        self.clauses.iter().all(|clause| {
            let v = clause.version;
            match clause.op {
                SpecOp::Eq => version == v,
                SpecOp::Ne => version != v,
                SpecOp::Le => version <= v,
                SpecOp::Ge => version >= v,
                SpecOp::Lt => version < v,
                SpecOp::Gt => version > v,
                SpecOp::Compatible => {
                    // ~=X.Y.Z: >=X.Y.Z and ==X.Y.*; ~=X.Y: >=X.Y and ==X.*
                    if version < v {
                        return false;
                    }
                    match clause.precision {
                        3 => version.0 == v.0 && version.1 == v.1,
                        _ => version.0 == v.0,
                    }
                }
            }
        })
    }
}

/// Validate a version pragma against this compiler, as the pre-parser does.
pub fn validate_version_pragma(
    spec: &str,
    location: SourceLocation,
) -> Result<(), CompileError> {
    if spec.is_empty() {
        return Err(CompileError::version(
            "Version specification cannot be empty",
            Some(location),
        ));
    }

    let parsed = VersionSpec::parse(spec).ok_or_else(|| {
        CompileError::version(
            format!(
                "Version specification \"{spec}\" is not a valid PEP440 specifier"
            ),
            Some(location),
        )
    })?;

    let current = compiler_version();
    if !parsed.matches(current) {
        return Err(CompileError::version(
            format!(
                "Version specification \"{spec}\" is not compatible with \
                 compiler version \"{}.{}.{}\"",
                current.0, current.1, current.2
            ),
            Some(location),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("0.4.0", (0, 4, 0), true)]
    #[case("0.4.0", (0, 4, 1), false)]
    #[case(">=0.4.0", (0, 5, 2), true)]
    #[case(">=0.4.0,<0.5.0", (0, 5, 0), false)]
    #[case("^0.4.0", (0, 4, 9), true)]
    #[case("^0.4.0", (0, 5, 0), false)]
    #[case("~=0.4", (0, 9, 0), true)]
    #[case("~=0.4", (1, 0, 0), false)]
    #[case("!=0.4.1", (0, 4, 1), false)]
    #[case("v0.4.0", (0, 4, 0), true)]
    fn spec_matching(
        #[case] spec: &str,
        #[case] version: (u64, u64, u64),
        #[case] expected: bool,
    ) {
        let parsed = VersionSpec::parse(spec).unwrap();
        assert_eq!(parsed.matches(version), expected, "{spec}");
    }

    #[test]
    fn rejects_malformed_specs() {
        assert!(VersionSpec::parse("").is_none());
        assert!(VersionSpec::parse("==").is_none());
        assert!(VersionSpec::parse("banana").is_none());
        assert!(VersionSpec::parse("==1.2.3.4").is_none());
    }

    #[test]
    fn pragma_validation_against_crate_version() {
        let loc = SourceLocation::at(1, 0);
        assert!(validate_version_pragma(">=0.1.0", loc).is_ok());
        assert!(matches!(
            validate_version_pragma("==99.0.0", loc),
            Err(CompileError::Version(_))
        ));
        assert!(matches!(
            validate_version_pragma("", loc),
            Err(CompileError::Version(_))
        ));
        assert!(matches!(
            validate_version_pragma("not-a-spec", loc),
            Err(CompileError::Version(_))
        ));
    }

    #[test]
    fn settings_merge_and_finalize() {
        let from_source = Settings {
            optimize: Some(OptimizationLevel::Codesize),
            ..Default::default()
        };
        let from_caller = Settings {
            optimize: Some(OptimizationLevel::None),
            evm_version: Some(EvmVersion::Cancun),
            ..Default::default()
        };
        let merged = from_source.merge_defaults(&from_caller);
        assert_eq!(merged.optimize, Some(OptimizationLevel::Codesize));
        assert_eq!(merged.evm_version, Some(EvmVersion::Cancun));

        let resolved = Settings::default().finalize();
        assert_eq!(resolved.optimize, OptimizationLevel::Gas);
        assert_eq!(resolved.evm_version, EvmVersion::Shanghai);
    }
}
