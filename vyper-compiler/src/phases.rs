//! The phased pipeline: imports, layout, codegen, assembly-level
//! optimization, assembly, metadata.

use std::collections::BTreeMap;

use serde_json::Value;

use vyper_asm::{
    assemble, data_segment_lengths, eliminate_dead_code, metadata_trailer,
    peephole, AssembledProgram, AssemblyItem,
};

use crate::ast::ModuleRc;
use crate::codegen::Codegen;
use crate::error::CompileError;
use crate::imports::{resolve_imports, ModuleParser, ResolvedImports};
use crate::input_bundle::InputBundle;
use crate::layout::{allocate_layout, layout_export, Layout};
use crate::settings::{
    compiler_version, OptimizationLevel, ResolvedSettings, Settings,
};
use crate::warning::{WarningKind, WarningSink};

/// EIP-170 deployed-code size cap.
pub const EIP170_CONTRACT_SIZE_LIMIT: usize = (1 << 14) + (1 << 13);

/// The metadata dictionary mirrored into the CBOR trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Length of the runtime bytecode, immutables excluded.
    pub runtime_length: usize,
    /// Byte length of each runtime data section, in emission order.
    pub data_section_lengths: Vec<usize>,
    /// Bytes of code immutables appended at deploy time.
    pub immutables_length: usize,
    /// Compiler version triple.
    pub compiler_version: (u64, u64, u64),
}

impl Metadata {
    /// JSON form for the `metadata` output.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "runtime_length": self.runtime_length,
            "data_section_lengths": self.data_section_lengths,
            "immutables_length": self.immutables_length,
            "compiler": {
                "vyper": [
                    self.compiler_version.0,
                    self.compiler_version.1,
                    self.compiler_version.2,
                ],
            },
        })
    }
}

/// Everything the pipeline produces for one module.
#[derive(Debug)]
pub struct CompilerData {
    /// The root module.
    pub module: ModuleRc,
    /// Resolved import graph.
    pub imports: ResolvedImports,
    /// Fully resolved settings the compilation ran under.
    pub settings: ResolvedSettings,
    /// State-variable positions.
    pub layout: Layout,
    /// Exported layout maps.
    pub layout_export: Value,
    /// Runtime program assembly after optimization.
    pub runtime_items: Vec<AssemblyItem>,
    /// Deploy program assembly after optimization.
    pub deploy_items: Vec<AssemblyItem>,
    /// Assembled runtime program.
    pub runtime: AssembledProgram,
    /// Assembled deploy program.
    pub deploy: AssembledProgram,
    /// Deploy bytecode with the metadata trailer appended.
    pub bytecode: Vec<u8>,
    /// Runtime bytecode.
    pub bytecode_runtime: Vec<u8>,
    /// The metadata dictionary.
    pub metadata: Metadata,
    /// `signature -> 0x<8 hex digits>`.
    pub method_identifiers: BTreeMap<String, String>,
    /// Collected warnings.
    pub warnings: Vec<crate::warning::Warning>,
}

fn optimize_assembly(
    items: Vec<AssemblyItem>,
    level: OptimizationLevel,
) -> Vec<AssemblyItem> {
    if level == OptimizationLevel::None {
        return items;
    }
    eliminate_dead_code(peephole(items))
}

/// Run the full pipeline on an annotated module.
///
/// `settings` are the caller's defaults; pragma-derived settings (already
/// merged into `settings` by the front-end) take precedence. The optional
/// `layout_overrides` is the parsed storage layout override file.
pub fn compile_from_ast(
    module: ModuleRc,
    bundle: &mut impl InputBundle,
    parser: &impl ModuleParser,
    settings: &Settings,
    layout_overrides: Option<&Value>,
) -> Result<CompilerData, CompileError> {
    let resolved_settings = settings.finalize();
    let mut warnings = WarningSink::new();

    tracing::debug!(
        optimize = %resolved_settings.optimize,
        evm_version = %resolved_settings.evm_version,
        module = %module.path,
        "compiling module"
    );

    let imports = resolve_imports(module.clone(), bundle, parser)?;

    let layout = allocate_layout(
        &module,
        &imports,
        resolved_settings.evm_version,
        layout_overrides,
    )?;
    let layout_json = layout_export(&module, &imports, &layout);

    let mut codegen = Codegen::new(&module, &layout, resolved_settings)?;

    let runtime_items = optimize_assembly(
        codegen.generate_runtime()?,
        resolved_settings.optimize,
    );
    let runtime = assemble(&runtime_items, resolved_settings.evm_version)?;

    if runtime.bytecode.len() > EIP170_CONTRACT_SIZE_LIMIT {
        warnings.warn(
            WarningKind::ContractSizeLimit,
            format!(
                "Length of compiled bytecode is bigger than Ethereum \
                 contract size limit (see EIP-170): {}b > {}b",
                runtime.bytecode.len(),
                EIP170_CONTRACT_SIZE_LIMIT
            ),
            None,
        );
    }

    let deploy_items = optimize_assembly(
        codegen.generate_deploy(&runtime.bytecode)?,
        resolved_settings.optimize,
    );
    let deploy = assemble(&deploy_items, resolved_settings.evm_version)?;

    let metadata = Metadata {
        runtime_length: runtime.bytecode.len(),
        data_section_lengths: data_segment_lengths(&runtime_items),
        immutables_length: layout.immutables_len,
        compiler_version: compiler_version(),
    };

    let mut bytecode = deploy.bytecode.clone();
    bytecode.extend(metadata_trailer(
        metadata.runtime_length,
        &metadata.data_section_lengths,
        metadata.immutables_length,
        metadata.compiler_version,
    ));

    let method_identifiers = codegen
        .external_methods()
        .into_iter()
        .map(|m| (m.signature, format!("0x{:08x}", m.selector)))
        .collect();

    let bytecode_runtime = runtime.bytecode.clone();

    Ok(CompilerData {
        module,
        imports,
        settings: resolved_settings,
        layout,
        layout_export: layout_json,
        runtime_items,
        deploy_items,
        runtime,
        deploy,
        bytecode,
        bytecode_runtime,
        metadata,
        method_identifiers,
        warnings: warnings.into_warnings(),
    })
}
