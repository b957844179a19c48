//! Import resolution: walk the import graph, validate it, collect compiler
//! inputs, and compute the integrity hash over the transitive closure.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use itertools::Itertools;

use crate::ast::{ImportStmt, Module, ModuleRc};
use crate::error::{CompileError, SourceLocation};
use crate::input_bundle::{
    sha256sum, FileInput, InputBundle, JsonInput, BUILTIN,
};

/// One input to the compilation, in discovery order.
#[derive(Debug, Clone)]
pub enum CompilerInput {
    /// A source or interface file.
    File(FileInput),
    /// A JSON ABI file.
    Json(JsonInput),
}

impl CompilerInput {
    /// Hex sha256 of the raw contents.
    pub fn sha256sum(&self) -> String {
        match self {
            CompilerInput::File(f) => f.sha256sum(),
            CompilerInput::Json(j) => j.file.sha256sum(),
        }
    }

    /// The path as requested.
    pub fn path(&self) -> &Path {
        match self {
            CompilerInput::File(f) => &f.path,
            CompilerInput::Json(j) => &j.file.path,
        }
    }

    /// The resolved path.
    pub fn resolved_path(&self) -> &Path {
        match self {
            CompilerInput::File(f) => &f.resolved_path,
            CompilerInput::Json(j) => &j.file.resolved_path,
        }
    }

    /// Source id assigned by the bundle.
    pub fn source_id(&self) -> i32 {
        match self {
            CompilerInput::File(f) => f.source_id,
            CompilerInput::Json(j) => j.file.source_id,
        }
    }
}

/// What an import resolved to.
#[derive(Debug, Clone)]
pub enum ParsedImport {
    /// A parsed module (`.vy` or `.vyi`).
    Module(ModuleRc),
    /// A JSON ABI (the `abi` array).
    Abi(serde_json::Value),
}

/// Annotation attached to each import statement.
#[derive(Debug, Clone)]
pub struct ImportInfo {
    /// The name the import is bound to.
    pub alias: String,
    /// The dotted module path as written.
    pub qualified_module_name: String,
    /// The compiler input it resolved to.
    pub input: CompilerInput,
    /// The parsed payload.
    pub parsed: ParsedImport,
}

/// Key for import annotations: owning module's resolved path plus the
/// import node id (node ids are only unique per module).
pub type ImportKey = (String, u32);

/// The result of import resolution.
#[derive(Debug)]
pub struct ResolvedImports {
    /// The root module.
    pub toplevel: ModuleRc,
    /// Every compiler input, in first-discovery order.
    pub compiler_inputs: Vec<CompilerInput>,
    /// Import annotations.
    pub import_infos: HashMap<ImportKey, ImportInfo>,
    /// `sha256` integrity sum over the transitive closure.
    pub integrity_sum: String,
}

impl ResolvedImports {
    /// The annotation for an import statement of `module`.
    pub fn import_info(
        &self,
        module: &Module,
        stmt: &ImportStmt,
    ) -> Option<&ImportInfo> {
        self.import_infos
            .get(&(module.resolved_path.clone(), stmt.node.node_id))
    }

    /// Resolve an alias to an imported module, for `initializes` handling.
    pub fn imported_module(
        &self,
        module: &Module,
        alias: &str,
    ) -> Option<ModuleRc> {
        for stmt in module.imports() {
            if let Some(info) = self.import_info(module, stmt) {
                if info.alias == alias {
                    if let ParsedImport::Module(m) = &info.parsed {
                        return Some(m.clone());
                    }
                }
            }
        }
        None
    }
}

/// The external front-end interface: parse one file into an annotated
/// module.
pub trait ModuleParser {
    /// Parse `file`; `is_interface` marks `.vyi` inputs.
    fn parse(
        &self,
        file: &FileInput,
        is_interface: bool,
    ) -> Result<ModuleRc, CompileError>;
}

// builtin import path prefix -> (embedded package root, suffix)
const BUILTIN_MODULE_RULES: &[(&str, &str, &str)] = &[
    ("ethereum.ercs", "ethereum/ercs", ".vyi"),
    ("math", "", ".vy"),
];

// the embedded builtin package
const BUILTIN_SOURCES: &[(&str, &str)] = &[
    (
        "ethereum/ercs/IERC20.vyi",
        include_str!("builtins/IERC20.vyi"),
    ),
    (
        "ethereum/ercs/IERC165.vyi",
        include_str!("builtins/IERC165.vyi"),
    ),
    ("math.vy", include_str!("builtins/math.vy")),
];

fn builtin_prefix(module_str: &str) -> Option<&'static str> {
    BUILTIN_MODULE_RULES
        .iter()
        .map(|&(prefix, ..)| prefix)
        .find(|prefix| module_str.starts_with(prefix))
}

fn is_builtin(level: u32, module_str: &str) -> bool {
    level == 0 && builtin_prefix(module_str).is_some()
}

// convert an import to a path (without suffix)
fn import_to_path(level: u32, module_str: &str) -> PathBuf {
    let mut base = String::new();
    if level > 1 {
        for _ in 0..level - 1 {
            base.push_str("../");
        }
    } else if level == 1 {
        base.push_str("./");
    }
    PathBuf::from(format!("{base}{}", module_str.replace('.', "/")))
}

/// Resolve the import graph of `module` against `bundle`, parsing imported
/// sources with `parser`.
pub fn resolve_imports<B: InputBundle, P: ModuleParser>(
    module: ModuleRc,
    bundle: &mut B,
    parser: &P,
) -> Result<ResolvedImports, CompileError> {
    let mut analyzer = ImportAnalyzer {
        bundle,
        parser,
        absolute_search_paths: Vec::new(),
        path_stack: Vec::new(),
        seen: Vec::new(),
        ast_cache: HashMap::new(),
        compiler_inputs: Vec::new(),
        import_infos: HashMap::new(),
    };
    analyzer.absolute_search_paths = analyzer.bundle.search_paths();
    analyzer.resolve_r(module.clone())?;

    let integrity_sum = integrity_r(&module, &analyzer.import_infos);

    Ok(ResolvedImports {
        toplevel: module,
        compiler_inputs: analyzer.compiler_inputs,
        import_infos: analyzer.import_infos,
        integrity_sum,
    })
}

fn integrity_r(
    module: &Module,
    infos: &HashMap<ImportKey, ImportInfo>,
) -> String {
    let mut acc = sha256sum(&module.source);
    for stmt in module.imports() {
        let info = infos
            .get(&(module.resolved_path.clone(), stmt.node.node_id))
            .expect("import annotated during resolution");
        let suffix = info
            .input
            .path()
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("");
        if suffix == "vyi" || suffix == "json" {
            acc.push_str(&info.input.sha256sum());
        } else if let ParsedImport::Module(child) = &info.parsed {
            acc.push_str(&integrity_r(child, infos));
        }
    }
    sha256sum(&acc)
}

struct ImportAnalyzer<'a, B, P> {
    bundle: &'a mut B,
    parser: &'a P,
    absolute_search_paths: Vec<PathBuf>,
    // modules on the current traversal path, with per-module import maps
    // for duplicate detection
    path_stack: Vec<(ModuleRc, HashMap<PathBuf, SourceLocation>)>,
    seen: Vec<String>,
    ast_cache: HashMap<PathBuf, ModuleRc>,
    compiler_inputs: Vec<CompilerInput>,
    import_infos: HashMap<ImportKey, ImportInfo>,
}

impl<B: InputBundle, P: ModuleParser> ImportAnalyzer<'_, B, P> {
    fn resolve_r(&mut self, module: ModuleRc) -> Result<(), CompileError> {
        if self.seen.contains(&module.resolved_path) {
            return Ok(());
        }
        if self
            .path_stack
            .iter()
            .any(|(m, _)| m.resolved_path == module.resolved_path)
        {
            let cycle = self
                .path_stack
                .iter()
                .map(|(m, _)| m.resolved_path.as_str())
                .chain(std::iter::once(module.resolved_path.as_str()))
                .map(|p| format!("\"{p}\""))
                .join(" imports ");
            return Err(CompileError::import_cycle(cycle));
        }

        self.path_stack.push((module.clone(), HashMap::new()));
        let result = self.resolve_body(&module);
        self.path_stack.pop();
        result?;

        self.seen.push(module.resolved_path.clone());
        Ok(())
    }

    fn resolve_body(&mut self, module: &ModuleRc) -> Result<(), CompileError> {
        let imports: Vec<ImportStmt> = module.imports().cloned().collect();
        for stmt in imports {
            self.handle_import(module, &stmt)?;
        }
        Ok(())
    }

    fn handle_import(
        &mut self,
        module: &ModuleRc,
        stmt: &ImportStmt,
    ) -> Result<(), CompileError> {
        let alias = match &stmt.alias {
            Some(alias) => alias.clone(),
            None => {
                // `import x.y` without an alias is ambiguous
                if stmt.kind == crate::ast::ImportKind::Plain
                    && stmt.qualified_name.contains('.')
                {
                    let suggested = stmt
                        .qualified_name
                        .rsplit('.')
                        .next()
                        .unwrap_or(&stmt.qualified_name);
                    return Err(CompileError::structure(
                        format!(
                            "import requires an accompanying `as` statement \
                             (try `import {} as {suggested}`)",
                            stmt.qualified_name
                        ),
                        Some(location_of(stmt)),
                    ));
                }
                stmt.qualified_name
                    .rsplit('.')
                    .next()
                    .unwrap_or(&stmt.qualified_name)
                    .to_string()
            }
        };

        let (input, parsed) =
            self.load_import(module, stmt, &stmt.qualified_name)?;

        self.note_compiler_input(&input);
        self.import_infos.insert(
            (module.resolved_path.clone(), stmt.node.node_id),
            ImportInfo {
                alias,
                qualified_module_name: stmt.qualified_name.clone(),
                input,
                parsed,
            },
        );
        Ok(())
    }

    fn note_compiler_input(&mut self, input: &CompilerInput) {
        let already = self.compiler_inputs.iter().any(|i| {
            i.source_id() == input.source_id()
                && i.resolved_path() == input.resolved_path()
        });
        if !already {
            self.compiler_inputs.push(input.clone());
        }
    }

    fn load_import(
        &mut self,
        module: &ModuleRc,
        stmt: &ImportStmt,
        module_str: &str,
    ) -> Result<(CompilerInput, ParsedImport), CompileError> {
        if is_builtin(stmt.level, module_str) {
            return self.load_builtin_import(module_str);
        }

        let path = import_to_path(stmt.level, module_str);

        // duplicate-import detection within the importing module
        let imported = &mut self
            .path_stack
            .last_mut()
            .expect("current module on stack")
            .1;
        if imported.contains_key(&path) {
            return Err(CompileError::duplicate_import(
                format!("{module_str} imported more than once!"),
                Some(location_of(stmt)),
            ));
        }
        imported.insert(path.clone(), location_of(stmt));

        for suffix in ["vy", "vyi"] {
            let with_suffix = path.with_extension(suffix);
            match self.load_file(module, stmt.level, &with_suffix) {
                Ok(file) => {
                    let ast =
                        self.ast_from_file(&file, suffix == "vyi")?;
                    self.resolve_r(ast.clone())?;
                    return Ok((
                        CompilerInput::File(file),
                        ParsedImport::Module(ast),
                    ));
                }
                Err(CompileError::ModuleNotFound(_)) => continue,
                Err(other) => return Err(other),
            }
        }

        match self.load_file(module, stmt.level, &path.with_extension("json")) {
            Ok(file) => {
                let data: serde_json::Value =
                    serde_json::from_str(&file.contents).map_err(|e| {
                        CompileError::json(format!(
                            "invalid json interface {}: {e}",
                            file.resolved_path.display()
                        ))
                    })?;
                let abi = match &data {
                    serde_json::Value::Object(map) => {
                        map.get("abi").cloned().ok_or_else(|| {
                            CompileError::json(format!(
                                "json interface {} has no `abi` field",
                                file.resolved_path.display()
                            ))
                        })?
                    }
                    serde_json::Value::Array(_) => data.clone(),
                    _ => {
                        return Err(CompileError::json(format!(
                            "unexpected json interface shape in {}",
                            file.resolved_path.display()
                        )))
                    }
                };
                let json = JsonInput { file, data: abi.clone() };
                return Ok((
                    CompilerInput::Json(json),
                    ParsedImport::Abi(abi),
                ));
            }
            Err(CompileError::ModuleNotFound(_)) => {}
            Err(other) => return Err(other),
        }

        let hint = module_str
            .starts_with("vyper.interfaces")
            .then(|| "try renaming `vyper.interfaces` to `ethereum.ercs`".to_string());
        Err(CompileError::module_not_found(module_str.to_string(), hint))
    }

    fn load_file(
        &mut self,
        module: &Module,
        level: u32,
        path: &Path,
    ) -> Result<FileInput, CompileError> {
        let search_paths = if level != 0 {
            // relative import: only the importing module's directory
            let parent = Path::new(&module.resolved_path)
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default();
            vec![parent]
        } else {
            self.absolute_search_paths.clone()
        };
        self.bundle
            .with_search_paths(search_paths, |bundle| bundle.load_file(path))
    }

    fn ast_from_file(
        &mut self,
        file: &FileInput,
        is_interface: bool,
    ) -> Result<ModuleRc, CompileError> {
        if let Some(cached) = self.ast_cache.get(&file.resolved_path) {
            return Ok(cached.clone());
        }
        let ast = self.parser.parse(file, is_interface)?;
        self.ast_cache
            .insert(file.resolved_path.clone(), ast.clone());
        Ok(ast)
    }

    fn load_builtin_import(
        &mut self,
        module_str: &str,
    ) -> Result<(CompilerInput, ParsedImport), CompileError> {
        let prefix = builtin_prefix(module_str).expect("checked by caller");
        let (_, package_root, suffix) = BUILTIN_MODULE_RULES
            .iter()
            .find(|&&(p, ..)| p == prefix)
            .expect("prefix from the rules table");

        let base_name = module_str
            .strip_prefix(prefix)
            .map(|s| s.trim_start_matches('.'))
            .unwrap_or(module_str);
        let rel = if package_root.is_empty() {
            if base_name.is_empty() {
                prefix.replace('.', "/")
            } else {
                base_name.replace('.', "/")
            }
        } else {
            format!("{package_root}/{}", base_name.replace('.', "/"))
        };
        let rel = format!("{rel}{suffix}");

        let Some(&(_, contents)) = BUILTIN_SOURCES
            .iter()
            .find(|&&(path, _)| path == rel)
        else {
            // common migration issue: ERC20 was renamed to IERC20
            let last = module_str.rsplit('.').next().unwrap_or(module_str);
            let hint = last
                .starts_with("ERC")
                .then(|| format!("try renaming `{last}` to `I{last}`"));
            return Err(CompileError::module_not_found(
                module_str.to_string(),
                hint,
            ));
        };

        let file = FileInput {
            source_id: BUILTIN,
            path: PathBuf::from(&rel),
            resolved_path: PathBuf::from(format!("<builtins>/{rel}")),
            contents: contents.to_string(),
        };
        let ast = self.ast_from_file(&file, *suffix == ".vyi")?;
        // builtins have no imports of their own; no recursion needed
        Ok((CompilerInput::File(file), ParsedImport::Module(ast)))
    }
}

fn location_of(stmt: &ImportStmt) -> SourceLocation {
    SourceLocation {
        lineno: stmt.node.lineno,
        col_offset: stmt.node.col_offset,
        end_lineno: Some(stmt.node.end_lineno),
        end_col_offset: Some(stmt.node.end_col_offset),
        node_id: Some(stmt.node.node_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_paths() {
        assert_eq!(import_to_path(0, "a.b.c"), PathBuf::from("a/b/c"));
        assert_eq!(import_to_path(1, "m"), PathBuf::from("./m"));
        assert_eq!(import_to_path(3, "m"), PathBuf::from("../../m"));
    }

    #[test]
    fn builtin_prefixes() {
        assert!(is_builtin(0, "ethereum.ercs.IERC20"));
        assert!(is_builtin(0, "math"));
        assert!(!is_builtin(1, "math"));
        assert!(!is_builtin(0, "mylib.math"));
    }

    #[test]
    fn builtin_sources_are_embedded() {
        assert!(BUILTIN_SOURCES
            .iter()
            .any(|&(p, _)| p == "ethereum/ercs/IERC20.vyi"));
    }
}
