//! Test scaffolding behind the `test-helpers` feature: a front-end for a
//! subset of the surface language (standing in for the external parser and
//! semantic analyzer) and a small EVM interpreter for exercising compiled
//! dispatchers.
//!
//! Nothing here is part of the compiler proper; the pipeline consumes
//! annotated AST through the interfaces in [`crate::imports`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use ethereum_types::U256;

use crate::ast::{
    BinOpKind, CmpOpKind, EventArg, EventDef, Expr, FlagDef, FuncArg,
    FunctionDef, ImportKind, ImportStmt, InitializesDecl, InterfaceDef,
    Module, ModuleRc, NodeInfo, StateMutability, Stmt, StructDef, Target,
    TopLevel, VariableDecl, Visibility, VyType,
};
use crate::error::{CompileError, SourceLocation};
use crate::imports::ModuleParser;
use crate::input_bundle::{FileInput, InputBundle, JsonInputBundle};
use crate::phases::{compile_from_ast, CompilerData};
use crate::pre_parse::{pre_parse, PreParseResult};
use crate::settings::Settings;

mod evm;
pub use evm::{Evm, Outcome};

/// Parser for the test subset of the language; implements the external
/// front-end interface.
#[derive(Debug, Default)]
pub struct TestParser;

impl ModuleParser for TestParser {
    fn parse(
        &self,
        file: &FileInput,
        is_interface: bool,
    ) -> Result<ModuleRc, CompileError> {
        parse_module(
            &file.contents,
            file.source_id,
            &file.path.display().to_string(),
            &file.resolved_path.display().to_string(),
            is_interface,
        )
        .map(Rc::new)
    }
}

/// Compile a standalone source string with no importable files.
pub fn compile_source(
    source: &str,
    caller_settings: Settings,
) -> Result<CompilerData, CompileError> {
    let mut bundle = JsonInputBundle::new([], vec![PathBuf::from(".")])?;
    compile_with_bundle(source, caller_settings, &mut bundle)
}

/// Compile a source string against an input bundle (for import tests).
pub fn compile_with_bundle(
    source: &str,
    caller_settings: Settings,
    bundle: &mut impl InputBundle,
) -> Result<CompilerData, CompileError> {
    let pre = pre_parse(source)?;
    let settings = pre.settings.clone().merge_defaults(&caller_settings);

    let module = Rc::new(parse_module(source, 0, "main.vy", "main.vy", false)?);
    compile_from_ast(module, bundle, &TestParser, &settings, None)
}

/// Parse one module of the test subset.
pub fn parse_module(
    source: &str,
    source_id: i32,
    path: &str,
    resolved_path: &str,
    is_interface: bool,
) -> Result<Module, CompileError> {
    let pre = pre_parse(source)?;
    let mut parser = Parser::new(source, &pre, source_id)?;
    let body = parser.parse_top_level()?;
    Ok(Module {
        node: parser.fresh_node(1, 0, 0),
        source_id,
        path: path.to_string(),
        resolved_path: resolved_path.to_string(),
        is_interface,
        source: source.to_string(),
        body,
    })
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Num(U256),
    Str(String),
    Punct(&'static str),
}

impl Tok {
    fn ident(&self) -> Option<&str> {
        match self {
            Tok::Ident(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Line {
    lineno: u32,
    indent: usize,
    toks: Vec<(Tok, u32)>, // token, start column
}

const PUNCTS: &[&str] = &[
    "...", "**=", "//=", "<<=", ">>=", "->", "**", "//", "<<", ">>", "<=",
    ">=", "==", "!=", "+=", "-=", "*=", "%=", "|=", "&=", "^=", "+", "-",
    "*", "%", "<", ">", "=", "(", ")", "[", "]", ":", ",", ".", "@", "|",
    "&", "^", "~",
];

fn tokenize_line(
    line: &str,
    lineno: u32,
) -> Result<Vec<(Tok, u32)>, CompileError> {
    let bytes = line.as_bytes();
    let mut toks = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c == b'#' {
            break;
        }
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let col = i as u32;
        if c.is_ascii_alphabetic() || c == b'_' {
            let start = i;
            while i < bytes.len()
                && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_')
            {
                i += 1;
            }
            toks.push((Tok::Ident(line[start..i].to_string()), col));
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            let radix = if line[i..].starts_with("0x") { 16 } else { 10 };
            if radix == 16 {
                i += 2;
            }
            while i < bytes.len()
                && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_')
            {
                i += 1;
            }
            let text = line[start..i].replace('_', "");
            let digits = if radix == 16 { &text[2..] } else { &text[..] };
            let value = U256::from_str_radix(digits, radix).map_err(|_| {
                CompileError::syntax(
                    format!("invalid number literal `{text}`"),
                    Some(SourceLocation::at(lineno, col)),
                )
            })?;
            toks.push((Tok::Num(value), col));
            continue;
        }
        if c == b'"' || c == b'\'' {
            let quote = c;
            let start = i + 1;
            i += 1;
            while i < bytes.len() && bytes[i] != quote {
                i += 1;
            }
            toks.push((Tok::Str(line[start..i].to_string()), col));
            i += 1;
            continue;
        }
        let rest = &line[i..];
        let Some(p) = PUNCTS.iter().find(|p| rest.starts_with(**p)) else {
            return Err(CompileError::syntax(
                format!("unexpected character `{}`", rest.chars().next().unwrap()),
                Some(SourceLocation::at(lineno, col)),
            ));
        };
        toks.push((Tok::Punct(p), col));
        i += p.len();
    }
    Ok(toks)
}

struct Parser<'a> {
    lines: Vec<Line>,
    pos: usize,
    node_counter: u32,
    source_id: i32,
    line_offsets: Vec<u32>,
    pre: &'a PreParseResult,
    // the "semantic analyzer": declared module-level names and their types
    state_vars: HashMap<String, VyType>,
    fn_returns: HashMap<String, Option<VyType>>,
    scope: HashMap<String, VyType>,
}

impl<'a> Parser<'a> {
    fn new(
        original_source: &str,
        pre: &'a PreParseResult,
        source_id: i32,
    ) -> Result<Self, CompileError> {
        let mut lines = Vec::new();
        for (idx, raw) in pre.code.lines().enumerate() {
            let lineno = idx as u32 + 1;
            let trimmed = raw.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let indent = raw.len() - trimmed.len();
            let toks = tokenize_line(raw, lineno)?;
            if toks.is_empty() {
                continue;
            }
            lines.push(Line {
                lineno,
                indent,
                toks,
            });
        }

        let mut line_offsets = vec![0u32];
        for line in original_source.lines() {
            let last = *line_offsets.last().expect("seeded");
            line_offsets.push(last + line.len() as u32 + 1);
        }

        let mut parser = Parser {
            lines,
            pos: 0,
            node_counter: 0,
            source_id,
            line_offsets,
            pre,
            state_vars: HashMap::new(),
            fn_returns: HashMap::new(),
            scope: HashMap::new(),
        };
        parser.prescan()?;
        Ok(parser)
    }

    // collect module-level declarations so expressions can be typed no
    // matter where they appear
    fn prescan(&mut self) -> Result<(), CompileError> {
        for i in 0..self.lines.len() {
            let line = self.lines[i].clone();
            if line.indent != 0 {
                continue;
            }
            match &line.toks[..] {
                [(Tok::Ident(name), _), (Tok::Punct(":"), _), rest @ ..]
                    if !rest.is_empty()
                        && name != "initializes" =>
                {
                    let rest = strip_wrappers(rest);
                    if let Ok((typ, _)) =
                        self.parse_type_prefix(rest, line.lineno)
                    {
                        self.state_vars.insert(name.clone(), typ);
                    }
                }
                [(Tok::Ident(def), _), (Tok::Ident(name), _), rest @ ..]
                    if def == "def" =>
                {
                    let returns = rest
                        .windows(2)
                        .position(|w| matches!(w[0].0, Tok::Punct("->")))
                        .map(|i| &rest[i + 1..]);
                    let ret_typ = match returns {
                        Some(toks) => {
                            Some(self.parse_type_prefix(toks, line.lineno)?.0)
                        }
                        None => None,
                    };
                    self.fn_returns.insert(name.clone(), ret_typ);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn fresh_node(&mut self, lineno: u32, col: u32, length: u32) -> NodeInfo {
        self.node_counter += 1;
        let line_start = self
            .line_offsets
            .get(lineno as usize - 1)
            .copied()
            .unwrap_or(0);
        NodeInfo {
            node_id: self.node_counter,
            lineno,
            col_offset: col,
            end_lineno: lineno,
            end_col_offset: col + length,
            src_start: line_start + col,
            src_length: length.max(1),
            source_id: self.source_id.max(0) as u32,
        }
    }

    fn line_node(&mut self, line: &Line) -> NodeInfo {
        let col = line.toks[0].1;
        let last = line.toks.last().expect("nonempty line");
        let end = last.1 + tok_len(&last.0);
        self.fresh_node(line.lineno, col, end.saturating_sub(col))
    }

    fn peek(&self) -> Option<&Line> {
        self.lines.get(self.pos)
    }

    fn bump(&mut self) -> Line {
        let line = self.lines[self.pos].clone();
        self.pos += 1;
        line
    }

    fn err(&self, line: &Line, msg: impl Into<String>) -> CompileError {
        CompileError::syntax(
            msg.into(),
            Some(SourceLocation::at(line.lineno, line.toks[0].1)),
        )
    }

    fn parse_top_level(&mut self) -> Result<Vec<TopLevel>, CompileError> {
        let mut body = Vec::new();
        let mut decorators: Vec<String> = Vec::new();

        while let Some(line) = self.peek().cloned() {
            if line.indent != 0 {
                return Err(self.err(&line, "unexpected indentation"));
            }
            let head = line.toks[0].0.clone();
            match head {
                Tok::Punct("@") => {
                    let line = self.bump();
                    let name = line.toks.get(1).and_then(|(t, _)| t.ident());
                    match name {
                        Some(name) => decorators.push(name.to_string()),
                        None => {
                            return Err(self.err(&line, "malformed decorator"))
                        }
                    }
                }
                Tok::Ident(word) if word == "def" => {
                    let def =
                        self.parse_function(std::mem::take(&mut decorators))?;
                    body.push(TopLevel::FunctionDef(def));
                }
                Tok::Ident(word) if word == "class" => {
                    body.push(self.parse_class()?);
                }
                Tok::Ident(word) if word == "import" => {
                    body.push(TopLevel::Import(self.parse_import()?));
                }
                Tok::Ident(word) if word == "from" => {
                    body.push(TopLevel::Import(self.parse_from_import()?));
                }
                Tok::Ident(word) if word == "initializes" => {
                    let line = self.bump();
                    let alias = match &line.toks[..] {
                        [_, (Tok::Punct(":"), _), (Tok::Ident(alias), _)] => {
                            alias.clone()
                        }
                        _ => {
                            return Err(
                                self.err(&line, "malformed initializes")
                            )
                        }
                    };
                    let node = self.line_node(&line);
                    body.push(TopLevel::InitializesDecl(InitializesDecl {
                        node,
                        module_alias: alias,
                    }));
                }
                Tok::Ident(_) => {
                    body.push(TopLevel::VariableDecl(self.parse_var_decl()?));
                }
                _ => return Err(self.err(&line, "unexpected top-level token")),
            }
        }
        Ok(body)
    }

    fn parse_import(&mut self) -> Result<ImportStmt, CompileError> {
        let line = self.bump();
        let node = self.line_node(&line);
        // import a.b.c [as alias]
        let mut i = 1;
        let mut qualified = String::new();
        while let Some((tok, _)) = line.toks.get(i) {
            match tok {
                Tok::Ident(s) if s == "as" => break,
                Tok::Ident(s) => qualified.push_str(s),
                Tok::Punct(".") => qualified.push('.'),
                _ => return Err(self.err(&line, "malformed import")),
            }
            i += 1;
        }
        let alias = match line.toks.get(i..) {
            Some([(Tok::Ident(_), _), (Tok::Ident(alias), _)]) => {
                Some(alias.clone())
            }
            Some([]) | None => None,
            _ => return Err(self.err(&line, "malformed import alias")),
        };
        Ok(ImportStmt {
            node,
            kind: ImportKind::Plain,
            qualified_name: qualified,
            level: 0,
            alias,
        })
    }

    fn parse_from_import(&mut self) -> Result<ImportStmt, CompileError> {
        let line = self.bump();
        let node = self.line_node(&line);
        // from [.]*a.b import c [as alias]
        let mut i = 1;
        let mut level = 0u32;
        while let Some((Tok::Punct("."), _)) = line.toks.get(i) {
            level += 1;
            i += 1;
        }
        let mut module = String::new();
        while let Some((tok, _)) = line.toks.get(i) {
            match tok {
                Tok::Ident(s) if s == "import" => break,
                Tok::Ident(s) => module.push_str(s),
                Tok::Punct(".") => module.push('.'),
                _ => return Err(self.err(&line, "malformed from-import")),
            }
            i += 1;
        }
        i += 1; // "import"
        let name = match line.toks.get(i) {
            Some((Tok::Ident(name), _)) => name.clone(),
            _ => return Err(self.err(&line, "malformed from-import")),
        };
        let alias = match line.toks.get(i + 1..) {
            Some([(Tok::Ident(_), _), (Tok::Ident(alias), _)]) => {
                Some(alias.clone())
            }
            Some([]) | None => None,
            _ => return Err(self.err(&line, "malformed import alias")),
        };
        let qualified = if module.is_empty() {
            name
        } else {
            format!("{module}.{name}")
        };
        // relative imports are level >= 1 (current dir) in the core's terms
        let level = if level > 0 { level } else { 0 };
        Ok(ImportStmt {
            node,
            kind: ImportKind::From,
            qualified_name: qualified,
            level,
            alias,
        })
    }

    fn parse_var_decl(&mut self) -> Result<VariableDecl, CompileError> {
        let line = self.bump();
        let node = self.line_node(&line);
        let name = match &line.toks[0].0 {
            Tok::Ident(name) => name.clone(),
            _ => return Err(self.err(&line, "expected a name")),
        };
        if !matches!(line.toks.get(1), Some((Tok::Punct(":"), _))) {
            return Err(self.err(&line, "expected `:` after name"));
        }

        let mut rest = &line.toks[2..];
        let mut is_public = false;
        let mut is_constant = false;
        let mut is_immutable = false;
        let mut is_transient = false;

        // unwrap public(...) / constant(...) / immutable(...) / transient(...)
        loop {
            match rest {
                [(Tok::Ident(w), _), (Tok::Punct("("), _), inner @ ..]
                    if matches!(
                        w.as_str(),
                        "public" | "constant" | "immutable" | "transient"
                    ) =>
                {
                    match w.as_str() {
                        "public" => is_public = true,
                        "constant" => is_constant = true,
                        "immutable" => is_immutable = true,
                        _ => is_transient = true,
                    }
                    // strip the matching close paren
                    let close = matching_paren(inner).ok_or_else(|| {
                        self.err(&line, "unbalanced parentheses")
                    })?;
                    rest = &inner[..close];
                }
                _ => break,
            }
        }

        let (typ, _) = self.parse_type_prefix(rest, line.lineno)?;

        // the initializer, if any, sits after the type (and after any
        // wrapper's closing paren)
        let value = match line
            .toks
            .iter()
            .rposition(|(t, _)| matches!(t, Tok::Punct("=")))
        {
            Some(eq) => {
                let mut cursor = Cursor::new(&line.toks[eq + 1..]);
                Some(self.parse_expr(&mut cursor, &line)?)
            }
            None => None,
        };

        self.state_vars.insert(name.clone(), typ.clone());

        Ok(VariableDecl {
            node,
            name,
            typ,
            is_public,
            is_constant,
            is_immutable,
            is_transient,
            value,
        })
    }

    // parse a type from a token prefix, returning it and the token count
    fn parse_type_prefix(
        &mut self,
        toks: &[(Tok, u32)],
        lineno: u32,
    ) -> Result<(VyType, usize), CompileError> {
        let loc = Some(SourceLocation::at(lineno, 0));
        let name = toks
            .first()
            .and_then(|(t, _)| t.ident())
            .ok_or_else(|| CompileError::syntax("expected a type", loc))?;
        match name {
            "uint256" => Ok((VyType::Uint256, 1)),
            "int256" => Ok((VyType::Int256, 1)),
            "bool" => Ok((VyType::Bool, 1)),
            "address" => Ok((VyType::Address, 1)),
            "bytes32" => Ok((VyType::Bytes32, 1)),
            "HashMap" => {
                // HashMap[key, value]
                if !matches!(toks.get(1), Some((Tok::Punct("["), _))) {
                    return Err(CompileError::syntax(
                        "malformed HashMap type",
                        loc,
                    ));
                }
                let (key, klen) =
                    self.parse_type_prefix(&toks[2..], lineno)?;
                if !matches!(toks.get(2 + klen), Some((Tok::Punct(","), _))) {
                    return Err(CompileError::syntax(
                        "malformed HashMap type",
                        loc,
                    ));
                }
                let (value, vlen) =
                    self.parse_type_prefix(&toks[3 + klen..], lineno)?;
                if !matches!(
                    toks.get(3 + klen + vlen),
                    Some((Tok::Punct("]"), _))
                ) {
                    return Err(CompileError::syntax(
                        "malformed HashMap type",
                        loc,
                    ));
                }
                Ok((
                    VyType::HashMap(Box::new(key), Box::new(value)),
                    4 + klen + vlen,
                ))
            }
            other => Err(CompileError::syntax(
                format!("unknown type `{other}`"),
                loc,
            )),
        }
    }

    fn parse_class(&mut self) -> Result<TopLevel, CompileError> {
        let line = self.bump();
        let node = self.line_node(&line);
        let name = match line.toks.get(1).and_then(|(t, _)| t.ident()) {
            Some(name) => name.to_string(),
            None => return Err(self.err(&line, "malformed declaration")),
        };

        let kind = self
            .pre
            .modification_offsets
            .get(&(line.lineno, line.toks[0].1))
            .map(String::as_str)
            .unwrap_or("StructDef");

        let mut fields = Vec::new();
        while let Some(next) = self.peek() {
            if next.indent <= line.indent {
                break;
            }
            let field_line = self.bump();
            match &field_line.toks[..] {
                [(Tok::Ident(w), _)] if w == "pass" => break,
                [(Tok::Punct("..."), _)] => break,
                [(Tok::Ident(fname), _), (Tok::Punct(":"), _), rest @ ..] => {
                    let (typ, indexed) = match rest {
                        [(Tok::Ident(w), _), (Tok::Punct("("), _), inner @ ..]
                            if w == "indexed" =>
                        {
                            let close = matching_paren(inner).ok_or_else(
                                || {
                                    self.err(
                                        &field_line,
                                        "unbalanced parentheses",
                                    )
                                },
                            )?;
                            (
                                self.parse_type_prefix(
                                    &inner[..close],
                                    field_line.lineno,
                                )?
                                .0,
                                true,
                            )
                        }
                        _ => (
                            self.parse_type_prefix(rest, field_line.lineno)?.0,
                            false,
                        ),
                    };
                    fields.push((fname.clone(), typ, indexed));
                }
                _ => return Err(self.err(&field_line, "malformed field")),
            }
        }

        Ok(match kind {
            "EventDef" => TopLevel::EventDef(EventDef {
                node,
                name,
                args: fields
                    .into_iter()
                    .map(|(name, typ, indexed)| EventArg {
                        name,
                        typ,
                        indexed,
                    })
                    .collect(),
            }),
            "InterfaceDef" => {
                TopLevel::InterfaceDef(InterfaceDef { node, name })
            }
            "FlagDef" => TopLevel::FlagDef(FlagDef {
                node,
                name,
                members: vec![],
            }),
            _ => TopLevel::StructDef(StructDef {
                node,
                name,
                fields: fields
                    .into_iter()
                    .map(|(name, typ, _)| (name, typ))
                    .collect(),
            }),
        })
    }

    fn parse_function(
        &mut self,
        decorators: Vec<String>,
    ) -> Result<FunctionDef, CompileError> {
        let line = self.bump();
        let node = self.line_node(&line);
        let name = match line.toks.get(1).and_then(|(t, _)| t.ident()) {
            Some(name) => name.to_string(),
            None => return Err(self.err(&line, "malformed function header")),
        };

        // arguments between ( and )
        let open = line
            .toks
            .iter()
            .position(|(t, _)| matches!(t, Tok::Punct("(")))
            .ok_or_else(|| self.err(&line, "malformed function header"))?;
        let close = open
            + 1
            + matching_paren(&line.toks[open + 1..])
                .ok_or_else(|| self.err(&line, "unbalanced parentheses"))?;

        let mut args = Vec::new();
        let mut cursor = open + 1;
        while cursor < close {
            let arg_name = match line.toks.get(cursor).and_then(|(t, _)| t.ident())
            {
                Some(n) => n.to_string(),
                None => return Err(self.err(&line, "malformed argument")),
            };
            if !matches!(line.toks.get(cursor + 1), Some((Tok::Punct(":"), _)))
            {
                return Err(self.err(&line, "argument needs a type"));
            }
            let (typ, tlen) = self
                .parse_type_prefix(&line.toks[cursor + 2..], line.lineno)?;
            args.push(FuncArg {
                name: arg_name,
                typ,
            });
            cursor += 2 + tlen;
            if matches!(line.toks.get(cursor), Some((Tok::Punct(","), _))) {
                cursor += 1;
            }
        }

        let returns = line.toks[close..]
            .windows(2)
            .position(|w| matches!(w[0].0, Tok::Punct("->")))
            .map(|i| {
                self.parse_type_prefix(
                    &line.toks[close + i + 1..],
                    line.lineno,
                )
                .map(|(t, _)| t)
            })
            .transpose()?;

        let visibility = if decorators.iter().any(|d| d == "internal") {
            Visibility::Internal
        } else {
            Visibility::External
        };
        let mutability = if decorators.iter().any(|d| d == "payable") {
            StateMutability::Payable
        } else if decorators.iter().any(|d| d == "view") {
            StateMutability::View
        } else if decorators.iter().any(|d| d == "pure") {
            StateMutability::Pure
        } else {
            StateMutability::Nonpayable
        };
        let nonreentrant = decorators.iter().any(|d| d == "nonreentrant");

        self.scope.clear();
        for arg in &args {
            self.scope.insert(arg.name.clone(), arg.typ.clone());
        }
        let body = self.parse_block(line.indent)?;

        Ok(FunctionDef {
            node,
            name,
            args,
            returns,
            body,
            visibility,
            mutability,
            nonreentrant,
        })
    }

    fn parse_block(&mut self, parent_indent: usize) -> Result<Vec<Stmt>, CompileError> {
        let Some(first) = self.peek() else {
            return Ok(vec![]);
        };
        let indent = first.indent;
        if indent <= parent_indent {
            return Ok(vec![]);
        }

        let mut stmts = Vec::new();
        while let Some(line) = self.peek().cloned() {
            if line.indent < indent {
                break;
            }
            if line.indent > indent {
                return Err(self.err(&line, "unexpected indentation"));
            }
            stmts.push(self.parse_stmt(&line)?);
        }
        Ok(stmts)
    }

    fn parse_stmt(&mut self, line: &Line) -> Result<Stmt, CompileError> {
        let node = self.line_node(line);
        let toks = line.toks.clone();

        // statements recognized by their head token
        if let Some(word) = toks[0].0.ident() {
            match word {
                "pass" => {
                    self.bump();
                    return Ok(Stmt::Pass { node });
                }
                "break" => {
                    self.bump();
                    return Ok(Stmt::Break { node });
                }
                "continue" => {
                    self.bump();
                    return Ok(Stmt::Continue { node });
                }
                "raise" => {
                    self.bump();
                    return Ok(Stmt::Raise { node });
                }
                "return" => {
                    self.bump();
                    let value = if toks.len() > 1 {
                        let mut cursor = Cursor::new(&toks[1..]);
                        Some(self.parse_expr(&mut cursor, line)?)
                    } else {
                        None
                    };
                    return Ok(Stmt::Return { node, value });
                }
                "assert" => {
                    self.bump();
                    let mut cursor = Cursor::new(&toks[1..]);
                    let cond = self.parse_expr(&mut cursor, line)?;
                    return Ok(Stmt::Assert { node, cond });
                }
                // the pre-parser rewrote `log` into `yield`
                "yield" => {
                    self.bump();
                    let event = toks
                        .get(1)
                        .and_then(|(t, _)| t.ident())
                        .ok_or_else(|| self.err(line, "malformed log"))?
                        .to_string();
                    let close = matching_paren(&toks[3..])
                        .ok_or_else(|| self.err(line, "malformed log"))?;
                    let args = self.parse_expr_list(&toks[3..3 + close], line)?;
                    return Ok(Stmt::Log {
                        node,
                        event,
                        args,
                    });
                }
                "if" => return self.parse_if(line.indent),
                "for" => return self.parse_for(line.indent),
                _ => {}
            }
        }

        // ellipsis bodies in interface files are empty
        if matches!(toks[0].0, Tok::Punct("...")) {
            self.bump();
            return Ok(Stmt::Pass { node });
        }

        // local declaration: name ':' type ['=' expr]
        if let (Some(name), Some((Tok::Punct(":"), _))) =
            (toks[0].0.ident(), toks.get(1))
        {
            let (typ, tlen) =
                self.parse_type_prefix(&toks[2..], line.lineno)?;
            self.bump();
            let value = match toks.get(2 + tlen..) {
                Some([(Tok::Punct("="), _), rest @ ..]) => {
                    let mut cursor = Cursor::new(rest);
                    self.parse_expr(&mut cursor, line)?
                }
                _ => {
                    return Err(
                        self.err(line, "local declaration needs a value")
                    )
                }
            };
            self.scope.insert(name.to_string(), typ.clone());
            return Ok(Stmt::LocalDecl {
                node,
                name: name.to_string(),
                typ,
                value,
            });
        }

        // assignment (`==`, `+=` and friends tokenize as single operators,
        // so a bare `=` always means plain assignment)
        if let Some(eq) = toks
            .iter()
            .position(|(t, _)| matches!(t, Tok::Punct("=")))
        {
            let target = self.parse_target(&toks[..eq], line)?;
            self.bump();
            let mut cursor = Cursor::new(&toks[eq + 1..]);
            let value = self.parse_expr(&mut cursor, line)?;
            return Ok(Stmt::Assign {
                node,
                target,
                value,
            });
        }
        // augmented assignment with a multi-char operator token (+=, -=, ...)
        if let Some(pos) = toks.iter().position(|(t, _)| {
            matches!(t, Tok::Punct(p) if p.len() >= 2 && p.ends_with('=')
                && !matches!(*p, "==" | "!=" | "<=" | ">="))
        }) {
            let op = match &toks[pos].0 {
                Tok::Punct(p) => aug_op(&p[..p.len() - 1])
                    .ok_or_else(|| self.err(line, "unknown operator"))?,
                _ => unreachable!(),
            };
            let target = self.parse_target(&toks[..pos], line)?;
            self.bump();
            let mut cursor = Cursor::new(&toks[pos + 1..]);
            let value = self.parse_expr(&mut cursor, line)?;
            return Ok(Stmt::AugAssign {
                node,
                op,
                target,
                value,
            });
        }

        self.bump();
        let mut cursor = Cursor::new(&toks);
        let expr = self.parse_expr(&mut cursor, line)?;
        Ok(Stmt::Expr(expr))
    }

    fn parse_if(&mut self, indent: usize) -> Result<Stmt, CompileError> {
        let line = self.bump();
        let node = self.line_node(&line);
        let colon = line
            .toks
            .iter()
            .rposition(|(t, _)| matches!(t, Tok::Punct(":")))
            .ok_or_else(|| self.err(&line, "malformed if"))?;
        let mut cursor = Cursor::new(&line.toks[1..colon]);
        let cond = self.parse_expr(&mut cursor, &line)?;
        let then = self.parse_block(indent)?;

        let mut orelse = Vec::new();
        if let Some(next) = self.peek().cloned() {
            if next.indent == indent {
                match next.toks[0].0.ident() {
                    Some("else") => {
                        self.bump();
                        orelse = self.parse_block(indent)?;
                    }
                    Some("elif") => {
                        // rewrite elif into a nested if
                        let mut rewritten = next.clone();
                        rewritten.toks[0].0 = Tok::Ident("if".into());
                        self.lines[self.pos] = rewritten;
                        orelse = vec![self.parse_if(indent)?];
                    }
                    _ => {}
                }
            }
        }

        Ok(Stmt::If {
            node,
            cond,
            then,
            orelse,
        })
    }

    fn parse_for(&mut self, indent: usize) -> Result<Stmt, CompileError> {
        let line = self.bump();
        let node = self.line_node(&line);
        // for <var> in range(stop) / range(start, stop)
        let var = line
            .toks
            .get(1)
            .and_then(|(t, _)| t.ident())
            .ok_or_else(|| self.err(&line, "malformed for"))?
            .to_string();

        let typ = match self.pre.loop_var_annotations.get(&line.lineno) {
            Some(annotation) => match annotation.as_str() {
                "uint256" => VyType::Uint256,
                "int256" => VyType::Int256,
                other => {
                    return Err(self.err(
                        &line,
                        format!("unsupported loop variable type `{other}`"),
                    ))
                }
            },
            None => VyType::Uint256,
        };

        let range_pos = line
            .toks
            .iter()
            .position(|(t, _)| t.ident() == Some("range"))
            .ok_or_else(|| self.err(&line, "for loops iterate over range"))?;
        let close = matching_paren(&line.toks[range_pos + 2..])
            .ok_or_else(|| self.err(&line, "unbalanced parentheses"))?;
        let args = self.parse_expr_list(
            &line.toks[range_pos + 2..range_pos + 2 + close],
            &line,
        )?;
        let (start, stop) = match args.len() {
            1 => (None, args.into_iter().next().expect("checked")),
            2 => {
                let mut it = args.into_iter();
                (Some(it.next().expect("checked")), it.next().expect("checked"))
            }
            _ => return Err(self.err(&line, "range takes 1 or 2 arguments")),
        };

        self.scope.insert(var.clone(), typ.clone());
        let body = self.parse_block(indent)?;
        self.scope.remove(&var);

        Ok(Stmt::For {
            node,
            var,
            typ,
            start,
            stop,
            body,
        })
    }

    fn parse_target(
        &mut self,
        toks: &[(Tok, u32)],
        line: &Line,
    ) -> Result<Target, CompileError> {
        match toks {
            [(Tok::Ident(name), _)] if name != "self" => {
                Ok(Target::Name(name.clone()))
            }
            [(Tok::Ident(s), _), (Tok::Punct("."), _), (Tok::Ident(attr), _)]
                if s == "self" =>
            {
                Ok(Target::SelfAttr(attr.clone()))
            }
            [(Tok::Ident(s), _), (Tok::Punct("."), _), (Tok::Ident(attr), _), (Tok::Punct("["), _), key @ .., (Tok::Punct("]"), _)]
                if s == "self" =>
            {
                let mut cursor = Cursor::new(key);
                let key = self.parse_expr(&mut cursor, line)?;
                Ok(Target::SelfSubscript {
                    attr: attr.clone(),
                    key: Box::new(key),
                })
            }
            _ => Err(self.err(line, "unsupported assignment target")),
        }
    }

    fn parse_expr_list(
        &mut self,
        toks: &[(Tok, u32)],
        line: &Line,
    ) -> Result<Vec<Expr>, CompileError> {
        let mut out = Vec::new();
        let mut depth = 0i32;
        let mut start = 0usize;
        for (i, (tok, _)) in toks.iter().enumerate() {
            match tok {
                Tok::Punct("(") | Tok::Punct("[") => depth += 1,
                Tok::Punct(")") | Tok::Punct("]") => depth -= 1,
                Tok::Punct(",") if depth == 0 => {
                    let mut cursor = Cursor::new(&toks[start..i]);
                    out.push(self.parse_expr(&mut cursor, line)?);
                    start = i + 1;
                }
                _ => {}
            }
        }
        if start < toks.len() {
            let mut cursor = Cursor::new(&toks[start..]);
            out.push(self.parse_expr(&mut cursor, line)?);
        }
        Ok(out)
    }

    // precedence-climbing expression parser
    fn parse_expr(
        &mut self,
        cursor: &mut Cursor<'_>,
        line: &Line,
    ) -> Result<Expr, CompileError> {
        self.parse_or(cursor, line)
    }

    fn parse_or(
        &mut self,
        cursor: &mut Cursor<'_>,
        line: &Line,
    ) -> Result<Expr, CompileError> {
        let mut left = self.parse_and(cursor, line)?;
        while cursor.eat_ident("or") {
            let right = self.parse_and(cursor, line)?;
            let node = self.fresh_node(line.lineno, line.toks[0].1, 1);
            left = Expr::BoolOp {
                node,
                is_and: false,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(
        &mut self,
        cursor: &mut Cursor<'_>,
        line: &Line,
    ) -> Result<Expr, CompileError> {
        let mut left = self.parse_not(cursor, line)?;
        while cursor.eat_ident("and") {
            let right = self.parse_not(cursor, line)?;
            let node = self.fresh_node(line.lineno, line.toks[0].1, 1);
            left = Expr::BoolOp {
                node,
                is_and: true,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_not(
        &mut self,
        cursor: &mut Cursor<'_>,
        line: &Line,
    ) -> Result<Expr, CompileError> {
        if cursor.eat_ident("not") {
            let operand = self.parse_not(cursor, line)?;
            let node = self.fresh_node(line.lineno, line.toks[0].1, 3);
            return Ok(Expr::Not {
                node,
                operand: Box::new(operand),
            });
        }
        self.parse_comparison(cursor, line)
    }

    fn parse_comparison(
        &mut self,
        cursor: &mut Cursor<'_>,
        line: &Line,
    ) -> Result<Expr, CompileError> {
        let left = self.parse_bitor(cursor, line)?;
        let op = match cursor.peek_punct() {
            Some("==") => CmpOpKind::Eq,
            Some("!=") => CmpOpKind::Ne,
            Some("<") => CmpOpKind::Lt,
            Some("<=") => CmpOpKind::Le,
            Some(">") => CmpOpKind::Gt,
            Some(">=") => CmpOpKind::Ge,
            _ => return Ok(left),
        };
        cursor.bump();
        let right = self.parse_bitor(cursor, line)?;
        let operand_typ = self
            .infer_type(&left)
            .or_else(|| self.infer_type(&right))
            .unwrap_or(VyType::Uint256);
        let node = self.fresh_node(line.lineno, line.toks[0].1, 1);
        Ok(Expr::Compare {
            node,
            op,
            left: Box::new(left),
            right: Box::new(right),
            operand_typ,
        })
    }

    fn parse_binop_level(
        &mut self,
        cursor: &mut Cursor<'_>,
        line: &Line,
        ops: &[(&str, BinOpKind)],
        next: fn(
            &mut Self,
            &mut Cursor<'_>,
            &Line,
        ) -> Result<Expr, CompileError>,
    ) -> Result<Expr, CompileError> {
        let mut left = next(self, cursor, line)?;
        loop {
            let Some(p) = cursor.peek_punct() else { break };
            let Some(&(_, op)) = ops.iter().find(|(s, _)| *s == p) else {
                break;
            };
            cursor.bump();
            let right = next(self, cursor, line)?;
            let typ = self
                .infer_type(&left)
                .or_else(|| self.infer_type(&right))
                .unwrap_or(VyType::Uint256);
            let node = self.fresh_node(line.lineno, line.toks[0].1, 1);
            left = Expr::BinOp {
                node,
                op,
                left: Box::new(left),
                right: Box::new(right),
                typ,
            };
        }
        Ok(left)
    }

    fn parse_bitor(
        &mut self,
        cursor: &mut Cursor<'_>,
        line: &Line,
    ) -> Result<Expr, CompileError> {
        self.parse_binop_level(
            cursor,
            line,
            &[("|", BinOpKind::BitOr)],
            Self::parse_bitxor,
        )
    }

    fn parse_bitxor(
        &mut self,
        cursor: &mut Cursor<'_>,
        line: &Line,
    ) -> Result<Expr, CompileError> {
        self.parse_binop_level(
            cursor,
            line,
            &[("^", BinOpKind::BitXor)],
            Self::parse_bitand,
        )
    }

    fn parse_bitand(
        &mut self,
        cursor: &mut Cursor<'_>,
        line: &Line,
    ) -> Result<Expr, CompileError> {
        self.parse_binop_level(
            cursor,
            line,
            &[("&", BinOpKind::BitAnd)],
            Self::parse_shift,
        )
    }

    fn parse_shift(
        &mut self,
        cursor: &mut Cursor<'_>,
        line: &Line,
    ) -> Result<Expr, CompileError> {
        self.parse_binop_level(
            cursor,
            line,
            &[("<<", BinOpKind::Shl), (">>", BinOpKind::Shr)],
            Self::parse_additive,
        )
    }

    fn parse_additive(
        &mut self,
        cursor: &mut Cursor<'_>,
        line: &Line,
    ) -> Result<Expr, CompileError> {
        self.parse_binop_level(
            cursor,
            line,
            &[("+", BinOpKind::Add), ("-", BinOpKind::Sub)],
            Self::parse_multiplicative,
        )
    }

    fn parse_multiplicative(
        &mut self,
        cursor: &mut Cursor<'_>,
        line: &Line,
    ) -> Result<Expr, CompileError> {
        self.parse_binop_level(
            cursor,
            line,
            &[
                ("*", BinOpKind::Mul),
                ("//", BinOpKind::Div),
                ("%", BinOpKind::Mod),
            ],
            Self::parse_power,
        )
    }

    fn parse_power(
        &mut self,
        cursor: &mut Cursor<'_>,
        line: &Line,
    ) -> Result<Expr, CompileError> {
        self.parse_binop_level(
            cursor,
            line,
            &[("**", BinOpKind::Pow)],
            Self::parse_unary,
        )
    }

    fn parse_unary(
        &mut self,
        cursor: &mut Cursor<'_>,
        line: &Line,
    ) -> Result<Expr, CompileError> {
        if cursor.eat_punct("-") {
            let operand = self.parse_unary(cursor, line)?;
            let node = self.fresh_node(line.lineno, line.toks[0].1, 1);
            return Ok(Expr::Neg {
                node,
                operand: Box::new(operand),
            });
        }
        self.parse_atom(cursor, line)
    }

    fn parse_atom(
        &mut self,
        cursor: &mut Cursor<'_>,
        line: &Line,
    ) -> Result<Expr, CompileError> {
        let Some((tok, col)) = cursor.bump() else {
            return Err(self.err(line, "unexpected end of expression"));
        };
        match tok {
            Tok::Num(value) => {
                let node =
                    self.fresh_node(line.lineno, col, 1);
                Ok(Expr::Int {
                    node,
                    value,
                    typ: VyType::Uint256,
                })
            }
            Tok::Punct("(") => {
                let expr = self.parse_expr(cursor, line)?;
                if !cursor.eat_punct(")") {
                    return Err(self.err(line, "expected `)`"));
                }
                Ok(expr)
            }
            Tok::Ident(word) => match word.as_str() {
                "True" | "False" => {
                    let node = self.fresh_node(line.lineno, col, 4);
                    Ok(Expr::Bool {
                        node,
                        value: word == "True",
                    })
                }
                "self" => self.parse_self_expr(cursor, line, col),
                "msg" | "block" | "tx" | "chain" => {
                    if !cursor.eat_punct(".") {
                        return Err(self.err(line, "expected attribute"));
                    }
                    let attr = cursor
                        .bump_ident()
                        .ok_or_else(|| self.err(line, "expected attribute"))?;
                    let node = self.fresh_node(line.lineno, col, 1);
                    Ok(Expr::EnvAttr {
                        node,
                        base: word,
                        attr,
                    })
                }
                name => {
                    let node = self.fresh_node(
                        line.lineno,
                        col,
                        name.len() as u32,
                    );
                    Ok(Expr::Name {
                        node,
                        name: name.to_string(),
                    })
                }
            },
            other => Err(self.err(
                line,
                format!("unexpected token in expression: {other:?}"),
            )),
        }
    }

    fn parse_self_expr(
        &mut self,
        cursor: &mut Cursor<'_>,
        line: &Line,
        col: u32,
    ) -> Result<Expr, CompileError> {
        if !cursor.eat_punct(".") {
            return Err(self.err(line, "bare `self` is not supported"));
        }
        let attr = cursor
            .bump_ident()
            .ok_or_else(|| self.err(line, "expected attribute"))?;
        let node = self.fresh_node(line.lineno, col, attr.len() as u32 + 5);

        if attr == "balance" && !self.state_vars.contains_key("balance") {
            return Ok(Expr::EnvAttr {
                node,
                base: "self".into(),
                attr,
            });
        }

        if cursor.eat_punct("[") {
            let key = self.parse_expr(cursor, line)?;
            if !cursor.eat_punct("]") {
                return Err(self.err(line, "expected `]`"));
            }
            return Ok(Expr::SelfSubscript {
                node,
                attr,
                key: Box::new(key),
            });
        }

        if cursor.eat_punct("(") {
            let mut args = Vec::new();
            if !cursor.eat_punct(")") {
                loop {
                    args.push(self.parse_expr(cursor, line)?);
                    if cursor.eat_punct(",") {
                        continue;
                    }
                    if cursor.eat_punct(")") {
                        break;
                    }
                    return Err(self.err(line, "expected `,` or `)`"));
                }
            }
            return Ok(Expr::SelfCall {
                node,
                method: attr,
                args,
            });
        }

        Ok(Expr::SelfAttr { node, attr })
    }

    // just enough inference to pick signed vs unsigned opcodes
    fn infer_type(&self, expr: &Expr) -> Option<VyType> {
        match expr {
            Expr::Int { .. } => None,
            Expr::Bool { .. } => Some(VyType::Bool),
            Expr::Name { name, .. } => self.scope.get(name).cloned(),
            Expr::SelfAttr { attr, .. } => self.state_vars.get(attr).cloned(),
            Expr::SelfSubscript { attr, .. } => {
                match self.state_vars.get(attr) {
                    Some(VyType::HashMap(_, value)) => {
                        Some((**value).clone())
                    }
                    _ => None,
                }
            }
            Expr::EnvAttr { base, attr, .. } => {
                match (base.as_str(), attr.as_str()) {
                    ("msg", "sender") | ("tx", "origin") => {
                        Some(VyType::Address)
                    }
                    _ => Some(VyType::Uint256),
                }
            }
            Expr::BinOp { typ, .. } => Some(typ.clone()),
            Expr::Compare { .. } | Expr::BoolOp { .. } | Expr::Not { .. } => {
                Some(VyType::Bool)
            }
            Expr::Neg { .. } => Some(VyType::Int256),
            Expr::SelfCall { method, .. } => {
                self.fn_returns.get(method).cloned().flatten()
            }
        }
    }
}

fn tok_len(tok: &Tok) -> u32 {
    match tok {
        Tok::Ident(s) => s.len() as u32,
        Tok::Num(_) => 1,
        Tok::Str(s) => s.len() as u32 + 2,
        Tok::Punct(p) => p.len() as u32,
    }
}

fn aug_op(p: &str) -> Option<BinOpKind> {
    Some(match p {
        "+" => BinOpKind::Add,
        "-" => BinOpKind::Sub,
        "*" => BinOpKind::Mul,
        "//" => BinOpKind::Div,
        "%" => BinOpKind::Mod,
        "**" => BinOpKind::Pow,
        "|" => BinOpKind::BitOr,
        "&" => BinOpKind::BitAnd,
        "^" => BinOpKind::BitXor,
        "<<" => BinOpKind::Shl,
        ">>" => BinOpKind::Shr,
        _ => return None,
    })
}

// peel `public(...)` / `constant(...)` / `immutable(...)` / `transient(...)`
fn strip_wrappers(mut toks: &[(Tok, u32)]) -> &[(Tok, u32)] {
    loop {
        match toks {
            [(Tok::Ident(w), _), (Tok::Punct("("), _), inner @ ..]
                if matches!(
                    w.as_str(),
                    "public" | "constant" | "immutable" | "transient"
                ) =>
            {
                match matching_paren(inner) {
                    Some(close) => toks = &inner[..close],
                    None => return toks,
                }
            }
            _ => return toks,
        }
    }
}

// index of the parenthesis closing depth zero, relative to `toks`
fn matching_paren(toks: &[(Tok, u32)]) -> Option<usize> {
    let mut depth = 0usize;
    for (i, (tok, _)) in toks.iter().enumerate() {
        match tok {
            Tok::Punct("(") | Tok::Punct("[") => depth += 1,
            Tok::Punct(")") | Tok::Punct("]") => {
                if depth == 0 {
                    return Some(i);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    None
}

struct Cursor<'a> {
    toks: &'a [(Tok, u32)],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(toks: &'a [(Tok, u32)]) -> Self {
        Cursor { toks, pos: 0 }
    }

    fn bump(&mut self) -> Option<(Tok, u32)> {
        let t = self.toks.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn bump_ident(&mut self) -> Option<String> {
        match self.toks.get(self.pos) {
            Some((Tok::Ident(s), _)) => {
                self.pos += 1;
                Some(s.clone())
            }
            _ => None,
        }
    }

    fn peek_punct(&self) -> Option<&'static str> {
        match self.toks.get(self.pos) {
            Some((Tok::Punct(p), _)) => Some(p),
            _ => None,
        }
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.peek_punct() == Some(p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_ident(&mut self, word: &str) -> bool {
        match self.toks.get(self.pos) {
            Some((Tok::Ident(s), _)) if s == word => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{CmpOpKind, Visibility};

    fn parse(src: &str) -> Module {
        parse_module(src, 0, "t.vy", "t.vy", false).unwrap()
    }

    #[test]
    fn parses_function_headers() {
        let module = parse(
            "@external\n@payable\ndef f(x: uint256, y: address) -> bool:\n    return True\n",
        );
        let f = module.functions().next().unwrap();
        assert_eq!(f.name, "f");
        assert_eq!(f.visibility, Visibility::External);
        assert_eq!(f.mutability, StateMutability::Payable);
        assert_eq!(f.args.len(), 2);
        assert_eq!(f.args[1].typ, VyType::Address);
        assert_eq!(f.returns, Some(VyType::Bool));
        assert_eq!(f.signature(), "f(uint256,address)");
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let module = parse(
            "@external\ndef f() -> uint256:\n    return 1 + 2 * 3\n",
        );
        let f = module.functions().next().unwrap();
        let Stmt::Return {
            value: Some(Expr::BinOp { op, right, .. }),
            ..
        } = &f.body[0]
        else {
            panic!("expected return of a binop");
        };
        assert_eq!(*op, BinOpKind::Add);
        assert!(matches!(
            &**right,
            Expr::BinOp {
                op: BinOpKind::Mul,
                ..
            }
        ));
    }

    #[test]
    fn comparisons_pick_up_operand_signedness() {
        let module = parse(
            "@external\ndef f() -> bool:\n    x: int256 = 1\n    return x < 2\n",
        );
        let f = module.functions().next().unwrap();
        let Stmt::Return {
            value:
                Some(Expr::Compare {
                    op, operand_typ, ..
                }),
            ..
        } = &f.body[1]
        else {
            panic!("expected return of a comparison");
        };
        assert_eq!(*op, CmpOpKind::Lt);
        assert_eq!(*operand_typ, VyType::Int256);
    }

    #[test]
    fn parses_state_and_events() {
        let module = parse(
            "\
x: public(uint256)
m: HashMap[address, uint256]

event Gone:
    who: indexed(address)
",
        );
        let x = module.variables().next().unwrap();
        assert!(x.is_public);
        assert_eq!(x.typ, VyType::Uint256);
        let m = module.variables().nth(1).unwrap();
        assert!(matches!(m.typ, VyType::HashMap(..)));
        let event = module.events().next().unwrap();
        assert_eq!(event.name, "Gone");
        assert!(event.args[0].indexed);
    }

    #[test]
    fn parses_imports_with_levels() {
        let module = parse("from ..pkg import mod as m\nimport a.b as ab\n");
        let mut imports = module.imports();
        let first = imports.next().unwrap();
        assert_eq!(first.level, 2);
        assert_eq!(first.qualified_name, "pkg.mod");
        assert_eq!(first.alias.as_deref(), Some("m"));
        let second = imports.next().unwrap();
        assert_eq!(second.level, 0);
        assert_eq!(second.qualified_name, "a.b");
        assert_eq!(second.alias.as_deref(), Some("ab"));
    }

    #[test]
    fn parses_control_flow() {
        let module = parse(
            "\
@external
def f(n: uint256) -> uint256:
    acc: uint256 = 0
    for i in range(10):
        if i == n:
            break
        elif i == 0:
            continue
        else:
            acc += i
    return acc
",
        );
        let f = module.functions().next().unwrap();
        let Stmt::For { body, .. } = &f.body[1] else {
            panic!("expected a for loop");
        };
        let Stmt::If { orelse, .. } = &body[0] else {
            panic!("expected an if");
        };
        // elif desugars to a nested if in the else branch
        assert!(matches!(orelse[0], Stmt::If { .. }));
    }

    #[test]
    fn node_ids_are_unique() {
        let module = parse(
            "@external\ndef f() -> uint256:\n    return 1 + 2\n",
        );
        let mut seen = std::collections::HashSet::new();
        fn walk(e: &Expr, seen: &mut std::collections::HashSet<u32>) {
            assert!(seen.insert(e.node().node_id));
            if let Expr::BinOp { left, right, .. } = e {
                walk(left, seen);
                walk(right, seen);
            }
        }
        let f = module.functions().next().unwrap();
        if let Stmt::Return {
            value: Some(expr), ..
        } = &f.body[0]
        {
            walk(expr, &mut seen);
        }
        assert!(!seen.is_empty());
    }
}
