//! Code generation: annotated AST to IR for the deploy and runtime
//! programs.
//!
//! Calling conventions: external functions read arguments from calldata
//! into statically allocated memory words and return through a memory
//! buffer. Internal functions receive arguments through a static memory
//! frame and only the return address crosses the stack; their exit path
//! goes through a `..._cleanup` label ending in a bare `JUMP`.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use ethereum_types::U256;

use vyper_asm::{AssemblyItem, DataItem, Label};
use vyper_ir::{IrNode, IrOp, IrType, RESERVED_MEMORY};

use crate::ast::{
    BinOpKind, CmpOpKind, DataLocation, EventDef, Expr, FuncArg, FunctionDef,
    Module, NodeInfo, StateMutability, Stmt, Target, TopLevel, VariableDecl,
    Visibility, VyType,
};
use crate::error::CompileError;
use crate::layout::Layout;
use crate::selector_table::{
    dense_dispatcher, sparse_dispatcher, ExternalMethod,
};
use crate::settings::{OptimizationLevel, ResolvedSettings};

/// Label of the data section holding the runtime program inside the deploy
/// program.
pub const RUNTIME_CODE_SECTION: &str = "runtime_code";

/// Label of the fallback handler in the runtime program.
pub const FALLBACK: &str = "fallback";

fn ir(op: IrOp, args: Vec<IrNode>) -> IrNode {
    IrNode::new(op, args)
}

fn num(v: impl Into<U256>) -> IrNode {
    IrNode::num(v)
}

// one memory word per variable; everything is statically allocated
#[derive(Debug)]
struct MemoryAllocator {
    next: u64,
}

impl MemoryAllocator {
    fn new() -> Self {
        MemoryAllocator {
            next: RESERVED_MEMORY,
        }
    }

    fn allocate_word(&mut self) -> u64 {
        let slot = self.next;
        self.next += 32;
        slot
    }
}

#[derive(Debug, Clone)]
struct FuncInfo {
    def: FunctionDef,
    entry_label: String,
    cleanup_label: String,
    arg_slots: Vec<u64>,
    ret_slot: Option<u64>,
}

/// Shared codegen state for one program pair.
pub struct Codegen<'a> {
    module: &'a Module,
    layout: &'a Layout,
    settings: ResolvedSettings,
    constants: HashMap<String, U256>,
    functions: BTreeMap<String, FuncInfo>,
    events: BTreeMap<String, EventDef>,
    mem: MemoryAllocator,
    ret_label_counter: u32,
    // synthesized public getters, kept so the ABI can list them
    getters: Vec<FunctionDef>,
}

// per-function lowering context
struct FnCtx {
    locals: HashMap<String, (u64, VyType)>,
    loop_vars: Vec<(String, VyType)>,
    loop_depth: usize,
    ret_buf: Option<u64>,
    // external return path runs this (reentrancy unlock) before halting
    unlock: Option<IrNode>,
    // internal functions exit through their cleanup label instead
    cleanup_label: Option<String>,
    in_ctor: bool,
}

impl<'a> Codegen<'a> {
    /// Set up codegen state: constants, function registry, memory frames,
    /// synthesized getters.
    pub fn new(
        module: &'a Module,
        layout: &'a Layout,
        settings: ResolvedSettings,
    ) -> Result<Self, CompileError> {
        let mut constants = HashMap::new();
        for decl in module.variables() {
            if decl.is_constant {
                let value = decl.value.as_ref().ok_or_else(|| {
                    CompileError::structure(
                        format!("constant `{}` has no value", decl.name),
                        None,
                    )
                })?;
                let folded = eval_const_expr(value, &constants)?;
                constants.insert(decl.name.clone(), folded);
            }
        }

        let mut this = Codegen {
            module,
            layout,
            settings,
            constants,
            functions: BTreeMap::new(),
            events: module
                .events()
                .map(|e| (e.name.clone(), e.clone()))
                .collect(),
            mem: MemoryAllocator::new(),
            ret_label_counter: 0,
            getters: Vec::new(),
        };

        let mut defs: Vec<FunctionDef> =
            module.functions().cloned().collect();
        for decl in module.variables() {
            if decl.is_public && decl.is_state_variable() {
                defs.push(synthesize_getter(decl));
            }
        }

        for def in defs {
            let is_internal = def.visibility == Visibility::Internal;
            let entry_label = if is_internal {
                format!("internal_{}", def.name)
            } else {
                format!("external_{}", def.name)
            };
            let cleanup_label = format!("{entry_label}_cleanup");
            let arg_slots: Vec<u64> = def
                .args
                .iter()
                .map(|_| this.mem.allocate_word())
                .collect();
            let ret_slot =
                def.returns.as_ref().map(|_| this.mem.allocate_word());
            if this
                .functions
                .insert(
                    def.name.clone(),
                    FuncInfo {
                        def,
                        entry_label,
                        cleanup_label,
                        arg_slots,
                        ret_slot,
                    },
                )
                .is_some()
            {
                return Err(CompileError::structure(
                    "duplicate function definition",
                    None,
                ));
            }
        }

        for decl in module.variables() {
            if decl.is_public && decl.is_state_variable() {
                let info = &this.functions[&decl.name];
                this.getters.push(info.def.clone());
            }
        }

        Ok(this)
    }

    /// Synthesized public getters (for the ABI output).
    pub fn public_getters(&self) -> &[FunctionDef] {
        &self.getters
    }

    /// External methods in declaration order, getters last.
    pub fn external_methods(&self) -> Vec<ExternalMethod> {
        let mut out = Vec::new();
        for decl in &self.module.body {
            let name = match decl {
                TopLevel::FunctionDef(f)
                    if f.visibility == Visibility::External
                        && !f.is_constructor()
                        && !f.is_fallback() =>
                {
                    &f.name
                }
                TopLevel::VariableDecl(v)
                    if v.is_public && v.is_state_variable() =>
                {
                    &v.name
                }
                _ => continue,
            };
            let info = &self.functions[name];
            out.push(ExternalMethod {
                signature: info.def.signature(),
                selector: info.def.selector(),
                entry_label: info.entry_label.clone(),
            });
        }
        out
    }

    fn fresh_ret_label(&mut self) -> String {
        self.ret_label_counter += 1;
        format!("ret_{}", self.ret_label_counter)
    }

    // names of internal functions transitively called from `roots`
    fn reachable_internals(&self, roots: &[&FunctionDef]) -> BTreeSet<String> {
        let mut reachable = BTreeSet::new();
        let mut stack: Vec<String> = Vec::new();
        for root in roots {
            collect_calls(&root.body, &mut stack);
        }
        while let Some(name) = stack.pop() {
            if !reachable.insert(name.clone()) {
                continue;
            }
            if let Some(info) = self.functions.get(&name) {
                collect_calls(&info.def.body, &mut stack);
            }
        }
        reachable
    }

    /// Generate the runtime program: dispatcher, external functions,
    /// fallback, reachable internal functions, selector-table data.
    pub fn generate_runtime(&mut self) -> Result<Vec<AssemblyItem>, CompileError> {
        let methods = self.external_methods();
        let (dispatcher, table_data) = match self.settings.optimize {
            OptimizationLevel::Codesize => dense_dispatcher(&methods, FALLBACK)?,
            _ => sparse_dispatcher(&methods, FALLBACK),
        };

        let mut sections = vec![dispatcher];

        for method in &methods {
            let info = self.functions[&signature_name(&method.signature)].clone();
            sections.push(IrNode::seq(vec![
                IrNode::label(info.entry_label.clone()),
                self.external_fn_ir(&info)?,
            ]));
        }

        sections.push(self.fallback_ir()?);

        let externals: Vec<&FunctionDef> = self
            .functions
            .values()
            .filter(|i| {
                i.def.visibility == Visibility::External
                    && !i.def.is_constructor()
            })
            .map(|i| &i.def)
            .collect();
        for name in self.reachable_internals(&externals) {
            let info = self
                .functions
                .get(&name)
                .cloned()
                .ok_or_else(|| {
                    CompileError::structure(
                        format!("call to undefined function `{name}`"),
                        None,
                    )
                })?;
            sections.push(self.internal_fn_ir(&info, false)?);
        }

        let mut program = IrNode::seq(sections);
        if self.settings.optimize != OptimizationLevel::None {
            program = vyper_ir::optimize(program);
        }

        let mut supply = vyper_ir::LabelSupply::new();
        let mut items = vyper_ir::compile_to_assembly(
            &program,
            self.settings.evm_version,
            &mut supply,
        )?;
        items.extend(table_data);
        Ok(items)
    }

    /// Generate the deploy program around the already-assembled runtime
    /// bytecode.
    pub fn generate_deploy(
        &mut self,
        runtime_code: &[u8],
    ) -> Result<Vec<AssemblyItem>, CompileError> {
        let ctor = self.functions.get("__init__").cloned();

        let mut sections = Vec::new();

        // a missing constructor is nonpayable by default
        let payable = ctor
            .as_ref()
            .map_or(false, |c| c.def.mutability == StateMutability::Payable);
        if !payable {
            sections.push(ir(
                IrOp::Assert,
                vec![ir(
                    IrOp::Iszero,
                    vec![ir(IrOp::Callvalue, vec![])],
                )],
            ));
        }

        if let Some(info) = &ctor {
            if !info.def.args.is_empty() {
                return Err(CompileError::structure(
                    "constructor arguments are not supported",
                    Some(node_location(&info.def.node)),
                ));
            }
            let mut ctx = FnCtx {
                locals: HashMap::new(),
                loop_vars: Vec::new(),
                loop_depth: 0,
                ret_buf: None,
                unlock: None,
                cleanup_label: None,
                in_ctor: true,
            };
            sections.push(self.lower_body(&info.def.body.clone(), &mut ctx)?);
        }

        sections.push(ir(
            IrOp::Deploy(RUNTIME_CODE_SECTION.into()),
            vec![num(0u64), num(self.layout.immutables_len as u64)],
        ));

        if let Some(info) = &ctor {
            for name in self.reachable_internals(&[&info.def]) {
                let callee = self
                    .functions
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| {
                        CompileError::structure(
                            format!("call to undefined function `{name}`"),
                            None,
                        )
                    })?;
                sections.push(self.internal_fn_ir(&callee, true)?);
            }
        }

        let mut program = IrNode::seq(sections);
        if self.settings.optimize != OptimizationLevel::None {
            program = vyper_ir::optimize(program);
        }

        let mut supply = vyper_ir::LabelSupply::new();
        let mut items = vyper_ir::compile_to_assembly(
            &program,
            self.settings.evm_version,
            &mut supply,
        )?;
        items.push(AssemblyItem::DataHeader(Label::new(RUNTIME_CODE_SECTION)));
        items.push(AssemblyItem::Data(DataItem::Bytes(runtime_code.to_vec())));
        Ok(items)
    }

    // external function: checks, argument loads, body, implicit halt
    fn external_fn_ir(&mut self, info: &FuncInfo) -> Result<IrNode, CompileError> {
        let def = &info.def;
        let mut body = Vec::new();

        if def.mutability != StateMutability::Payable {
            body.push(
                ir(
                    IrOp::Assert,
                    vec![ir(
                        IrOp::Iszero,
                        vec![ir(IrOp::Callvalue, vec![])],
                    )],
                )
                .with_src(def.node.ast_ref()),
            );
        }

        let unlock = if def.nonreentrant {
            let (acquire, release) = self.reentrancy_lock()?;
            body.push(acquire);
            Some(release)
        } else {
            None
        };

        // the selector table only gates entry; the size check lives here
        let min_calldata = 4 + 32 * def.args.len() as u64;
        body.push(ir(
            IrOp::Assert,
            vec![ir(
                IrOp::Ge,
                vec![ir(IrOp::Calldatasize, vec![]), num(min_calldata)],
            )],
        ));

        let mut ctx = FnCtx {
            locals: HashMap::new(),
            loop_vars: Vec::new(),
            loop_depth: 0,
            ret_buf: info.ret_slot,
            unlock,
            cleanup_label: None,
            in_ctor: false,
        };

        for (i, (arg, slot)) in
            def.args.iter().zip(&info.arg_slots).enumerate()
        {
            let raw = ir(
                IrOp::Calldataload,
                vec![num(4 + 32 * i as u64)],
            );
            let clamped = match arg.typ.calldata_bound() {
                Some(bound) => ir(
                    IrOp::UclampLe,
                    vec![raw, num(bound)],
                ),
                None => raw,
            };
            body.push(ir(IrOp::Mstore, vec![num(*slot), clamped]));
            ctx.locals
                .insert(arg.name.clone(), (*slot, arg.typ.clone()));
        }

        body.push(self.lower_body(&def.body.clone(), &mut ctx)?);

        // unit functions may fall off the end of their body
        if def.returns.is_none() {
            if let Some(unlock) = ctx.unlock.clone() {
                body.push(unlock);
            }
            body.push(ir(IrOp::Stop, vec![]));
        }

        Ok(IrNode::seq(body).with_src(def.node.ast_ref()))
    }

    fn fallback_ir(&mut self) -> Result<IrNode, CompileError> {
        let mut body = vec![IrNode::label(FALLBACK)];
        match self.functions.get("__default__").cloned() {
            Some(info) => {
                if info.def.mutability != StateMutability::Payable {
                    body.push(ir(
                        IrOp::Assert,
                        vec![ir(
                            IrOp::Iszero,
                            vec![ir(IrOp::Callvalue, vec![])],
                        )],
                    ));
                }
                let mut ctx = FnCtx {
                    locals: HashMap::new(),
                    loop_vars: Vec::new(),
                    loop_depth: 0,
                    ret_buf: None,
                    unlock: None,
                    cleanup_label: None,
                    in_ctor: false,
                };
                body.push(self.lower_body(&info.def.body.clone(), &mut ctx)?);
                body.push(ir(IrOp::Stop, vec![]));
            }
            None => {
                body.push(ir(IrOp::Revert, vec![num(0u64), num(0u64)]));
            }
        }
        Ok(IrNode::seq(body))
    }

    // internal function: entry label, body, cleanup label, bare jump back
    fn internal_fn_ir(
        &mut self,
        info: &FuncInfo,
        in_ctor: bool,
    ) -> Result<IrNode, CompileError> {
        let def = &info.def;
        let mut ctx = FnCtx {
            locals: HashMap::new(),
            loop_vars: Vec::new(),
            loop_depth: 0,
            ret_buf: info.ret_slot,
            unlock: None,
            cleanup_label: Some(info.cleanup_label.clone()),
            in_ctor,
        };
        for (arg, slot) in def.args.iter().zip(&info.arg_slots) {
            ctx.locals
                .insert(arg.name.clone(), (*slot, arg.typ.clone()));
        }

        let body = self.lower_body(&def.body.clone(), &mut ctx)?;

        Ok(IrNode::seq(vec![
            IrNode::label(info.entry_label.clone()),
            body,
            IrNode::label(info.cleanup_label.clone()),
            ir(IrOp::Jump, vec![]),
        ])
        .with_src(def.node.ast_ref()))
    }

    fn reentrancy_lock(&self) -> Result<(IrNode, IrNode), CompileError> {
        let (location, slot) = self.layout.nonreentrant.ok_or_else(|| {
            CompileError::panic("nonreentrant function without a key slot")
        })?;
        let (load, store) = match location {
            DataLocation::Transient => (IrOp::Tload, IrOp::Tstore),
            DataLocation::Storage => (IrOp::Sload, IrOp::Sstore),
            DataLocation::Code => {
                return Err(CompileError::panic(
                    "reentrancy key cannot live in code",
                ))
            }
        };
        let acquire = IrNode::seq(vec![
            ir(
                IrOp::Assert,
                vec![ir(
                    IrOp::Iszero,
                    vec![ir(load.clone(), vec![num(slot)])],
                )],
            )
            .with_error_msg("nonreentrant"),
            ir(store.clone(), vec![num(slot), num(1u64)]),
        ]);
        let release = ir(store, vec![num(slot), num(0u64)]);
        Ok((acquire, release))
    }

    fn lower_body(
        &mut self,
        stmts: &[Stmt],
        ctx: &mut FnCtx,
    ) -> Result<IrNode, CompileError> {
        let mut out = Vec::with_capacity(stmts.len());
        for stmt in stmts {
            out.push(self.lower_stmt(stmt, ctx)?);
        }
        Ok(IrNode::seq(out))
    }

    fn lower_stmt(
        &mut self,
        stmt: &Stmt,
        ctx: &mut FnCtx,
    ) -> Result<IrNode, CompileError> {
        let node = *stmt.node();
        let lowered = match stmt {
            Stmt::Pass { .. } => ir(IrOp::Pass, vec![]),

            Stmt::Expr(expr) => {
                let value = self.lower_expr(expr, ctx)?;
                if value.valency() == 1 {
                    ir(IrOp::Pop, vec![value])
                } else {
                    value
                }
            }

            Stmt::LocalDecl {
                name, typ, value, ..
            } => {
                let slot = self.mem.allocate_word();
                let value = self.lower_expr(value, ctx)?;
                ctx.locals.insert(name.clone(), (slot, typ.clone()));
                ir(IrOp::Mstore, vec![num(slot), value])
            }

            Stmt::Assign { target, value, .. } => {
                let value = self.lower_expr(value, ctx)?;
                self.lower_store(target, value, ctx)?
            }

            Stmt::AugAssign {
                op, target, value, ..
            } => {
                let current = self.lower_load(target, ctx)?;
                let typ = self.target_type(target, ctx)?;
                let rhs = self.lower_expr(value, ctx)?;
                let combined = self.binop_ir(*op, current, rhs, &typ)?;
                self.lower_store(target, combined, ctx)?
            }

            Stmt::Return { value, .. } => {
                let mut seq = Vec::new();

                // store the value while any loop frames are still on the
                // stack, so reads of the loop variable resolve correctly
                if let Some(value) = value {
                    let slot = ctx.ret_buf.ok_or_else(|| {
                        CompileError::panic(
                            "return value without a return slot",
                        )
                    })?;
                    let value = self.lower_expr(value, ctx)?;
                    seq.push(ir(IrOp::Mstore, vec![num(slot), value]));
                }
                if ctx.loop_depth > 0 {
                    seq.push(ir(IrOp::ExitRepeater, vec![]));
                }

                match &ctx.cleanup_label {
                    Some(cleanup) => seq.push(IrNode::goto(cleanup.clone())),
                    None => {
                        if let Some(unlock) = ctx.unlock.clone() {
                            seq.push(unlock);
                        }
                        match ctx.ret_buf.filter(|_| value.is_some()) {
                            Some(slot) => seq.push(ir(
                                IrOp::Return,
                                vec![num(slot), num(32u64)],
                            )),
                            None => seq.push(ir(IrOp::Stop, vec![])),
                        }
                    }
                }
                IrNode::seq(seq)
            }

            Stmt::Assert { cond, .. } => {
                let cond = self.lower_expr(cond, ctx)?;
                ir(IrOp::Assert, vec![cond])
            }

            Stmt::Raise { .. } => {
                ir(IrOp::Revert, vec![num(0u64), num(0u64)])
            }

            Stmt::If {
                cond, then, orelse, ..
            } => {
                let cond = self.lower_expr(cond, ctx)?;
                let then = self.lower_body(then, ctx)?;
                if orelse.is_empty() {
                    ir(IrOp::If, vec![cond, then])
                } else {
                    let orelse = self.lower_body(orelse, ctx)?;
                    ir(IrOp::If, vec![cond, then, orelse])
                }
            }

            Stmt::For {
                var,
                typ,
                start,
                stop,
                body,
                ..
            } => {
                let start_ir = match start {
                    Some(e) => self.lower_expr(e, ctx)?,
                    None => num(0u64),
                };
                let stop_val = const_or_literal(stop, &self.constants)
                    .ok_or_else(|| {
                        CompileError::structure(
                            "range bound must be a literal",
                            Some(node_location(stmt.node())),
                        )
                    })?;
                let start_val = match start {
                    Some(e) => const_or_literal(e, &self.constants)
                        .ok_or_else(|| {
                            CompileError::structure(
                                "range start must be a literal",
                                Some(node_location(stmt.node())),
                            )
                        })?,
                    None => U256::zero(),
                };
                if stop_val < start_val {
                    return Err(CompileError::structure(
                        "range stop must not be less than start",
                        Some(node_location(stmt.node())),
                    ));
                }
                let rounds = stop_val - start_val;

                ctx.loop_vars.push((var.clone(), typ.clone()));
                ctx.loop_depth += 1;
                let body = self.lower_body(body, ctx);
                ctx.loop_depth -= 1;
                ctx.loop_vars.pop();

                ir(
                    IrOp::Repeat(var.clone()),
                    vec![
                        start_ir,
                        num(rounds),
                        num(rounds),
                        body?,
                    ],
                )
            }

            Stmt::Break { .. } => ir(IrOp::Break, vec![]),
            Stmt::Continue { .. } => ir(IrOp::Continue, vec![]),

            Stmt::Log { event, args, .. } => self.lower_log(event, args, ctx)?,
        };

        Ok(lowered.with_src(node.ast_ref()))
    }

    fn lower_log(
        &mut self,
        event: &str,
        args: &[Expr],
        ctx: &mut FnCtx,
    ) -> Result<IrNode, CompileError> {
        let def = self.events.get(event).cloned().ok_or_else(|| {
            CompileError::structure(
                format!("log of undefined event `{event}`"),
                None,
            )
        })?;
        if def.args.len() != args.len() {
            return Err(CompileError::structure(
                format!(
                    "event `{event}` takes {} arguments, got {}",
                    def.args.len(),
                    args.len()
                ),
                None,
            ));
        }

        let mut topics = vec![num(def.topic0())];
        let mut data = Vec::new();
        for (field, value) in def.args.iter().zip(args) {
            let value = self.lower_expr(value, ctx)?;
            if field.indexed {
                topics.push(value);
            } else {
                data.push(value);
            }
        }

        let log_op = match topics.len() {
            1 => IrOp::Log1,
            2 => IrOp::Log2,
            3 => IrOp::Log3,
            4 => IrOp::Log4,
            _ => {
                return Err(CompileError::structure(
                    "too many indexed event fields",
                    None,
                ))
            }
        };

        // abi-encode the data fields into a static buffer
        let mut seq = Vec::new();
        let buf = if data.is_empty() {
            0
        } else {
            let base = self.mem.allocate_word();
            for _ in 1..data.len() {
                self.mem.allocate_word();
            }
            for (i, value) in data.iter().enumerate() {
                seq.push(ir(
                    IrOp::Mstore,
                    vec![num(base + 32 * i as u64), value.clone()],
                ));
            }
            base
        };

        let mut log_args = vec![num(buf), num(32 * data.len() as u64)];
        log_args.extend(topics);
        seq.push(ir(log_op, log_args));
        Ok(IrNode::seq(seq))
    }

    fn target_type(
        &self,
        target: &Target,
        ctx: &FnCtx,
    ) -> Result<VyType, CompileError> {
        match target {
            Target::Name(name) => ctx
                .locals
                .get(name)
                .map(|(_, t)| t.clone())
                .ok_or_else(|| {
                    CompileError::structure(
                        format!("assignment to undefined variable `{name}`"),
                        None,
                    )
                }),
            Target::SelfAttr(attr) => self
                .state_var(attr)
                .map(|v| v.typ.clone()),
            Target::SelfSubscript { attr, .. } => {
                match self.state_var(attr)?.typ.clone() {
                    VyType::HashMap(_, value) => Ok(*value),
                    other => Err(CompileError::structure(
                        format!("`{attr}` of type {other} is not subscriptable"),
                        None,
                    )),
                }
            }
        }
    }

    fn state_var(&self, name: &str) -> Result<&VariableDecl, CompileError> {
        self.module
            .variables()
            .find(|v| v.name == name)
            .ok_or_else(|| {
                CompileError::structure(
                    format!("undefined state variable `{name}`"),
                    None,
                )
            })
    }

    fn storage_slot_ir(
        &mut self,
        attr: &str,
        key: Option<&Expr>,
        ctx: &mut FnCtx,
    ) -> Result<(IrNode, DataLocation), CompileError> {
        let decl = self.state_var(attr)?.clone();
        let position = self
            .layout
            .position(self.module, attr)
            .cloned()
            .ok_or_else(|| {
                CompileError::panic(format!("no position for `{attr}`"))
            })?;

        let slot = match (&decl.typ, key) {
            (VyType::HashMap(..), Some(key)) => {
                // the variable's slot acts as a salt; elements live at
                // keccak(salt ++ key)
                let key = self.lower_expr(key, ctx)?;
                ir(IrOp::Sha3_64, vec![num(position.offset), key])
            }
            (VyType::HashMap(..), None) => {
                return Err(CompileError::structure(
                    format!("hashmap `{attr}` requires a key"),
                    None,
                ))
            }
            (_, None) => num(position.offset),
            (_, Some(_)) => {
                return Err(CompileError::structure(
                    format!("`{attr}` is not subscriptable"),
                    None,
                ))
            }
        };
        Ok((slot, position.location))
    }

    fn lower_store(
        &mut self,
        target: &Target,
        value: IrNode,
        ctx: &mut FnCtx,
    ) -> Result<IrNode, CompileError> {
        match target {
            Target::Name(name) => {
                let (slot, _) = *ctx.locals.get(name).ok_or_else(|| {
                    CompileError::structure(
                        format!("assignment to undefined variable `{name}`"),
                        None,
                    )
                })?;
                Ok(ir(IrOp::Mstore, vec![num(slot), value]))
            }
            Target::SelfAttr(attr) => {
                let decl = self.state_var(attr)?.clone();
                if decl.is_immutable {
                    if !ctx.in_ctor {
                        return Err(CompileError::structure(
                            format!(
                                "immutable `{attr}` can only be assigned in \
                                 the constructor"
                            ),
                            None,
                        ));
                    }
                    let position = self
                        .layout
                        .position(self.module, attr)
                        .cloned()
                        .ok_or_else(|| {
                            CompileError::panic(format!(
                                "no position for `{attr}`"
                            ))
                        })?;
                    // immutables land in memory right after the runtime
                    // code copied by the constructor
                    return Ok(ir(
                        IrOp::Mstore,
                        vec![
                            ir(
                                IrOp::Add,
                                vec![
                                    runtime_code_length(),
                                    num(position.offset),
                                ],
                            ),
                            value,
                        ],
                    ));
                }
                let (slot, location) = self.storage_slot_ir(attr, None, ctx)?;
                Ok(store_op(location, slot, value))
            }
            Target::SelfSubscript { attr, key } => {
                let (slot, location) =
                    self.storage_slot_ir(attr, Some(key), ctx)?;
                Ok(store_op(location, slot, value))
            }
        }
    }

    fn lower_load(
        &mut self,
        target: &Target,
        ctx: &mut FnCtx,
    ) -> Result<IrNode, CompileError> {
        let expr = match target {
            Target::Name(name) => Expr::Name {
                node: NodeInfo::default(),
                name: name.clone(),
            },
            Target::SelfAttr(attr) => Expr::SelfAttr {
                node: NodeInfo::default(),
                attr: attr.clone(),
            },
            Target::SelfSubscript { attr, key } => Expr::SelfSubscript {
                node: NodeInfo::default(),
                attr: attr.clone(),
                key: key.clone(),
            },
        };
        self.lower_expr(&expr, ctx)
    }

    fn lower_expr(
        &mut self,
        expr: &Expr,
        ctx: &mut FnCtx,
    ) -> Result<IrNode, CompileError> {
        let node = *expr.node();
        let lowered = match expr {
            Expr::Int { value, .. } => num(*value),
            Expr::Bool { value, .. } => {
                num(u64::from(*value)).with_typ(IrType::Bool)
            }

            Expr::Name { name, .. } => {
                if ctx.loop_vars.iter().any(|(n, _)| n == name) {
                    IrNode::var(name.clone())
                } else if let Some((slot, _)) = ctx.locals.get(name) {
                    ir(IrOp::Mload, vec![num(*slot)])
                } else if let Some(value) = self.constants.get(name) {
                    num(*value)
                } else {
                    return Err(CompileError::structure(
                        format!("undefined variable `{name}`"),
                        Some(node_location(&node)),
                    ));
                }
            }

            Expr::SelfAttr { attr, .. } => {
                let decl = self.state_var(attr)?.clone();
                if decl.is_immutable {
                    let position = self
                        .layout
                        .position(self.module, attr)
                        .cloned()
                        .ok_or_else(|| {
                            CompileError::panic(format!(
                                "no position for `{attr}`"
                            ))
                        })?;
                    if ctx.in_ctor {
                        ir(
                            IrOp::Mload,
                            vec![ir(
                                IrOp::Add,
                                vec![
                                    runtime_code_length(),
                                    num(position.offset),
                                ],
                            )],
                        )
                    } else {
                        // deployed immutables sit just past the runtime
                        // code, addressable through the code_end sentinel
                        ir(
                            IrOp::Codeload,
                            vec![ir(
                                IrOp::Add,
                                vec![
                                    IrNode::symbol(vyper_asm::CODE_END),
                                    num(position.offset),
                                ],
                            )],
                        )
                    }
                } else {
                    let (slot, location) =
                        self.storage_slot_ir(attr, None, ctx)?;
                    load_op(location, slot)
                }
            }

            Expr::SelfSubscript { attr, key, .. } => {
                let (slot, location) =
                    self.storage_slot_ir(attr, Some(key), ctx)?;
                load_op(location, slot)
            }

            Expr::EnvAttr { base, attr, .. } => {
                env_attr_ir(base, attr).ok_or_else(|| {
                    CompileError::structure(
                        format!("unknown environment attribute `{base}.{attr}`"),
                        Some(node_location(&node)),
                    )
                })?
            }

            Expr::BinOp {
                op,
                left,
                right,
                typ,
                ..
            } => {
                let left = self.lower_expr(left, ctx)?;
                let right = self.lower_expr(right, ctx)?;
                self.binop_ir(*op, left, right, typ)?
            }

            Expr::Compare {
                op,
                left,
                right,
                operand_typ,
                ..
            } => {
                let left = self.lower_expr(left, ctx)?;
                let right = self.lower_expr(right, ctx)?;
                let signed = operand_typ.is_signed();
                let ir_op = match (op, signed) {
                    (CmpOpKind::Eq, _) => IrOp::Eq,
                    (CmpOpKind::Ne, _) => IrOp::Ne,
                    (CmpOpKind::Lt, false) => IrOp::Lt,
                    (CmpOpKind::Le, false) => IrOp::Le,
                    (CmpOpKind::Gt, false) => IrOp::Gt,
                    (CmpOpKind::Ge, false) => IrOp::Ge,
                    (CmpOpKind::Lt, true) => IrOp::Slt,
                    (CmpOpKind::Le, true) => IrOp::Sle,
                    (CmpOpKind::Gt, true) => IrOp::Sgt,
                    (CmpOpKind::Ge, true) => IrOp::Sge,
                };
                ir(ir_op, vec![left, right]).with_typ(IrType::Bool)
            }

            Expr::BoolOp {
                is_and, left, right, ..
            } => {
                let left = self.lower_expr(left, ctx)?;
                let right = self.lower_expr(right, ctx)?;
                // short-circuit via branch arms
                let result = if *is_and {
                    ir(
                        IrOp::If,
                        vec![left, right, num(0u64).with_typ(IrType::Bool)],
                    )
                } else {
                    ir(
                        IrOp::If,
                        vec![left, num(1u64).with_typ(IrType::Bool), right],
                    )
                };
                result.with_typ(IrType::Bool)
            }

            Expr::Not { operand, .. } => {
                let operand = self.lower_expr(operand, ctx)?;
                ir(IrOp::Iszero, vec![operand]).with_typ(IrType::Bool)
            }

            Expr::Neg { operand, .. } => {
                let operand = self.lower_expr(operand, ctx)?;
                ir(IrOp::Sub, vec![num(0u64), operand])
            }

            Expr::SelfCall { method, args, .. } => {
                self.lower_internal_call(method, args, ctx)?
            }
        };

        Ok(if node.src_length > 0 {
            lowered.with_src(node.ast_ref())
        } else {
            lowered
        })
    }

    fn lower_internal_call(
        &mut self,
        method: &str,
        args: &[Expr],
        ctx: &mut FnCtx,
    ) -> Result<IrNode, CompileError> {
        let info = self.functions.get(method).cloned().ok_or_else(|| {
            CompileError::structure(
                format!("call to undefined function `{method}`"),
                None,
            )
        })?;
        if info.def.visibility != Visibility::Internal {
            return Err(CompileError::structure(
                format!("`{method}` is not an internal function"),
                None,
            ));
        }
        if info.def.args.len() != args.len() {
            return Err(CompileError::structure(
                format!(
                    "`{method}` takes {} arguments, got {}",
                    info.def.args.len(),
                    args.len()
                ),
                None,
            ));
        }

        let mut seq = Vec::new();
        for (arg, slot) in args.iter().zip(&info.arg_slots) {
            let value = self.lower_expr(arg, ctx)?;
            seq.push(ir(IrOp::Mstore, vec![num(*slot), value]));
        }

        let ret_label = self.fresh_ret_label();
        seq.push(ir(
            IrOp::Goto(info.entry_label.clone()),
            vec![IrNode::symbol(ret_label.clone())],
        ));
        seq.push(IrNode::label(ret_label));

        if let Some(slot) = info.ret_slot {
            seq.push(ir(IrOp::Mload, vec![num(slot)]));
        }
        Ok(IrNode::seq(seq))
    }

    fn binop_ir(
        &mut self,
        op: BinOpKind,
        left: IrNode,
        right: IrNode,
        typ: &VyType,
    ) -> Result<IrNode, CompileError> {
        let signed = typ.is_signed();
        Ok(match op {
            BinOpKind::BitAnd => ir(IrOp::And, vec![left, right]),
            BinOpKind::BitOr => ir(IrOp::Or, vec![left, right]),
            BinOpKind::BitXor => ir(IrOp::Xor, vec![left, right]),
            // shift amount is the first operand at the EVM level
            BinOpKind::Shl => ir(IrOp::Shl, vec![right, left]),
            BinOpKind::Shr => {
                let op = if signed { IrOp::Sar } else { IrOp::Shr };
                ir(op, vec![right, left])
            }
            BinOpKind::Pow => ir(IrOp::Exp, vec![left, right]),
            BinOpKind::Add => safe_add(left, right, signed),
            BinOpKind::Sub => safe_sub(left, right, signed),
            BinOpKind::Mul => safe_mul(left, right, signed),
            BinOpKind::Div => safe_div(left, right, signed),
            BinOpKind::Mod => safe_mod(left, right, signed),
        })
    }
}

// (sub (symbol code_end) (symbol runtime_code)): the runtime length inside
// the deploy program
fn runtime_code_length() -> IrNode {
    ir(
        IrOp::Sub,
        vec![
            IrNode::symbol(vyper_asm::CODE_END),
            IrNode::symbol(RUNTIME_CODE_SECTION),
        ],
    )
}

fn store_op(location: DataLocation, slot: IrNode, value: IrNode) -> IrNode {
    match location {
        DataLocation::Storage => ir(IrOp::Sstore, vec![slot, value]),
        DataLocation::Transient => ir(IrOp::Tstore, vec![slot, value]),
        DataLocation::Code => unreachable!("immutables handled separately"),
    }
}

fn load_op(location: DataLocation, slot: IrNode) -> IrNode {
    match location {
        DataLocation::Storage => ir(IrOp::Sload, vec![slot]),
        DataLocation::Transient => ir(IrOp::Tload, vec![slot]),
        DataLocation::Code => unreachable!("immutables handled separately"),
    }
}

fn env_attr_ir(base: &str, attr: &str) -> Option<IrNode> {
    let op = match (base, attr) {
        ("msg", "sender") => IrOp::Caller,
        ("msg", "value") => IrOp::Callvalue,
        ("msg", "gas") => IrOp::Gas,
        ("block", "timestamp") => IrOp::Timestamp,
        ("block", "number") => IrOp::Number,
        ("chain", "id") => IrOp::Chainid,
        ("tx", "origin") => IrOp::Origin,
        ("tx", "gasprice") => IrOp::Gasprice,
        ("self", "balance") => IrOp::Selfbalance,
        _ => return None,
    };
    Some(ir(op, vec![]))
}

// safe-math expansions; each failure path jumps to the shared failure
// block with the documented tag
fn safe_add(left: IrNode, right: IrNode, signed: bool) -> IrNode {
    let check = if signed {
        // ans < a iff b < 0
        ir(
            IrOp::Eq,
            vec![
                ir(IrOp::Slt, vec![IrNode::var("ans"), IrNode::var("a")]),
                ir(IrOp::Slt, vec![IrNode::var("b"), num(0u64)]),
            ],
        )
    } else {
        ir(IrOp::Ge, vec![IrNode::var("ans"), IrNode::var("a")])
    };
    IrNode::with(
        "a",
        left,
        IrNode::with(
            "b",
            right,
            IrNode::with(
                "ans",
                ir(IrOp::Add, vec![IrNode::var("a"), IrNode::var("b")]),
                IrNode::seq(vec![
                    ir(IrOp::Assert, vec![check]).with_error_msg("safeadd"),
                    IrNode::var("ans"),
                ]),
            ),
        ),
    )
}

fn safe_sub(left: IrNode, right: IrNode, signed: bool) -> IrNode {
    if signed {
        // ans > a iff b < 0
        let check = ir(
            IrOp::Eq,
            vec![
                ir(IrOp::Sgt, vec![IrNode::var("ans"), IrNode::var("a")]),
                ir(IrOp::Slt, vec![IrNode::var("b"), num(0u64)]),
            ],
        );
        IrNode::with(
            "a",
            left,
            IrNode::with(
                "b",
                right,
                IrNode::with(
                    "ans",
                    ir(IrOp::Sub, vec![IrNode::var("a"), IrNode::var("b")]),
                    IrNode::seq(vec![
                        ir(IrOp::Assert, vec![check])
                            .with_error_msg("safesub"),
                        IrNode::var("ans"),
                    ]),
                ),
            ),
        )
    } else {
        IrNode::with(
            "a",
            left,
            IrNode::with(
                "b",
                right,
                IrNode::seq(vec![
                    ir(
                        IrOp::Assert,
                        vec![ir(
                            IrOp::Ge,
                            vec![IrNode::var("a"), IrNode::var("b")],
                        )],
                    )
                    .with_error_msg("safesub"),
                    ir(IrOp::Sub, vec![IrNode::var("a"), IrNode::var("b")]),
                ]),
            ),
        )
    }
}

fn safe_mul(left: IrNode, right: IrNode, signed: bool) -> IrNode {
    let div_op = if signed { IrOp::Sdiv } else { IrOp::Div };
    let mut checks = vec![ir(
        IrOp::Assert,
        vec![ir(
            IrOp::Or,
            vec![
                ir(IrOp::Iszero, vec![IrNode::var("a")]),
                ir(
                    IrOp::Eq,
                    vec![
                        ir(
                            div_op,
                            vec![IrNode::var("ans"), IrNode::var("a")],
                        ),
                        IrNode::var("b"),
                    ],
                ),
            ],
        )],
    )
    .with_error_msg("safemul")];

    if signed {
        // INT256_MIN * -1 wraps silently through the division check
        let int_min = U256::one() << 255;
        checks.push(
            ir(
                IrOp::Assert,
                vec![ir(
                    IrOp::Iszero,
                    vec![ir(
                        IrOp::And,
                        vec![
                            ir(
                                IrOp::Eq,
                                vec![IrNode::var("a"), num(!U256::zero())],
                            ),
                            ir(
                                IrOp::Eq,
                                vec![IrNode::var("b"), num(int_min)],
                            ),
                        ],
                    )],
                )],
            )
            .with_error_msg("safemul"),
        );
    }

    let mut body = checks;
    body.push(IrNode::var("ans"));

    IrNode::with(
        "a",
        left,
        IrNode::with(
            "b",
            right,
            IrNode::with(
                "ans",
                ir(IrOp::Mul, vec![IrNode::var("a"), IrNode::var("b")]),
                IrNode::seq(body),
            ),
        ),
    )
}

fn safe_div(left: IrNode, right: IrNode, signed: bool) -> IrNode {
    let div_op = if signed { IrOp::Sdiv } else { IrOp::Div };
    IrNode::with(
        "a",
        left,
        IrNode::with(
            "b",
            right,
            IrNode::seq(vec![
                ir(IrOp::Assert, vec![IrNode::var("b")])
                    .with_error_msg("safediv"),
                ir(div_op, vec![IrNode::var("a"), IrNode::var("b")]),
            ]),
        ),
    )
}

fn safe_mod(left: IrNode, right: IrNode, signed: bool) -> IrNode {
    let mod_op = if signed { IrOp::Smod } else { IrOp::Mod };
    IrNode::with(
        "a",
        left,
        IrNode::with(
            "b",
            right,
            IrNode::seq(vec![
                ir(IrOp::Assert, vec![IrNode::var("b")])
                    .with_error_msg("safemod"),
                ir(mod_op, vec![IrNode::var("a"), IrNode::var("b")]),
            ]),
        ),
    )
}

pub(crate) fn synthesize_getter(decl: &VariableDecl) -> FunctionDef {
    let (args, body_expr) = match &decl.typ {
        VyType::HashMap(key, _) => (
            vec![FuncArg {
                name: "arg0".into(),
                typ: (**key).clone(),
            }],
            Expr::SelfSubscript {
                node: decl.node,
                attr: decl.name.clone(),
                key: Box::new(Expr::Name {
                    node: decl.node,
                    name: "arg0".into(),
                }),
            },
        ),
        _ => (
            vec![],
            Expr::SelfAttr {
                node: decl.node,
                attr: decl.name.clone(),
            },
        ),
    };
    let returns = match &decl.typ {
        VyType::HashMap(_, value) => (**value).clone(),
        other => other.clone(),
    };

    FunctionDef {
        node: decl.node,
        name: decl.name.clone(),
        args,
        returns: Some(returns),
        body: vec![Stmt::Return {
            node: decl.node,
            value: Some(body_expr),
        }],
        visibility: Visibility::External,
        mutability: StateMutability::View,
        nonreentrant: false,
    }
}

fn collect_calls(stmts: &[Stmt], out: &mut Vec<String>) {
    for stmt in stmts {
        match stmt {
            Stmt::Expr(e) => collect_calls_expr(e, out),
            Stmt::LocalDecl { value, .. } => collect_calls_expr(value, out),
            Stmt::Assign { target, value, .. } => {
                collect_calls_target(target, out);
                collect_calls_expr(value, out);
            }
            Stmt::AugAssign { target, value, .. } => {
                collect_calls_target(target, out);
                collect_calls_expr(value, out);
            }
            Stmt::Return { value, .. } => {
                if let Some(value) = value {
                    collect_calls_expr(value, out);
                }
            }
            Stmt::Assert { cond, .. } => collect_calls_expr(cond, out),
            Stmt::If {
                cond, then, orelse, ..
            } => {
                collect_calls_expr(cond, out);
                collect_calls(then, out);
                collect_calls(orelse, out);
            }
            Stmt::For {
                start, stop, body, ..
            } => {
                if let Some(start) = start {
                    collect_calls_expr(start, out);
                }
                collect_calls_expr(stop, out);
                collect_calls(body, out);
            }
            Stmt::Log { args, .. } => {
                for arg in args {
                    collect_calls_expr(arg, out);
                }
            }
            Stmt::Raise { .. }
            | Stmt::Pass { .. }
            | Stmt::Break { .. }
            | Stmt::Continue { .. } => {}
        }
    }
}

fn collect_calls_target(target: &Target, out: &mut Vec<String>) {
    if let Target::SelfSubscript { key, .. } = target {
        collect_calls_expr(key, out);
    }
}

fn collect_calls_expr(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::SelfCall { method, args, .. } => {
            out.push(method.clone());
            for arg in args {
                collect_calls_expr(arg, out);
            }
        }
        Expr::SelfSubscript { key, .. } => collect_calls_expr(key, out),
        Expr::BinOp { left, right, .. }
        | Expr::Compare { left, right, .. }
        | Expr::BoolOp { left, right, .. } => {
            collect_calls_expr(left, out);
            collect_calls_expr(right, out);
        }
        Expr::Not { operand, .. } | Expr::Neg { operand, .. } => {
            collect_calls_expr(operand, out)
        }
        Expr::Int { .. }
        | Expr::Bool { .. }
        | Expr::Name { .. }
        | Expr::SelfAttr { .. }
        | Expr::EnvAttr { .. } => {}
    }
}

fn const_or_literal(
    expr: &Expr,
    constants: &HashMap<String, U256>,
) -> Option<U256> {
    match expr {
        Expr::Int { value, .. } => Some(*value),
        Expr::Name { name, .. } => constants.get(name).copied(),
        _ => None,
    }
}

fn eval_const_expr(
    expr: &Expr,
    constants: &HashMap<String, U256>,
) -> Result<U256, CompileError> {
    match expr {
        Expr::Int { value, .. } => Ok(*value),
        Expr::Bool { value, .. } => Ok(U256::from(u64::from(*value))),
        Expr::Name { name, node } => {
            constants.get(name).copied().ok_or_else(|| {
                CompileError::structure(
                    format!("constant initializer references `{name}`"),
                    Some(node_location(node)),
                )
            })
        }
        Expr::BinOp {
            op, left, right, ..
        } => {
            let l = eval_const_expr(left, constants)?;
            let r = eval_const_expr(right, constants)?;
            Ok(match op {
                BinOpKind::Add => l.overflowing_add(r).0,
                BinOpKind::Sub => l.overflowing_sub(r).0,
                BinOpKind::Mul => l.overflowing_mul(r).0,
                BinOpKind::Div if !r.is_zero() => l / r,
                BinOpKind::Mod if !r.is_zero() => l % r,
                BinOpKind::Pow => l.overflowing_pow(r).0,
                BinOpKind::BitAnd => l & r,
                BinOpKind::BitOr => l | r,
                BinOpKind::BitXor => l ^ r,
                BinOpKind::Shl if r < U256::from(256) => l << r.as_usize(),
                BinOpKind::Shr if r < U256::from(256) => l >> r.as_usize(),
                _ => {
                    return Err(CompileError::structure(
                        "invalid constant expression",
                        Some(node_location(expr.node())),
                    ))
                }
            })
        }
        _ => Err(CompileError::structure(
            "constant initializer must be a literal expression",
            Some(node_location(expr.node())),
        )),
    }
}

fn node_location(node: &NodeInfo) -> crate::error::SourceLocation {
    crate::error::SourceLocation {
        lineno: node.lineno,
        col_offset: node.col_offset,
        end_lineno: Some(node.end_lineno),
        end_col_offset: Some(node.end_col_offset),
        node_id: Some(node.node_id),
    }
}

fn signature_name(signature: &str) -> String {
    signature
        .split('(')
        .next()
        .unwrap_or(signature)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::NodeInfo;

    fn int(v: u64) -> Expr {
        Expr::Int {
            node: NodeInfo::default(),
            value: U256::from(v),
            typ: VyType::Uint256,
        }
    }

    #[test]
    fn const_expressions_fold() {
        let mut constants = HashMap::new();
        constants.insert("WEEK".to_string(), U256::from(604800u64));

        let expr = Expr::BinOp {
            node: NodeInfo::default(),
            op: BinOpKind::Mul,
            left: Box::new(Expr::Name {
                node: NodeInfo::default(),
                name: "WEEK".into(),
            }),
            right: Box::new(int(2)),
            typ: VyType::Uint256,
        };
        assert_eq!(
            eval_const_expr(&expr, &constants).unwrap(),
            U256::from(1209600u64)
        );

        let bad = Expr::EnvAttr {
            node: NodeInfo::default(),
            base: "msg".into(),
            attr: "sender".into(),
        };
        assert!(eval_const_expr(&bad, &constants).is_err());
    }

    #[test]
    fn getters_for_scalars_and_maps() {
        let scalar = VariableDecl {
            node: NodeInfo::default(),
            name: "total".into(),
            typ: VyType::Uint256,
            is_public: true,
            is_constant: false,
            is_immutable: false,
            is_transient: false,
            value: None,
        };
        let getter = synthesize_getter(&scalar);
        assert_eq!(getter.signature(), "total()");
        assert_eq!(getter.returns, Some(VyType::Uint256));
        assert_eq!(getter.mutability, StateMutability::View);

        let map = VariableDecl {
            typ: VyType::HashMap(
                Box::new(VyType::Address),
                Box::new(VyType::Uint256),
            ),
            name: "balances".into(),
            ..scalar
        };
        let getter = synthesize_getter(&map);
        assert_eq!(getter.signature(), "balances(address)");
        assert_eq!(getter.returns, Some(VyType::Uint256));
    }

    #[test]
    fn call_graph_collection() {
        let call = |method: &str| Expr::SelfCall {
            node: NodeInfo::default(),
            method: method.into(),
            args: vec![],
        };
        let stmts = vec![
            Stmt::Expr(call("a")),
            Stmt::If {
                node: NodeInfo::default(),
                cond: call("b"),
                then: vec![Stmt::Expr(call("c"))],
                orelse: vec![],
            },
        ];
        let mut out = Vec::new();
        collect_calls(&stmts, &mut out);
        out.sort();
        assert_eq!(out, vec!["a", "b", "c"]);
    }

    #[test]
    fn safe_div_carries_its_tag() {
        let node = safe_div(
            IrNode::num(10u64),
            IrNode::num(0u64),
            false,
        );
        fn find_tag(node: &IrNode) -> Option<String> {
            if node.op == IrOp::Assert {
                return node.error_msg.clone();
            }
            node.args.iter().find_map(find_tag)
        }
        assert_eq!(find_tag(&node).as_deref(), Some("safediv"));
        assert_eq!(node.valency(), 1);
    }
}
