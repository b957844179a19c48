//! Storage, transient-storage and code-immutable position allocation.

use std::collections::HashMap;

use ethereum_types::U256;
use serde_json::{json, Map, Value};
use vyper_asm::EvmVersion;

use crate::ast::{DataLocation, Module, ModuleRc, TopLevel};
use crate::error::{CompileError, SourceLocation};
use crate::imports::ResolvedImports;

/// The reserved name of the global reentrancy lock. Users cannot assign to
/// it because `$`/`.` are not identifier characters.
pub const GLOBAL_NONREENTRANT_KEY: &str = "$.nonreentrant_key";

/// Slots the reentrancy lock occupies.
pub const NONREENTRANT_KEY_SIZE: usize = 1;

/// Deployed code ceiling (EIP-170); immutables must fit inside it.
pub const IMMUTABLES_MAX_BYTES: u64 = 0x6000;

/// Which region holds the reentrancy key under the active fork.
pub fn reentrancy_key_location(version: EvmVersion) -> DataLocation {
    if version.since(EvmVersion::Cancun) {
        DataLocation::Transient
    } else {
        DataLocation::Storage
    }
}

/// Assigned position of one state variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarPosition {
    /// Which region.
    pub location: DataLocation,
    /// Slot (words) for storage/transient, byte offset for code.
    pub offset: U256,
    /// Words for storage/transient, bytes for code.
    pub size: usize,
}

/// Complete layout assignment for a module tree.
#[derive(Debug, Default)]
pub struct Layout {
    // keyed by (module resolved path, variable name)
    positions: HashMap<(String, String), VarPosition>,
    /// Region and slot of the global reentrancy key.
    pub nonreentrant: Option<(DataLocation, U256)>,
    /// Total bytes of code immutables.
    pub immutables_len: usize,
}

impl Layout {
    /// Position of a variable of `module`.
    pub fn position(&self, module: &Module, name: &str) -> Option<&VarPosition> {
        self.positions
            .get(&(module.resolved_path.clone(), name.to_string()))
    }
}

// a monotonic bump allocator over one region
#[derive(Debug)]
struct SimpleAllocator {
    slot: U256,
    // None means the region is bounded only by the word size
    max: Option<U256>,
}

impl SimpleAllocator {
    fn new(max: Option<U256>) -> Self {
        SimpleAllocator {
            slot: U256::zero(),
            max,
        }
    }

    fn allocate(
        &mut self,
        n: usize,
        node: Option<SourceLocation>,
    ) -> Result<U256, CompileError> {
        let ret = self.slot;
        let next = self
            .slot
            .checked_add(U256::from(n))
            .ok_or_else(|| slot_error(ret, n, node))?;
        if let Some(max) = self.max {
            if next > max {
                return Err(slot_error(ret, n, node));
            }
        }
        self.slot = next;
        Ok(ret)
    }
}

fn slot_error(
    start: U256,
    n: usize,
    node: Option<SourceLocation>,
) -> CompileError {
    CompileError::storage_layout(
        format!(
            "Invalid storage slot, tried to allocate slots {start} through \
             {}",
            start.overflowing_add(U256::from(n)).0
        ),
        node,
    )
}

struct Allocators {
    storage: SimpleAllocator,
    transient: SimpleAllocator,
    immutables: SimpleAllocator,
    nonreentrant: Option<(DataLocation, U256)>,
}

impl Allocators {
    fn new() -> Self {
        Allocators {
            storage: SimpleAllocator::new(None),
            transient: SimpleAllocator::new(None),
            immutables: SimpleAllocator::new(Some(U256::from(
                IMMUTABLES_MAX_BYTES,
            ))),
            nonreentrant: None,
        }
    }

    fn get(&mut self, location: DataLocation) -> &mut SimpleAllocator {
        match location {
            DataLocation::Storage => &mut self.storage,
            DataLocation::Transient => &mut self.transient,
            DataLocation::Code => &mut self.immutables,
        }
    }

    // the lock is always allocated first, so adding or removing reentrancy
    // protection does not shift the rest of the layout
    fn allocate_global_nonreentrancy_slot(
        &mut self,
        version: EvmVersion,
    ) -> Result<(), CompileError> {
        let location = reentrancy_key_location(version);
        let slot = self.get(location).allocate(NONREENTRANT_KEY_SIZE, None)?;
        debug_assert!(slot.is_zero());
        self.nonreentrant = Some((location, slot));
        Ok(())
    }
}

fn location_of(node: &crate::ast::NodeInfo) -> SourceLocation {
    SourceLocation {
        lineno: node.lineno,
        col_offset: node.col_offset,
        end_lineno: Some(node.end_lineno),
        end_col_offset: Some(node.end_col_offset),
        node_id: Some(node.node_id),
    }
}

/// Compute positions for every state variable in the module tree.
///
/// With `overrides`, storage variables are pinned to the slots in the
/// override file (collisions and out-of-bounds slots are
/// `StorageLayoutException`s); transient and code layouts are still
/// computed normally.
pub fn allocate_layout(
    module: &ModuleRc,
    imports: &ResolvedImports,
    version: EvmVersion,
    overrides: Option<&Value>,
) -> Result<Layout, CompileError> {
    let mut layout = Layout::default();

    let mut allocators = Allocators::new();
    allocators.allocate_global_nonreentrancy_slot(version)?;

    if let Some(overrides) = overrides {
        // code/transient layout first, with storage skipped
        allocate_r(module, imports, &mut allocators, true, &mut layout)?;
        layout.nonreentrant = allocators.nonreentrant;

        allocate_with_overrides(module, imports, version, overrides, &mut layout)?;

        // sanity check that the generated layout matches the input
        let roundtrip = layout_export(module, imports, &layout);
        let storage_part = roundtrip
            .get("storage_layout")
            .cloned()
            .unwrap_or_else(|| json!({}));
        if &storage_part != overrides {
            return Err(CompileError::panic(format!(
                "Computed storage layout does not match override file!\n\
                 expected: {overrides}\n\ngot:\n{storage_part}"
            )));
        }
    } else {
        allocate_r(module, imports, &mut allocators, false, &mut layout)?;
        layout.nonreentrant = allocators.nonreentrant;
    }

    layout.immutables_len = allocators.immutables.slot.as_usize();
    Ok(layout)
}

fn allocate_r(
    module: &ModuleRc,
    imports: &ResolvedImports,
    allocators: &mut Allocators,
    no_storage: bool,
    layout: &mut Layout,
) -> Result<(), CompileError> {
    for item in &module.body {
        match item {
            TopLevel::InitializesDecl(decl) => {
                let child = imports
                    .imported_module(module, &decl.module_alias)
                    .ok_or_else(|| {
                        CompileError::structure(
                            format!(
                                "initializes unknown module `{}`",
                                decl.module_alias
                            ),
                            Some(location_of(&decl.node)),
                        )
                    })?;
                allocate_r(&child, imports, allocators, no_storage, layout)?;
            }
            TopLevel::VariableDecl(decl) => {
                if !decl.is_state_variable() {
                    continue;
                }
                let location = decl.location();
                if no_storage && location == DataLocation::Storage {
                    continue;
                }
                // note hash maps get a single slot here; the slot is the
                // hashing salt, so physical overlap is impossible
                let size = match location {
                    DataLocation::Code => decl.typ.size_in_bytes(),
                    _ => decl.typ.storage_size_in_words(),
                };
                let offset = allocators
                    .get(location)
                    .allocate(size, Some(location_of(&decl.node)))?;
                layout.positions.insert(
                    (module.resolved_path.clone(), decl.name.clone()),
                    VarPosition {
                        location,
                        offset,
                        size,
                    },
                );
            }
            _ => {}
        }
    }
    Ok(())
}

// tracks occupied slots when an override file pins positions
#[derive(Debug, Default)]
struct OverridingStorageAllocator {
    occupied_slots: HashMap<U256, String>,
}

impl OverridingStorageAllocator {
    fn reserve_slot_range(
        &mut self,
        first_slot: U256,
        n_slots: usize,
        var_name: &str,
    ) -> Result<(), CompileError> {
        for i in 0..n_slots {
            let slot = first_slot
                .checked_add(U256::from(i))
                .ok_or_else(|| {
                    CompileError::storage_layout(
                        format!(
                            "Invalid storage slot for var {var_name}, out of \
                             bounds: {first_slot}+{i}"
                        ),
                        None,
                    )
                })?;
            if let Some(collided) = self.occupied_slots.get(&slot) {
                return Err(CompileError::storage_layout(
                    format!(
                        "Storage collision! Tried to assign '{var_name}' to \
                         slot {slot} but it has already been reserved by \
                         '{collided}'"
                    ),
                    None,
                ));
            }
            self.occupied_slots.insert(slot, var_name.to_string());
        }
        Ok(())
    }
}

fn fetch_slot(
    overrides: &Value,
    path: &[String],
    var_name: &str,
) -> Result<U256, CompileError> {
    let mut cursor = overrides;
    for segment in path {
        cursor = cursor.get(segment).ok_or_else(|| {
            CompileError::storage_layout(
                format!(
                    "Could not find storage slot for {}. Have you used the \
                     correct storage layout file?",
                    path.join(".")
                ),
                None,
            )
        })?;
    }
    let slot = cursor.get("slot").and_then(Value::as_u64).ok_or_else(|| {
        CompileError::storage_layout(
            format!("no storage slot for {var_name}"),
            None,
        )
    })?;
    Ok(U256::from(slot))
}

fn allocate_with_overrides(
    module: &ModuleRc,
    imports: &ResolvedImports,
    version: EvmVersion,
    overrides: &Value,
    layout: &mut Layout,
) -> Result<(), CompileError> {
    let mut allocator = OverridingStorageAllocator::default();

    // reentrancy keys in transient storage are not overridable
    if reentrancy_key_location(version) == DataLocation::Storage
        && uses_nonreentrancy(module, imports)
    {
        let slot = overrides
            .get(GLOBAL_NONREENTRANT_KEY)
            .and_then(|v| v.get("slot"))
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                CompileError::storage_layout(
                    format!(
                        "Could not find storage slot for \
                         {GLOBAL_NONREENTRANT_KEY}. Have you used the \
                         correct storage layout file?"
                    ),
                    None,
                )
            })?;
        allocator.reserve_slot_range(
            U256::from(slot),
            NONREENTRANT_KEY_SIZE,
            GLOBAL_NONREENTRANT_KEY,
        )?;
        layout.nonreentrant = Some((DataLocation::Storage, U256::from(slot)));
    }

    allocate_with_overrides_r(
        module,
        imports,
        overrides,
        &mut allocator,
        &[],
        layout,
    )
}

fn allocate_with_overrides_r(
    module: &ModuleRc,
    imports: &ResolvedImports,
    overrides: &Value,
    allocator: &mut OverridingStorageAllocator,
    path: &[String],
    layout: &mut Layout,
) -> Result<(), CompileError> {
    for item in &module.body {
        match item {
            TopLevel::InitializesDecl(decl) => {
                let child = imports
                    .imported_module(module, &decl.module_alias)
                    .ok_or_else(|| {
                        CompileError::structure(
                            format!(
                                "initializes unknown module `{}`",
                                decl.module_alias
                            ),
                            Some(location_of(&decl.node)),
                        )
                    })?;
                let mut sub_path = path.to_vec();
                sub_path.push(decl.module_alias.clone());
                allocate_with_overrides_r(
                    &child, imports, overrides, allocator, &sub_path, layout,
                )?;
            }
            TopLevel::VariableDecl(decl) => {
                if !decl.is_state_variable()
                    || decl.location() != DataLocation::Storage
                {
                    continue;
                }
                let mut var_path = path.to_vec();
                var_path.push(decl.name.clone());
                let qualified = var_path.join(".");

                let slot = fetch_slot(overrides, &var_path, &qualified)?;
                let n_slots = decl.typ.storage_size_in_words();
                allocator.reserve_slot_range(slot, n_slots, &qualified)?;
                layout.positions.insert(
                    (module.resolved_path.clone(), decl.name.clone()),
                    VarPosition {
                        location: DataLocation::Storage,
                        offset: slot,
                        size: n_slots,
                    },
                );
            }
            _ => {}
        }
    }
    Ok(())
}

/// Whether any function in the module tree is marked nonreentrant.
pub fn uses_nonreentrancy(module: &Module, imports: &ResolvedImports) -> bool {
    if module.functions().any(|f| f.nonreentrant) {
        return true;
    }
    for item in &module.body {
        if let TopLevel::InitializesDecl(decl) = item {
            if let Some(child) = imports.imported_module(module, &decl.module_alias)
            {
                if uses_nonreentrancy(&child, imports) {
                    return true;
                }
            }
        }
    }
    false
}

const LAYOUT_KEYS: &[(DataLocation, &str)] = &[
    (DataLocation::Code, "code_layout"),
    (DataLocation::Transient, "transient_storage_layout"),
    (DataLocation::Storage, "storage_layout"),
];

fn layout_key(location: DataLocation) -> &'static str {
    LAYOUT_KEYS
        .iter()
        .find(|&&(loc, _)| loc == location)
        .map(|&(_, key)| key)
        .expect("all locations listed")
}

/// The exported layout: nested maps per region, with nested modules under
/// their `initializes` alias and the reentrancy key lifted to the top.
pub fn layout_export(
    module: &ModuleRc,
    imports: &ResolvedImports,
    layout: &Layout,
) -> Value {
    let mut ret = layout_export_r(module, imports, layout);

    if uses_nonreentrancy(module, imports) {
        if let Some((location, slot)) = layout.nonreentrant {
            let key = layout_key(location);
            let entry = ret
                .entry(key.to_string())
                .or_insert_with(|| json!({}));
            if entry.get(GLOBAL_NONREENTRANT_KEY).is_none() {
                entry[GLOBAL_NONREENTRANT_KEY] = json!({
                    "type": "nonreentrant lock",
                    "slot": slot.as_u64(),
                    "n_slots": NONREENTRANT_KEY_SIZE,
                });
            }
        }
    }

    Value::Object(ret.into_iter().collect())
}

fn layout_export_r(
    module: &ModuleRc,
    imports: &ResolvedImports,
    layout: &Layout,
) -> Map<String, Value> {
    let mut ret: Map<String, Value> = Map::new();

    for item in &module.body {
        match item {
            TopLevel::InitializesDecl(decl) => {
                let Some(child) =
                    imports.imported_module(module, &decl.module_alias)
                else {
                    continue;
                };
                let module_layout = layout_export_r(&child, imports, layout);
                for (key, subtree) in module_layout {
                    // add the module as a nested dict, but only non-empty
                    if subtree
                        .as_object()
                        .map_or(false, |m| !m.is_empty())
                    {
                        let entry = ret
                            .entry(key)
                            .or_insert_with(|| json!({}));
                        entry[decl.module_alias.clone()] = subtree;
                    }
                }
            }
            TopLevel::VariableDecl(decl) => {
                let Some(position) = layout.position(module, &decl.name)
                else {
                    continue;
                };
                let key = layout_key(position.location);
                let leaf = match position.location {
                    DataLocation::Code => json!({
                        "type": decl.typ.abi_type(),
                        "length": position.size,
                        "offset": position.offset.as_u64(),
                    }),
                    _ => json!({
                        "type": decl.typ.abi_type(),
                        "n_slots": position.size,
                        "slot": position.offset.as_u64(),
                    }),
                };
                let entry = ret
                    .entry(key.to_string())
                    .or_insert_with(|| json!({}));
                entry[decl.name.clone()] = leaf;
            }
            _ => {}
        }
    }

    ret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocation() {
        let mut alloc = SimpleAllocator::new(None);
        assert_eq!(alloc.allocate(1, None).unwrap(), U256::zero());
        assert_eq!(alloc.allocate(3, None).unwrap(), U256::one());
        assert_eq!(alloc.allocate(1, None).unwrap(), U256::from(4));
    }

    #[test]
    fn immutables_region_is_bounded() {
        let mut alloc =
            SimpleAllocator::new(Some(U256::from(IMMUTABLES_MAX_BYTES)));
        assert!(alloc.allocate(0x6000, None).is_ok());
        assert!(matches!(
            alloc.allocate(1, None),
            Err(CompileError::StorageLayout(_))
        ));
    }

    #[test]
    fn override_allocator_detects_collisions() {
        let mut alloc = OverridingStorageAllocator::default();
        alloc.reserve_slot_range(U256::from(3), 2, "a").unwrap();
        let err = alloc
            .reserve_slot_range(U256::from(4), 1, "b")
            .unwrap_err();
        assert!(err.to_string().contains("Storage collision!"));
        assert!(alloc.reserve_slot_range(U256::from(5), 1, "c").is_ok());
    }

    #[test]
    fn reentrancy_location_by_fork() {
        assert_eq!(
            reentrancy_key_location(EvmVersion::Shanghai),
            DataLocation::Storage
        );
        assert_eq!(
            reentrancy_key_location(EvmVersion::Cancun),
            DataLocation::Transient
        );
    }
}
