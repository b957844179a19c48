//! Assembly-level dead-code elimination and peephole cleanup.
//!
//! The eliminator partitions the item stream into label-delimited regions,
//! builds a reachability graph (fallthrough edges plus label references)
//! rooted at the program entry, and drops regions nothing can reach.
//! Removing a region can orphan further labels, so the reference edges are
//! part of the same fixpoint rather than a separate pass.

use std::collections::{HashMap, HashSet};

use crate::item::{AssemblyItem, DataItem, Label, SymbolRef};

#[derive(Debug)]
struct Region {
    // None for the entry region before the first label
    label: Option<Label>,
    is_data: bool,
    start: usize,
    end: usize, // exclusive
}

fn split_regions(items: &[AssemblyItem]) -> Vec<Region> {
    let mut regions = Vec::new();
    let mut start = 0usize;
    let mut label: Option<Label> = None;
    let mut is_data = false;

    for (i, item) in items.iter().enumerate() {
        let boundary = match item {
            AssemblyItem::Label(l) => Some((l.clone(), false)),
            AssemblyItem::DataHeader(l) => Some((l.clone(), true)),
            _ => None,
        };
        if let Some((l, data)) = boundary {
            if i > start || label.is_some() || i == 0 {
                regions.push(Region {
                    label: label.take(),
                    is_data,
                    start,
                    end: i,
                });
            }
            label = Some(l);
            is_data = data;
            start = i;
        }
    }
    regions.push(Region {
        label,
        is_data,
        start,
        end: items.len(),
    });
    regions
}

fn referenced_labels(items: &[AssemblyItem]) -> Vec<Label> {
    let mut refs = Vec::new();
    for item in items {
        match item {
            AssemblyItem::PushLabel(l)
            | AssemblyItem::PushOffset(SymbolRef::Label(l), _)
            | AssemblyItem::Data(DataItem::Label(l)) => refs.push(l.clone()),
            _ => {}
        }
    }
    refs
}

// whether control can run off the end of the region into the next one
fn falls_through(items: &[AssemblyItem]) -> bool {
    items
        .iter()
        .rev()
        .find(|item| {
            !matches!(
                item,
                AssemblyItem::Const { .. }
                    | AssemblyItem::ConstAdd { .. }
                    | AssemblyItem::ConstMax { .. }
            )
        })
        .map_or(true, |item| !item.is_terminator())
}

/// Remove regions unreachable from the program entry. References from
/// surviving regions (pushes of a label, data-section label slots) keep
/// their targets alive; everything else goes, including the shared revert
/// block when nothing jumps to it.
pub fn eliminate_dead_code(items: Vec<AssemblyItem>) -> Vec<AssemblyItem> {
    let regions = split_regions(&items);
    let by_label: HashMap<Label, usize> = regions
        .iter()
        .enumerate()
        .filter_map(|(i, r)| r.label.clone().map(|l| (l, i)))
        .collect();

    let mut live: HashSet<usize> = HashSet::new();
    let mut worklist: Vec<usize> = vec![0];

    while let Some(i) = worklist.pop() {
        if !live.insert(i) {
            continue;
        }
        let region = &regions[i];
        let body = &items[region.start..region.end];

        for target in referenced_labels(body) {
            if let Some(&j) = by_label.get(&target) {
                if !live.contains(&j) {
                    worklist.push(j);
                }
            }
        }

        if !region.is_data && falls_through(body) {
            if let Some(next) = regions.get(i + 1) {
                if !next.is_data && !live.contains(&(i + 1)) {
                    worklist.push(i + 1);
                }
            }
        }
    }

    let mut out = Vec::with_capacity(items.len());
    for (i, region) in regions.iter().enumerate() {
        if live.contains(&i) {
            out.extend_from_slice(&items[region.start..region.end]);
        } else {
            // constant declarations are position-independent; keep them
            // even when their region dies
            for item in &items[region.start..region.end] {
                if matches!(
                    item,
                    AssemblyItem::Const { .. }
                        | AssemblyItem::ConstAdd { .. }
                        | AssemblyItem::ConstMax { .. }
                ) {
                    out.push(item.clone());
                }
            }
        }
    }
    out
}

/// Local cleanups over the item stream:
///
/// * instructions following an unconditional terminator (up to the next
///   label or data header) are unreachable and removed,
/// * `ISZERO ISZERO ISZERO` collapses to `ISZERO`,
/// * `ISZERO ISZERO` before `PUSHLABEL .. JUMPI` is a no-op and removed,
/// * a label defined immediately after another label is merged into it.
pub fn peephole(mut items: Vec<AssemblyItem>) -> Vec<AssemblyItem> {
    prune_after_terminators(&mut items);
    merge_iszero(&mut items);
    merge_adjacent_labels(&mut items);
    items
}

fn prune_after_terminators(items: &mut Vec<AssemblyItem>) {
    let mut i = 0;
    while i < items.len() {
        if items[i].is_terminator() {
            let mut j = i + 1;
            while j < items.len() {
                match &items[j] {
                    AssemblyItem::Label(_)
                    | AssemblyItem::DataHeader(_)
                    | AssemblyItem::Const { .. }
                    | AssemblyItem::ConstAdd { .. }
                    | AssemblyItem::ConstMax { .. } => break,
                    _ => {
                        items.remove(j);
                    }
                }
            }
        }
        i += 1;
    }
}

fn is_iszero(item: &AssemblyItem) -> bool {
    item.mnemonic() == Some("ISZERO")
}

fn merge_iszero(items: &mut Vec<AssemblyItem>) {
    let mut i = 0;
    while i + 2 < items.len() {
        if is_iszero(&items[i]) && is_iszero(&items[i + 1]) && is_iszero(&items[i + 2])
        {
            items.drain(i..i + 2);
        } else {
            i += 1;
        }
    }

    let mut i = 0;
    while i + 3 < items.len() {
        if is_iszero(&items[i])
            && is_iszero(&items[i + 1])
            && matches!(items[i + 2], AssemblyItem::PushLabel(_))
            && items[i + 3].mnemonic() == Some("JUMPI")
        {
            items.drain(i..i + 2);
        } else {
            i += 1;
        }
    }
}

fn merge_adjacent_labels(items: &mut Vec<AssemblyItem>) {
    loop {
        let mut alias: Option<(Label, Label)> = None;
        for w in items.windows(2) {
            if let (AssemblyItem::Label(a), AssemblyItem::Label(b)) = (&w[0], &w[1])
            {
                alias = Some((b.clone(), a.clone()));
                break;
            }
        }
        let Some((from, to)) = alias else { break };

        items.retain(|item| item != &AssemblyItem::Label(from.clone()));
        for item in items.iter_mut() {
            match item {
                AssemblyItem::PushLabel(l)
                | AssemblyItem::PushOffset(SymbolRef::Label(l), _)
                | AssemblyItem::Data(DataItem::Label(l))
                | AssemblyItem::DataHeader(l) => {
                    if *l == from {
                        *l = to.clone();
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::jump_to;

    fn label(name: &str) -> AssemblyItem {
        AssemblyItem::Label(Label::new(name))
    }

    #[test]
    fn unreachable_region_is_removed() {
        let mut items = vec![AssemblyItem::op("STOP")];
        items.push(label("dead"));
        items.push(AssemblyItem::op("POP"));
        items.push(AssemblyItem::op("STOP"));
        items.push(label("live"));
        items.push(AssemblyItem::op("STOP"));
        // entry references live but not dead
        let mut program = vec![AssemblyItem::PushLabel(Label::new("live"))];
        program.push(AssemblyItem::op("JUMP"));
        program.extend(items);

        let out = eliminate_dead_code(program);
        assert!(!out.contains(&label("dead")));
        assert!(out.contains(&label("live")));
    }

    #[test]
    fn transitively_dead_references_die_too() {
        // entry: STOP. a -> b, but nothing reaches a.
        let mut program = vec![AssemblyItem::op("STOP")];
        program.push(label("a"));
        program.extend(jump_to(Label::new("b")));
        program.push(label("b"));
        program.push(AssemblyItem::op("STOP"));

        let out = eliminate_dead_code(program);
        assert!(!out.contains(&label("a")));
        assert!(!out.contains(&label("b")));
    }

    #[test]
    fn fallthrough_keeps_next_region() {
        let program = vec![
            AssemblyItem::op("POP"),
            label("next"),
            AssemblyItem::op("STOP"),
        ];
        let out = eliminate_dead_code(program.clone());
        assert_eq!(out, program);
    }

    #[test]
    fn data_sections_survive_when_referenced() {
        let mut program = vec![AssemblyItem::PushLabel(Label::new("blob"))];
        program.push(AssemblyItem::op("STOP"));
        program.push(AssemblyItem::DataHeader(Label::new("blob")));
        program.push(AssemblyItem::Data(DataItem::Bytes(vec![1])));
        program.push(AssemblyItem::DataHeader(Label::new("orphan")));
        program.push(AssemblyItem::Data(DataItem::Bytes(vec![2])));

        let out = eliminate_dead_code(program);
        assert!(out.contains(&AssemblyItem::DataHeader(Label::new("blob"))));
        assert!(!out.contains(&AssemblyItem::DataHeader(Label::new("orphan"))));
    }

    #[test]
    fn prunes_instructions_after_terminator() {
        let program = vec![
            AssemblyItem::op("JUMP"),
            AssemblyItem::op("POP"),
            AssemblyItem::op("POP"),
            label("next"),
            AssemblyItem::op("STOP"),
        ];
        let out = peephole(program);
        assert_eq!(
            out,
            vec![
                AssemblyItem::op("JUMP"),
                label("next"),
                AssemblyItem::op("STOP"),
            ]
        );
    }

    #[test]
    fn collapses_iszero_chains() {
        let program = vec![
            AssemblyItem::op("ISZERO"),
            AssemblyItem::op("ISZERO"),
            AssemblyItem::op("ISZERO"),
            AssemblyItem::op("STOP"),
        ];
        let out = peephole(program);
        assert_eq!(
            out,
            vec![AssemblyItem::op("ISZERO"), AssemblyItem::op("STOP")]
        );

        let program = vec![
            AssemblyItem::op("ISZERO"),
            AssemblyItem::op("ISZERO"),
            AssemblyItem::PushLabel(Label::new("t")),
            AssemblyItem::op("JUMPI"),
            label("t"),
        ];
        let out = peephole(program);
        assert_eq!(
            out,
            vec![
                AssemblyItem::PushLabel(Label::new("t")),
                AssemblyItem::op("JUMPI"),
                label("t"),
            ]
        );
    }

    #[test]
    fn merges_adjacent_labels() {
        let program = vec![
            AssemblyItem::PushLabel(Label::new("b")),
            AssemblyItem::op("JUMP"),
            label("a"),
            label("b"),
            AssemblyItem::op("STOP"),
        ];
        let out = peephole(program);
        assert!(!out.contains(&label("b")));
        assert_eq!(out[0], AssemblyItem::PushLabel(Label::new("a")));
    }
}
