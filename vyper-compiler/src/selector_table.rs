//! Selector-table construction: bucketed linear search for the gas-optimized
//! dispatcher, and a two-layer perfect hash for the codesize-optimized one.

use std::collections::BTreeMap;

use ethereum_types::U256;
use vyper_asm::{AssemblyItem, DataItem, Label};
use vyper_ir::{IrNode, IrOp, FREE_VAR_SPACE};

use crate::error::CompileError;

/// An externally callable method as the dispatcher sees it.
#[derive(Debug, Clone)]
pub struct ExternalMethod {
    /// Canonical signature.
    pub signature: String,
    /// 4-byte selector as a big-endian integer.
    pub selector: u32,
    /// The method's entry label in the runtime program.
    pub entry_label: String,
}

/// Shift used by the inner perfect-hash layer; takes the upper bits of the
/// multiplication for more entropy.
pub const BITS_MAGIC: u32 = 24;

fn image_of(xs: &[u32], magic: u32) -> Vec<usize> {
    xs.iter()
        .map(|&x| {
            (((x as u64 * magic as u64) >> BITS_MAGIC) % xs.len() as u64)
                as usize
        })
        .collect()
}

/// Find a 16-bit multiplier whose image is a permutation of
/// `[0, len)`. Exhaustive and deterministic.
pub fn find_magic_for(xs: &[u32]) -> Option<u32> {
    (0..1u32 << 16).find(|&m| {
        let image = image_of(xs, m);
        let mut seen = vec![false; xs.len()];
        image.iter().all(|&i| !std::mem::replace(&mut seen[i], true))
    })
}

fn mk_buckets(method_ids: &[u32], n_buckets: usize) -> BTreeMap<usize, Vec<u32>> {
    let mut buckets: BTreeMap<usize, Vec<u32>> = BTreeMap::new();
    for &x in method_ids {
        buckets
            .entry((x as usize) % n_buckets)
            .or_default()
            .push(x);
    }
    buckets
}

/// One perfect-hash bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    /// Bucket id (the outer-layer index).
    pub bucket_id: usize,
    /// The inner-layer multiplier.
    pub magic: u32,
    /// Selectors in input order.
    pub method_ids: Vec<u32>,
}

impl Bucket {
    /// Inner-hash image of each selector, a permutation of
    /// `[0, bucket_size)`.
    pub fn image(&self) -> Vec<usize> {
        image_of(&self.method_ids, self.magic)
    }

    /// Selectors sorted by their image, the order entries are emitted in.
    pub fn method_ids_image_order(&self) -> Vec<u32> {
        let mut paired: Vec<(usize, u32)> = self
            .image()
            .into_iter()
            .zip(self.method_ids.iter().copied())
            .collect();
        paired.sort();
        paired.into_iter().map(|(_, id)| id).collect()
    }

    /// Number of methods in the bucket.
    pub fn bucket_size(&self) -> usize {
        self.method_ids.len()
    }
}

enum DenseFailure {
    HasEmptyBuckets,
    FindMagicFailure,
}

// two-layer perfect hash: outer layer is selector % n_buckets, inner layer
// multiplies by a per-bucket magic
fn dense_jumptable_info(
    method_ids: &[u32],
    n_buckets: usize,
) -> Result<BTreeMap<usize, Bucket>, DenseFailure> {
    let buckets = mk_buckets(method_ids, n_buckets);

    // empty buckets would corrupt the bucket-header layout
    if buckets.len() != n_buckets {
        return Err(DenseFailure::HasEmptyBuckets);
    }

    let mut ret = BTreeMap::new();
    for (bucket_id, method_ids) in buckets {
        let magic =
            find_magic_for(&method_ids).ok_or(DenseFailure::FindMagicFailure)?;
        ret.insert(
            bucket_id,
            Bucket {
                bucket_id,
                magic,
                method_ids,
            },
        );
    }
    Ok(ret)
}

const START_BUCKET_SIZE: usize = 5;

/// Search for the smallest workable bucket count for the dense table.
///
/// Starts around `n / 5` buckets and keeps shrinking past each success;
/// the first inner-hash failure after a success ends the search with the
/// best (smallest) solution. If the initial guess fails outright, falls
/// back once to `n` buckets before giving up.
pub fn generate_dense_jumptable_info(
    method_ids: &[u32],
) -> Result<(usize, BTreeMap<usize, Bucket>), CompileError> {
    let n = method_ids.len();
    let mut n_buckets = n / START_BUCKET_SIZE + 1;
    let mut ret = None;
    let mut tried_exhaustive = false;

    while n_buckets > 0 {
        match dense_jumptable_info(method_ids, n_buckets) {
            Ok(solution) => {
                ret = Some((n_buckets, solution));
            }
            Err(DenseFailure::HasEmptyBuckets) => {
                // skip; a smaller bucket count may still work
            }
            Err(DenseFailure::FindMagicFailure) => {
                if ret.is_some() {
                    break;
                }
                if !tried_exhaustive {
                    n_buckets = n;
                    tried_exhaustive = true;
                    continue;
                }
                return Err(CompileError::panic(format!(
                    "Could not generate jumptable! {method_ids:?}"
                )));
            }
        }
        n_buckets -= 1;
    }

    ret.ok_or_else(|| {
        CompileError::panic("Could not generate jumptable!".to_string())
    })
}

/// Choose the sparse bucket count from `[⌈0.85n⌉, ⌈1.15n⌉]`, minimizing the
/// worst bucket size (smallest count wins ties).
pub fn generate_sparse_jumptable_buckets(
    method_ids: &[u32],
) -> (usize, BTreeMap<usize, Vec<u32>>) {
    let n = method_ids.len();
    let lo = 1.max((n as f64 * 0.85).floor() as usize);
    let hi = 1.max((n as f64 * 1.15).ceil() as usize);

    let mut best: Option<(usize, usize, BTreeMap<usize, Vec<u32>>)> = None;
    for i in lo..=hi {
        let buckets = mk_buckets(method_ids, i);
        let max_bucket_size =
            buckets.values().map(Vec::len).max().unwrap_or(0);
        let better = match &best {
            None => true,
            Some((_, best_size, _)) => max_bucket_size < *best_size,
        };
        if better {
            best = Some((i, max_bucket_size, buckets));
        }
    }

    let (i, _, buckets) = best.expect("bucket range is never empty");
    (i, buckets)
}

const BUCKET_HEADERS: &str = "bucket_headers";

fn bucket_label(b: usize) -> String {
    format!("selector_bucket_{b}")
}

fn bucket_entries_label(b: usize) -> String {
    format!("bucket_{b}_entries")
}

const SELECTOR_VAR: &str = "_calldata_method_id";

fn ir(op: IrOp, args: Vec<IrNode>) -> IrNode {
    IrNode::new(op, args)
}

fn sel() -> IrNode {
    IrNode::var(SELECTOR_VAR)
}

// guard: anything shorter than a selector goes to the fallback
fn short_calldata_guard(fallback: &str) -> IrNode {
    ir(
        IrOp::If,
        vec![
            ir(
                IrOp::Lt,
                vec![
                    ir(IrOp::Calldatasize, vec![]),
                    IrNode::num(4u64),
                ],
            ),
            IrNode::goto(fallback),
        ],
    )
}

// zero scratch, copy `len` code bytes so they land in the low bytes of the
// scratch word, and load it
fn codeload_tail(src: IrNode, len: u64) -> IrNode {
    IrNode::seq(vec![
        ir(
            IrOp::Mstore,
            vec![IrNode::num(FREE_VAR_SPACE), IrNode::num(0u64)],
        ),
        ir(
            IrOp::Codecopy,
            vec![
                IrNode::num(FREE_VAR_SPACE + 32 - len),
                src,
                IrNode::num(len),
            ],
        ),
        ir(IrOp::Mload, vec![IrNode::num(FREE_VAR_SPACE)]),
    ])
}

/// Build the gas-optimized dispatcher: IR prologue plus the bucket-header
/// data section. Bucket bodies are inline selector comparisons.
pub fn sparse_dispatcher(
    methods: &[ExternalMethod],
    fallback: &str,
) -> (IrNode, Vec<AssemblyItem>) {
    if methods.is_empty() {
        return (IrNode::goto(fallback), vec![]);
    }

    let method_ids: Vec<u32> = methods.iter().map(|m| m.selector).collect();
    let (n_buckets, buckets) = generate_sparse_jumptable_buckets(&method_ids);

    let by_selector: BTreeMap<u32, &ExternalMethod> =
        methods.iter().map(|m| (m.selector, m)).collect();

    // jump through the header table to the bucket's comparison chain
    let mut body = vec![
        ir(
            IrOp::Jump,
            vec![codeload_tail(
                ir(
                    IrOp::Add,
                    vec![
                        IrNode::symbol(BUCKET_HEADERS),
                        ir(
                            IrOp::Mul,
                            vec![
                                IrNode::num(2u64),
                                ir(
                                    IrOp::Mod,
                                    vec![sel(), IrNode::num(n_buckets as u64)],
                                ),
                            ],
                        ),
                    ],
                ),
                2,
            )],
        ),
    ];

    for (&bucket_id, bucket_methods) in &buckets {
        let mut section = vec![IrNode::label(bucket_label(bucket_id))];
        for &selector in bucket_methods {
            let method = by_selector[&selector];
            section.push(ir(
                IrOp::If,
                vec![
                    ir(
                        IrOp::Eq,
                        vec![sel(), IrNode::num(U256::from(selector))],
                    ),
                    IrNode::goto(method.entry_label.clone()),
                ],
            ));
        }
        section.push(IrNode::goto(fallback));
        body.push(IrNode::seq(section));
    }

    let prologue = IrNode::seq(vec![
        short_calldata_guard(fallback),
        IrNode::with(
            SELECTOR_VAR,
            ir(
                IrOp::Shr,
                vec![
                    IrNode::num(224u64),
                    ir(IrOp::Calldataload, vec![IrNode::num(0u64)]),
                ],
            ),
            IrNode::seq(body),
        ),
    ]);

    let mut data = vec![AssemblyItem::DataHeader(Label::new(BUCKET_HEADERS))];
    for b in 0..n_buckets {
        let target = if buckets.contains_key(&b) {
            bucket_label(b)
        } else {
            fallback.to_string()
        };
        data.push(AssemblyItem::Data(DataItem::Label(Label::new(target))));
    }

    (prologue, data)
}

/// Build the codesize-optimized dispatcher: IR prologue plus the 5-byte
/// bucket headers (`magic:2 | size:1 | ofst:2`) and one entries section per
/// bucket (`selector:4 | entry:2` per method, in image order).
pub fn dense_dispatcher(
    methods: &[ExternalMethod],
    fallback: &str,
) -> Result<(IrNode, Vec<AssemblyItem>), CompileError> {
    if methods.is_empty() {
        return Ok((IrNode::goto(fallback), vec![]));
    }

    let method_ids: Vec<u32> = methods.iter().map(|m| m.selector).collect();
    let (n_buckets, buckets) = generate_dense_jumptable_info(&method_ids)?;

    let by_selector: BTreeMap<u32, &ExternalMethod> =
        methods.iter().map(|m| (m.selector, m)).collect();

    // header = magic << 24 | size << 16 | ofst
    let hdr = || IrNode::var("_bucket_header");
    let entry = || IrNode::var("_entry");
    let magic = ir(IrOp::Shr, vec![IrNode::num(24u64), hdr()]);
    let size = ir(
        IrOp::And,
        vec![
            ir(IrOp::Shr, vec![IrNode::num(16u64), hdr()]),
            IrNode::num(0xffu64),
        ],
    );
    let ofst = ir(
        IrOp::And,
        vec![hdr(), IrNode::num(0xffffu64)],
    );

    let inner_index = ir(
        IrOp::Mod,
        vec![
            ir(
                IrOp::Shr,
                vec![
                    IrNode::num(BITS_MAGIC as u64),
                    ir(IrOp::Mul, vec![sel(), magic]),
                ],
            ),
            size,
        ],
    );

    let entry_addr = ir(
        IrOp::Add,
        vec![ofst, ir(IrOp::Mul, vec![IrNode::num(6u64), inner_index])],
    );

    let dispatch = IrNode::with(
        "_bucket_header",
        codeload_tail(
            ir(
                IrOp::Add,
                vec![
                    IrNode::symbol(BUCKET_HEADERS),
                    ir(
                        IrOp::Mul,
                        vec![
                            IrNode::num(5u64),
                            ir(
                                IrOp::Mod,
                                vec![sel(), IrNode::num(n_buckets as u64)],
                            ),
                        ],
                    ),
                ],
            ),
            5,
        ),
        IrNode::with(
            "_entry",
            codeload_tail(entry_addr, 6),
            IrNode::seq(vec![
                // candidate selector mismatch falls through to the default
                ir(
                    IrOp::If,
                    vec![
                        ir(
                            IrOp::Xor,
                            vec![
                                sel(),
                                ir(
                                    IrOp::Shr,
                                    vec![IrNode::num(16u64), entry()],
                                ),
                            ],
                        ),
                        IrNode::goto(fallback),
                    ],
                ),
                ir(
                    IrOp::Jump,
                    vec![ir(
                        IrOp::And,
                        vec![entry(), IrNode::num(0xffffu64)],
                    )],
                ),
            ]),
        ),
    );

    let prologue = IrNode::seq(vec![
        short_calldata_guard(fallback),
        IrNode::with(
            SELECTOR_VAR,
            ir(
                IrOp::Shr,
                vec![
                    IrNode::num(224u64),
                    ir(IrOp::Calldataload, vec![IrNode::num(0u64)]),
                ],
            ),
            dispatch,
        ),
    ]);

    let mut data = vec![AssemblyItem::DataHeader(Label::new(BUCKET_HEADERS))];
    for bucket in buckets.values() {
        let magic = u16::try_from(bucket.magic)
            .map_err(|_| CompileError::panic("magic exceeds 16 bits"))?;
        let size = u8::try_from(bucket.bucket_size())
            .map_err(|_| CompileError::panic("bucket size exceeds 255"))?;
        data.push(AssemblyItem::Data(DataItem::Bytes(vec![
            (magic >> 8) as u8,
            (magic & 0xff) as u8,
            size,
        ])));
        data.push(AssemblyItem::Data(DataItem::Label(Label::new(
            bucket_entries_label(bucket.bucket_id),
        ))));
    }
    for bucket in buckets.values() {
        data.push(AssemblyItem::DataHeader(Label::new(bucket_entries_label(
            bucket.bucket_id,
        ))));
        for selector in bucket.method_ids_image_order() {
            let method = by_selector[&selector];
            data.push(AssemblyItem::Data(DataItem::Bytes(
                selector.to_be_bytes().to_vec(),
            )));
            data.push(AssemblyItem::Data(DataItem::Label(Label::new(
                method.entry_label.clone(),
            ))));
        }
    }

    Ok((prologue, data))
}
