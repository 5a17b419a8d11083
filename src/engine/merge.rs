//! Multi-Key Merge Iterator
//!
//! Streams the sorted merge of N set/zset key-spaces under one snapshot.
//! One scan per input key; each round emits the smallest current member
//! together with, per input, whether it was present and with what score.
//! Output members are strictly ascending in byte order, so duplicates
//! across inputs collapse into a single emission.

use std::rc::Rc;

use crate::error::Result;
use crate::keys::{meta_key, parse_count, parse_float_value, KeyBuffer, KeyTag, ValueTag};
use crate::storage::{PrefixScan, Store};

/// How emissions are filtered by the set-combination commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOp {
    Union,
    Inter,
    Diff,
}

impl MergeOp {
    /// Whether an emission with this presence vector is part of the result.
    pub fn accepts(self, exists: &[bool]) -> bool {
        match self {
            MergeOp::Union => true,
            MergeOp::Inter => exists.iter().all(|&e| e),
            MergeOp::Diff => exists[0] && !exists[1..].iter().any(|&e| e),
        }
    }

    /// Intersection cannot produce anything once the first input runs dry.
    pub fn stops_early(self) -> bool {
        self == MergeOp::Inter
    }
}

/// One merged emission: the member plus per-input presence and scores.
pub struct MergedMember {
    pub member: Vec<u8>,
    pub exists: Vec<bool>,
    pub scores: Vec<f64>,
}

struct MergeInput<'a> {
    scan: PrefixScan<'a>,
    head: Option<(Vec<u8>, f64)>,
    scored: bool,
}

impl MergeInput<'_> {
    fn advance(&mut self) -> Result<()> {
        self.head = match self.scan.next() {
            Some((k, v)) => {
                let member = k[self.scan.prefix_len()..].to_vec();
                // non-scored inputs contribute an implicit score of 1.0
                let score = if self.scored {
                    parse_float_value(&v)?
                } else {
                    1.0
                };
                Some((member, score))
            }
            None => None,
        };
        Ok(())
    }
}

pub struct MergeIter<'a> {
    inputs: Vec<MergeInput<'a>>,
    stop_early: bool,
}

impl<'a> MergeIter<'a> {
    /// Open one scan per input key under a shared snapshot. Each input's
    /// key-space is chosen by its metadata: a sorted set iterates its
    /// `ZSet` records (member -> score); anything else iterates the `Set`
    /// prefix, so missing keys and foreign aggregates yield nothing.
    pub fn new(store: &'a Store, keys: &[Vec<u8>], stop_early: bool) -> Result<MergeIter<'a>> {
        let snapshot = store.snapshot();
        let mut inputs = Vec::with_capacity(keys.len());
        for key in keys {
            let scored = match store.get_at(&snapshot, &meta_key(key))? {
                Some(v) if v.first() == Some(&(ValueTag::ZCard as u8)) => {
                    parse_count(&v, ValueTag::ZCard)? > 0
                }
                _ => false,
            };
            let tag = if scored { KeyTag::ZSet } else { KeyTag::Set };
            let scan = store.scan(Some(Rc::clone(&snapshot)), KeyBuffer::new(tag, key, 0), true);
            let mut input = MergeInput {
                scan,
                head: None,
                scored,
            };
            input.advance()?;
            inputs.push(input);
        }
        Ok(MergeIter { inputs, stop_early })
    }

    /// The next merged member in ascending byte order, or None when the
    /// inputs are exhausted.
    pub fn next_member(&mut self) -> Result<Option<MergedMember>> {
        if self.stop_early && self.inputs[0].head.is_none() {
            return Ok(None);
        }

        let mut candidate: Option<Vec<u8>> = None;
        for input in &self.inputs {
            if let Some((member, _)) = &input.head {
                if candidate.as_ref().map_or(true, |c| member < c) {
                    candidate = Some(member.clone());
                }
            }
        }
        let Some(member) = candidate else {
            return Ok(None);
        };

        let n = self.inputs.len();
        let mut out = MergedMember {
            member,
            exists: vec![false; n],
            scores: vec![0.0; n],
        };
        for (i, input) in self.inputs.iter_mut().enumerate() {
            let hit = matches!(&input.head, Some((m, _)) if *m == out.member);
            if hit {
                if let Some((_, score)) = input.head.take() {
                    out.exists[i] = true;
                    out.scores[i] = score;
                }
                input.advance()?;
            }
        }
        Ok(Some(out))
    }
}
