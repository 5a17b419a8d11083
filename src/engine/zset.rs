//! Sorted-set commands
//!
//! Record layout:
//!
//! ```text
//! Meta   | key                                  -> ZCard | member count u32
//! ZSet   | len32(key) | key | member            -> score f64 (raw bits)
//! ZScore | len32(key) | key | sortable | member -> (empty)
//! ```
//!
//! Every member owns exactly two records: the `ZSet` record maps member
//! to score for point lookups, and the `ZScore` record orders members by
//! the byte-sortable score encoding for range scans. A rescore deletes
//! the stale score record and writes both fresh.

use std::collections::{HashMap, HashSet};

use rocksdb::{Snapshot, WriteBatch};

use crate::command::Reply;
use crate::engine::merge::{MergeIter, MergeOp};
use crate::engine::{parse_float, parse_int, parse_range, Engine};
use crate::error::{Result, SetdbError};
use crate::keys::{
    encode_count, encode_score, float_value, meta_key, parse_count, parse_float_value,
    parse_score_key, set_score_key_member, set_score_key_score, upper_bound, KeyBuffer, KeyTag,
    ValueTag,
};

/// A parsed min/max score argument (`5.1`, `(5.1`, `-inf`, `+inf`).
#[derive(Debug, Clone, Copy)]
struct ScoreBound {
    value: f64,
    exclusive: bool,
}

fn parse_score_bound(arg: &[u8]) -> Result<ScoreBound> {
    let (exclusive, rest) = match arg.first() {
        Some(b'(') => (true, &arg[1..]),
        _ => (false, arg),
    };
    let value = parse_float(rest)?;
    if value.is_nan() {
        return Err(SetdbError::InvalidFloat);
    }
    Ok(ScoreBound { value, exclusive })
}

#[derive(Debug, Clone, Copy)]
enum Aggregate {
    Sum,
    Min,
    Max,
}

impl Engine {
    /// ZADD key score member [score member ...]
    pub fn zadd(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        if (args.len() - 1) % 2 != 0 {
            return Err(SetdbError::WrongArity("zadd".to_string()));
        }
        self.zadd_impl(args, false, wb)
    }

    /// ZINCRBY key increment member
    pub fn zincrby(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        self.zadd_impl(args, true, wb)
    }

    fn zadd_impl(&self, args: &[Vec<u8>], incr: bool, wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let mk = meta_key(&args[0]);
        let card = self.zcard_value(&mk, None)?;

        let mut new_members = 0u32;
        let mut last_score = 0.0f64;
        // members already written by this command, so a repeated member
        // rescans its staged score instead of double-counting
        let mut staged: HashMap<Vec<u8>, f64> = HashMap::new();
        let mut set_key = KeyBuffer::new(KeyTag::ZSet, &args[0], args[2].len());
        let mut score_key = KeyBuffer::new(KeyTag::ZScore, &args[0], 8 + args[2].len());

        for pair in args[1..].chunks(2) {
            let mut score = parse_float(&pair[0])?;
            if score.is_nan() {
                return Err(SetdbError::InvalidFloat);
            }
            let member = &pair[1];

            set_key.set_suffix(member);
            let existing = match staged.get(member.as_slice()) {
                Some(&staged_score) => Some(staged_score),
                None => {
                    let stored = if card > 0 {
                        self.store().get(set_key.as_bytes())?
                    } else {
                        None
                    };
                    match stored {
                        Some(v) => Some(parse_float_value(&v)?),
                        None => None,
                    }
                }
            };

            set_score_key_member(&mut score_key, member);
            match existing {
                Some(actual) => {
                    if incr {
                        score += actual;
                    }
                    last_score = score;
                    if score == actual {
                        continue;
                    }
                    // drop the stale score record before writing the new one
                    set_score_key_score(&mut score_key, actual);
                    wb.delete(score_key.as_bytes());
                }
                None => {
                    new_members += 1;
                    last_score = score;
                }
            }

            set_score_key_score(&mut score_key, score);
            wb.put(set_key.as_bytes(), float_value(score));
            wb.put(score_key.as_bytes(), b"");
            staged.insert(member.clone(), score);
        }

        if new_members > 0 {
            self.set_zcard(&mk, card + new_members, wb);
        }
        if incr {
            return Ok(Reply::Bulk(crate::keys::format_score(last_score)));
        }
        Ok(Reply::Int(new_members as i64))
    }

    /// ZSCORE key member
    pub fn zscore(&self, args: &[Vec<u8>], _wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let key = KeyBuffer::with_suffix(KeyTag::ZSet, &args[0], &args[1]);
        match self.store().get(key.as_bytes())? {
            Some(v) => Ok(Reply::Bulk(crate::keys::format_score(parse_float_value(
                &v,
            )?))),
            None => Ok(Reply::Nil),
        }
    }

    /// ZCARD key
    pub fn zcard(&self, args: &[Vec<u8>], _wb: &mut WriteBatch) -> Result<Reply<'_>> {
        Ok(Reply::Int(self.zcard_value(&meta_key(&args[0]), None)? as i64))
    }

    /// ZREM key member [member ...]
    pub fn zrem(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let mk = meta_key(&args[0]);
        let card = self.zcard_value(&mk, None)?;
        if card == 0 {
            return Ok(Reply::Int(0));
        }

        let mut deleted = 0u32;
        let mut seen: HashSet<&[u8]> = HashSet::new();
        let mut set_key = KeyBuffer::new(KeyTag::ZSet, &args[0], args[1].len());
        let mut score_key = KeyBuffer::new(KeyTag::ZScore, &args[0], 8 + args[1].len());
        for member in &args[1..] {
            if !seen.insert(member.as_slice()) {
                continue;
            }
            set_key.set_suffix(member);
            let Some(v) = self.store().get_nofill(set_key.as_bytes())? else {
                continue;
            };
            let score = parse_float_value(&v)?;
            set_score_key_member(&mut score_key, member);
            set_score_key_score(&mut score_key, score);
            wb.delete(set_key.as_bytes());
            wb.delete(score_key.as_bytes());
            deleted += 1;
        }
        if deleted == card {
            wb.delete(&mk);
        } else if deleted > 0 {
            self.set_zcard(&mk, card - deleted, wb);
        }
        Ok(Reply::Int(deleted as i64))
    }

    // -------------------------------------------------------------------------
    // Index ranges
    // -------------------------------------------------------------------------

    /// ZRANGE key start stop [WITHSCORES]
    pub fn zrange(&self, args: &[Vec<u8>], _wb: &mut WriteBatch) -> Result<Reply<'_>> {
        self.zrange_impl(args, false)
    }

    /// ZREVRANGE key start stop [WITHSCORES]
    pub fn zrevrange(&self, args: &[Vec<u8>], _wb: &mut WriteBatch) -> Result<Reply<'_>> {
        self.zrange_impl(args, true)
    }

    fn zrange_impl(&self, args: &[Vec<u8>], reverse: bool) -> Result<Reply<'_>> {
        // snapshot keeps the cardinality consistent with the walk
        let snapshot = self.store().snapshot();
        let card = self.zcard_value(&meta_key(&args[0]), Some(&snapshot))?;
        if card == 0 {
            return Ok(Reply::empty_array());
        }

        let (start, end) = parse_range(&args[1], &args[2], card as i64)?;
        if start > end {
            return Ok(Reply::empty_array());
        }

        let mut withscores = false;
        if args.len() >= 4 {
            if args.len() > 4 || !args[3].eq_ignore_ascii_case(b"withscores") {
                return Err(SetdbError::Syntax);
            }
            withscores = true;
        }
        let count = end + 1 - start;
        let items = if withscores { count * 2 } else { count };

        let prefix = KeyBuffer::new(KeyTag::ZScore, &args[0], 0);
        let user_key_len = args[0].len();
        let scan = if reverse {
            self.store().scan_rev(Some(snapshot), prefix, true)
        } else {
            self.store().scan(Some(snapshot), prefix, true)
        };
        let iter = scan
            .skip(start as usize)
            .take(count as usize)
            .flat_map(move |(k, _)| match parse_score_key(&k, user_key_len) {
                Ok((score, member)) => {
                    let mut out = Vec::with_capacity(2);
                    out.push(Reply::Bulk(member));
                    if withscores {
                        out.push(Reply::Bulk(crate::keys::format_score(score)));
                    }
                    out
                }
                Err(e) => vec![Reply::Error(e)],
            });
        Ok(Reply::stream(items, iter))
    }

    // -------------------------------------------------------------------------
    // Score ranges
    // -------------------------------------------------------------------------

    /// ZRANGEBYSCORE key min max [WITHSCORES] [LIMIT offset count]
    pub fn zrangebyscore(&self, args: &[Vec<u8>], _wb: &mut WriteBatch) -> Result<Reply<'_>> {
        self.zrangebyscore_impl(args, false)
    }

    /// ZREVRANGEBYSCORE key max min [WITHSCORES] [LIMIT offset count]
    pub fn zrevrangebyscore(&self, args: &[Vec<u8>], _wb: &mut WriteBatch) -> Result<Reply<'_>> {
        self.zrangebyscore_impl(args, true)
    }

    fn zrangebyscore_impl(&self, args: &[Vec<u8>], reverse: bool) -> Result<Reply<'_>> {
        // reverse form takes max before min
        let (min, max) = if reverse {
            (parse_score_bound(&args[2])?, parse_score_bound(&args[1])?)
        } else {
            (parse_score_bound(&args[1])?, parse_score_bound(&args[2])?)
        };

        let mut withscores = false;
        let mut offset = 0i64;
        let mut limit = -1i64;
        let mut i = 3;
        while i < args.len() {
            if args[i].eq_ignore_ascii_case(b"withscores") {
                withscores = true;
                i += 1;
            } else if args[i].eq_ignore_ascii_case(b"limit") && i + 2 < args.len() {
                offset = parse_int(&args[i + 1])?;
                limit = parse_int(&args[i + 2])?;
                i += 3;
            } else {
                return Err(SetdbError::Syntax);
            }
        }

        let snapshot = self.store().snapshot();
        let prefix = KeyBuffer::new(KeyTag::ZScore, &args[0], 0);
        let user_key_len = args[0].len();

        // near-bound seek position: for the forward direction the min,
        // for reverse the max. An exclusive bound skips (forward) or
        // stops before (reverse) the run of equal-score records.
        let mut near = KeyBuffer::new(KeyTag::ZScore, &args[0], 8);
        let start = if reverse {
            near.suffix_mut(8).copy_from_slice(&encode_score(max.value));
            if max.exclusive {
                near.as_bytes().to_vec()
            } else {
                upper_bound(near.as_bytes())
            }
        } else {
            near.suffix_mut(8).copy_from_slice(&encode_score(min.value));
            if min.exclusive {
                upper_bound(near.as_bytes())
            } else {
                near.as_bytes().to_vec()
            }
        };

        let scan = self
            .store()
            .scan_from(Some(snapshot), prefix, Some(&start), reverse, true);

        let mut out = Vec::new();
        let mut skipped = 0i64;
        let mut emitted = 0i64;
        for (k, _) in scan {
            if limit >= 0 && emitted >= limit {
                break;
            }
            let (score, member) = parse_score_key(&k, user_key_len)?;
            let within = if reverse {
                score > min.value || (!min.exclusive && score == min.value)
            } else {
                score < max.value || (!max.exclusive && score == max.value)
            };
            if !within {
                break;
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            out.push(Reply::Bulk(member));
            if withscores {
                out.push(Reply::Bulk(crate::keys::format_score(score)));
            }
            emitted += 1;
        }
        Ok(Reply::Array(out))
    }

    /// ZREMRANGEBYSCORE key min max
    pub fn zremrangebyscore(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let mk = meta_key(&args[0]);
        let card = self.zcard_value(&mk, None)?;
        if card == 0 {
            return Ok(Reply::Int(0));
        }
        let min = parse_score_bound(&args[1])?;
        let max = parse_score_bound(&args[2])?;

        let prefix = KeyBuffer::new(KeyTag::ZScore, &args[0], 0);
        let user_key_len = args[0].len();
        let mut near = KeyBuffer::new(KeyTag::ZScore, &args[0], 8);
        near.suffix_mut(8).copy_from_slice(&encode_score(min.value));
        let start = if min.exclusive {
            upper_bound(near.as_bytes())
        } else {
            near.as_bytes().to_vec()
        };

        let mut deleted = 0u32;
        let mut set_key = KeyBuffer::new(KeyTag::ZSet, &args[0], 0);
        for (k, _) in self.store().scan_from(None, prefix, Some(&start), false, false) {
            let (score, member) = parse_score_key(&k, user_key_len)?;
            let within = score < max.value || (!max.exclusive && score == max.value);
            if !within {
                break;
            }
            set_key.set_suffix(&member);
            wb.delete(&k);
            wb.delete(set_key.as_bytes());
            deleted += 1;
        }
        if deleted == card {
            wb.delete(&mk);
        } else if deleted > 0 {
            self.set_zcard(&mk, card - deleted, wb);
        }
        Ok(Reply::Int(deleted as i64))
    }

    // -------------------------------------------------------------------------
    // Store combinations
    // -------------------------------------------------------------------------

    /// ZUNIONSTORE destination numkeys key [key ...] [WEIGHTS ...] [AGGREGATE ...]
    pub fn zunionstore(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        self.combine_zset(args, MergeOp::Union, wb)
    }

    /// ZINTERSTORE destination numkeys key [key ...] [WEIGHTS ...] [AGGREGATE ...]
    pub fn zinterstore(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        self.combine_zset(args, MergeOp::Inter, wb)
    }

    fn combine_zset(&self, args: &[Vec<u8>], op: MergeOp, wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let destination = &args[0];
        let numkeys = parse_int(&args[1])?;
        if numkeys < 1 {
            return Err(SetdbError::Syntax);
        }
        let numkeys = numkeys as usize;
        if args.len() < 2 + numkeys {
            return Err(SetdbError::Syntax);
        }
        let source_keys = &args[2..2 + numkeys];

        let mut weights = vec![1.0f64; numkeys];
        let mut aggregate = Aggregate::Sum;
        let mut i = 2 + numkeys;
        while i < args.len() {
            if args[i].eq_ignore_ascii_case(b"weights") && i + numkeys < args.len() {
                for (w, arg) in weights.iter_mut().zip(&args[i + 1..i + 1 + numkeys]) {
                    *w = parse_float(arg).map_err(|_| {
                        SetdbError::Argument("weight value is not a float".to_string())
                    })?;
                }
                i += 1 + numkeys;
            } else if args[i].eq_ignore_ascii_case(b"aggregate") && i + 1 < args.len() {
                aggregate = if args[i + 1].eq_ignore_ascii_case(b"sum") {
                    Aggregate::Sum
                } else if args[i + 1].eq_ignore_ascii_case(b"min") {
                    Aggregate::Min
                } else if args[i + 1].eq_ignore_ascii_case(b"max") {
                    Aggregate::Max
                } else {
                    return Err(SetdbError::Syntax);
                };
                i += 2;
            } else {
                return Err(SetdbError::Syntax);
            }
        }

        self.delete_key(destination, wb)?;

        let mut count = 0u32;
        let mut set_key = KeyBuffer::new(KeyTag::ZSet, destination, 0);
        let mut score_key = KeyBuffer::new(KeyTag::ZScore, destination, 0);
        let mut iter = MergeIter::new(self.store(), source_keys, op.stops_early())?;
        while let Some(m) = iter.next_member()? {
            if !op.accepts(&m.exists) {
                continue;
            }

            // weight each contributing input's score, then aggregate
            let mut score: Option<f64> = None;
            for (idx, &present) in m.exists.iter().enumerate() {
                if !present {
                    continue;
                }
                let weighted = m.scores[idx] * weights[idx];
                score = Some(match (score, aggregate) {
                    (None, _) => weighted,
                    (Some(acc), Aggregate::Sum) => acc + weighted,
                    (Some(acc), Aggregate::Min) => acc.min(weighted),
                    (Some(acc), Aggregate::Max) => acc.max(weighted),
                });
            }
            let score = score.unwrap_or(0.0);

            set_key.set_suffix(&m.member);
            set_score_key_member(&mut score_key, &m.member);
            set_score_key_score(&mut score_key, score);
            wb.put(set_key.as_bytes(), float_value(score));
            wb.put(score_key.as_bytes(), b"");
            count += 1;
        }
        if count > 0 {
            self.set_zcard(&meta_key(destination), count, wb);
        }
        Ok(Reply::Int(count as i64))
    }

    pub(crate) fn del_zset(&self, key: &[u8], wb: &mut WriteBatch) -> Result<()> {
        let prefix = KeyBuffer::new(KeyTag::ZSet, key, 0);
        let suffix_at = prefix.prefix_len();
        let mut score_key = KeyBuffer::new(KeyTag::ZScore, key, 0);
        for (k, v) in self.store().scan(None, prefix, false) {
            let score = parse_float_value(&v)?;
            set_score_key_member(&mut score_key, &k[suffix_at..]);
            set_score_key_score(&mut score_key, score);
            wb.delete(&k);
            wb.delete(score_key.as_bytes());
        }
        Ok(())
    }

    pub(crate) fn zcard_value(&self, mk: &[u8], snapshot: Option<&Snapshot<'_>>) -> Result<u32> {
        let meta = match snapshot {
            Some(snap) => self.store().get_at(snap, mk)?,
            None => self.store().get(mk)?,
        };
        match meta {
            None => Ok(0),
            Some(v) => parse_count(&v, ValueTag::ZCard),
        }
    }

    pub(crate) fn set_zcard(&self, mk: &[u8], card: u32, wb: &mut WriteBatch) {
        wb.put(mk, encode_count(ValueTag::ZCard, card));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_bounds() {
        let b = parse_score_bound(b"5.1").unwrap();
        assert_eq!(b.value, 5.1);
        assert!(!b.exclusive);

        let b = parse_score_bound(b"(5.1").unwrap();
        assert_eq!(b.value, 5.1);
        assert!(b.exclusive);

        assert_eq!(parse_score_bound(b"-inf").unwrap().value, f64::NEG_INFINITY);
        assert_eq!(parse_score_bound(b"+inf").unwrap().value, f64::INFINITY);
        assert_eq!(parse_score_bound(b"inf").unwrap().value, f64::INFINITY);
        let b = parse_score_bound(b"(-inf").unwrap();
        assert!(b.exclusive);

        assert!(parse_score_bound(b"nan").is_err());
        assert!(parse_score_bound(b"abc").is_err());
        assert!(parse_score_bound(b"(").is_err());
    }
}
