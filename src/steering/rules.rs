//! Weighted traffic-split compilation
//!
//! Turns the available links of one chain into a chain program. New flows
//! draw a random number in `[0,100)` and take the mark of the bucket it falls
//! into; established flows keep the mark saved in their conntrack entry.

use super::format_mark;
use crate::config::EmptyPolicy;
use std::fmt::Write;

/// Upper end of the bucket domain (inclusive, as written in the nft map)
pub const PERCENT_DOMAIN: u32 = 100;

/// A candidate link as seen by the compiler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightedMark {
    pub mark: u32,
    /// Effective weight, at least 1
    pub weight: u32,
}

/// Inclusive range of draws mapped to one mark
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    pub start: u32,
    pub end: u32,
    pub mark: u32,
}

impl Bucket {
    /// Number of draws in `[0,100)` this bucket receives
    pub fn width(&self) -> u32 {
        self.end.min(PERCENT_DOMAIN - 1) + 1 - self.start
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainPlan {
    /// Fail closed
    Reject,
    /// Fail open: empty chain, default route applies
    PassThrough,
    Single { mark: u32 },
    Split(Vec<Bucket>),
}

/// Compile the program for one chain from its currently available links
pub fn plan(when_empty: EmptyPolicy, available: &[WeightedMark]) -> ChainPlan {
    match available {
        [] => match when_empty {
            EmptyPolicy::Reject => ChainPlan::Reject,
            EmptyPolicy::Pass => ChainPlan::PassThrough,
        },
        [only] => ChainPlan::Single { mark: only.mark },
        many => ChainPlan::Split(buckets(many)),
    }
}

/// Partition `[0,100]` into contiguous buckets in declaration order.
///
/// Bounds follow the cumulative weight, and the last bucket always ends at
/// 100, so rounding never leaves a gap. A link whose share rounds down to
/// nothing gets no bucket.
pub fn buckets(available: &[WeightedMark]) -> Vec<Bucket> {
    let total: u64 = available.iter().map(|c| u64::from(c.weight.max(1))).sum();
    let mut cumulative: u64 = 0;
    let mut start: u32 = 0;
    let mut out = Vec::with_capacity(available.len());

    for (i, candidate) in available.iter().enumerate() {
        cumulative += u64::from(candidate.weight.max(1));
        let end = if i + 1 == available.len() {
            PERCENT_DOMAIN
        } else {
            (cumulative * u64::from(PERCENT_DOMAIN) / total) as u32
        };
        if end < start {
            continue;
        }
        out.push(Bucket {
            start,
            end,
            mark: candidate.mark,
        });
        start = end + 1;
    }

    out
}

/// Render a plan as one atomic nft transaction replacing the chain's rules
pub fn render(table: &str, chain: &str, plan: &ChainPlan) -> String {
    let mut script = format!("flush chain ip {table} {chain}\n");
    let mut rule = |body: &str| {
        // Writing to a String cannot fail
        let _ = writeln!(script, "add rule ip {table} {chain} {body}");
    };

    match plan {
        ChainPlan::Reject => rule("reject"),
        ChainPlan::PassThrough => {}
        ChainPlan::Single { mark } => {
            rule(&format!("meta mark set {}", format_mark(*mark)));
            rule("ct mark set meta mark");
        }
        ChainPlan::Split(buckets) => {
            let map = buckets
                .iter()
                .map(|b| format!("{}-{} : {}", b.start, b.end, format_mark(b.mark)))
                .collect::<Vec<_>>()
                .join(", ");
            rule("ct state established,related meta mark set ct mark");
            rule(&format!(
                "ct state new meta mark set numgen random mod {PERCENT_DOMAIN} map {{ {map} }}"
            ));
            rule("ct state new ct mark set meta mark");
        }
    }

    script
}
