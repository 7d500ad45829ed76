use std::cmp::Ordering;
use std::collections::HashSet;

use indexmap::IndexMap;

use crate::types::{CompiledUtil, UtilBody};

/// Assigns each distinct parent a sequence number in first-seen order.
///
/// Utils are visited in (order, parent order, token) order, so the numbering
/// only depends on the set of utils and never on the order tokens arrived in.
pub fn parent_sequence(utils: &[CompiledUtil]) -> IndexMap<String, usize> {
    let mut visit = utils.iter().collect::<Vec<_>>();
    visit.sort_by(|a, b| {
        a.order
            .cmp(&b.order)
            .then(a.parent_order.cmp(&b.parent_order))
            .then_with(|| a.token.cmp(&b.token))
    });

    let mut sequence = IndexMap::new();
    for util in visit {
        if let Some(parent) = &util.parent {
            let next = sequence.len();
            sequence.entry(parent.clone()).or_insert(next);
        }
    }
    sequence
}

fn compare(a: &CompiledUtil, b: &CompiledUtil, sequence: &IndexMap<String, usize>) -> Ordering {
    let seq = |util: &CompiledUtil| {
        util.parent
            .as_ref()
            .and_then(|parent| sequence.get(parent))
            .map(|seq| seq + 1)
            .unwrap_or(0)
    };
    a.order
        .cmp(&b.order)
        .then(a.parent_order.cmp(&b.parent_order))
        .then_with(|| seq(a).cmp(&seq(b)))
        .then(a.sort.cmp(&b.sort))
        .then(a.sub_order.cmp(&b.sub_order))
        .then_with(|| a.selector.cmp(&b.selector))
        .then_with(|| a.token.cmp(&b.token))
}

/// Sorts the utils of one layer. Order is primary, parent-less utils come
/// before wrapped ones, and wrapped ones follow their parent's declared
/// order and then first-seen sequence.
pub fn sort_utils(mut utils: Vec<CompiledUtil>) -> Vec<CompiledUtil> {
    let sequence = parent_sequence(&utils);
    utils.sort_by(|a, b| compare(a, b, &sequence));
    utils
}

/// Merges neighbouring utils that share selector and parent, unless either
/// opted out. Identical raw CSS blocks are emitted once.
pub fn merge_utils(utils: Vec<CompiledUtil>) -> Vec<CompiledUtil> {
    let mut merged: Vec<CompiledUtil> = Vec::with_capacity(utils.len());
    let mut raw_seen = HashSet::new();

    for util in utils {
        if let UtilBody::Raw(css) = &util.body {
            if raw_seen.insert(css.clone()) {
                merged.push(util);
            }
            continue;
        }
        if let Some(last) = merged.last_mut() {
            if last.merge_key().is_some() && last.merge_key() == util.merge_key() {
                if let (UtilBody::Declarations(into), UtilBody::Declarations(from)) =
                    (&mut last.body, util.body)
                {
                    for entry in from {
                        if !into.contains(&entry) {
                            into.push(entry);
                        }
                    }
                }
                continue;
            }
        }
        merged.push(util);
    }

    merged
}
