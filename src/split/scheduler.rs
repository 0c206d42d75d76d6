//! Longest-processing-time-first packing.
//!
//! Groups are visited in a total order (cost descending, then group id
//! ascending) and each one goes to the bucket with the smallest load, lowest
//! index winning ties. The result depends only on the cost map and the bucket
//! count, so every parallel node computes the same partition.

use super::CostMap;

/// Groups assigned to one parallel node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bucket {
    /// Group ids, in assignment order.
    pub groups: Vec<String>,
    /// Sum of the costs of `groups`.
    pub load: f64,
}

/// Packs the groups of `costs` into `total` buckets.
///
/// Returns `total` buckets (possibly empty). `total == 0` yields no buckets.
///
/// # Example
///
/// ```
/// use std::collections::BTreeMap;
/// use tirun::split::scheduler::pack;
///
/// let costs = BTreeMap::from([
///     ("a".to_string(), 4.0),
///     ("b".to_string(), 3.0),
///     ("c".to_string(), 3.0),
///     ("d".to_string(), 2.0),
/// ]);
/// let buckets = pack(&costs, 2);
/// assert_eq!(buckets[0].groups, vec!["a", "d"]);
/// assert_eq!(buckets[1].groups, vec!["b", "c"]);
/// ```
pub fn pack(costs: &CostMap, total: usize) -> Vec<Bucket> {
    let mut buckets = vec![Bucket::default(); total];
    if total == 0 {
        return buckets;
    }

    let mut order: Vec<(&String, f64)> = costs.iter().map(|(id, cost)| (id, *cost)).collect();
    order.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    for (id, cost) in order {
        let target = lightest(&buckets);
        let bucket = &mut buckets[target];
        bucket.groups.push(id.clone());
        bucket.load += cost;
    }

    buckets
}

fn lightest(buckets: &[Bucket]) -> usize {
    let mut best = 0;
    for (i, bucket) in buckets.iter().enumerate().skip(1) {
        if bucket.load < buckets[best].load {
            best = i;
        }
    }
    best
}
