//! IP policies: per-subnet exclusions that automatic allocation must skip.
//!
//! A policy is a list of CIDR fragments (network, broadcast, gateway or any
//! other reserved block). For allocation the fragments are flattened into
//! sorted, non-overlapping integer ranges clipped to the owning subnet, which
//! gives both a membership test for the draw loop and an exact excluded-size
//! for capacity checks.

use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ip_to_int, Subnet};

/// Excluded CIDR fragments attached to a subnet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpPolicy {
    pub id: Uuid,
    pub exclude: Vec<IpNet>,
}

impl IpPolicy {
    pub fn new(exclude: Vec<IpNet>) -> Self {
        Self {
            id: Uuid::new_v4(),
            exclude,
        }
    }

    /// Fragments that are not inside `cidr`
    pub fn outside_of(&self, cidr: &IpNet) -> Vec<IpNet> {
        self.exclude
            .iter()
            .filter(|net| !cidr.contains(*net))
            .cloned()
            .collect()
    }
}

/// Inclusive integer range `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExcludedRange {
    pub start: u128,
    pub end: u128,
}

impl ExcludedRange {
    fn len(&self) -> u128 {
        (self.end - self.start).saturating_add(1)
    }
}

/// Flattened exclusions of one subnet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionSet {
    ranges: Vec<ExcludedRange>,
}

impl ExclusionSet {
    /// Build from arbitrary ranges, merging overlaps and adjacency
    pub fn from_ranges(mut ranges: Vec<ExcludedRange>) -> Self {
        ranges.sort_by_key(|r| r.start);

        let mut merged: Vec<ExcludedRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if range.start <= last.end.saturating_add(1) => {
                    last.end = last.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }
        Self { ranges: merged }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of excluded addresses
    pub fn size(&self) -> u128 {
        self.ranges
            .iter()
            .fold(0u128, |acc, r| acc.saturating_add(r.len()))
    }

    /// The excluded range covering `value`, if any
    pub fn excluded_range_at(&self, value: u128) -> Option<ExcludedRange> {
        // Ranges are sorted and disjoint, so the candidate is the last range
        // starting at or before `value`
        let idx = self.ranges.partition_point(|r| r.start <= value);
        idx.checked_sub(1)
            .map(|i| self.ranges[i])
            .filter(|r| r.end >= value)
    }

    pub fn contains_int(&self, value: u128) -> bool {
        self.excluded_range_at(value).is_some()
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.contains_int(ip_to_int(*addr))
    }

    pub fn ranges(&self) -> &[ExcludedRange] {
        &self.ranges
    }
}

/// Exclusions in effect for `subnet`, clipped to its cidr.
///
/// Fragments of the other address family or entirely outside the cidr are
/// dropped.
pub fn exclusion_ranges(subnet: &Subnet) -> ExclusionSet {
    let Some(policy) = &subnet.ip_policy else {
        return ExclusionSet::default();
    };

    let (lo, hi) = (subnet.first_int(), subnet.last_int());
    let ranges = policy
        .exclude
        .iter()
        .filter(|net| matches!(
            (net, &subnet.cidr),
            (IpNet::V4(_), IpNet::V4(_)) | (IpNet::V6(_), IpNet::V6(_))
        ))
        .filter_map(|net| {
            let start = ip_to_int(net.network()).max(lo);
            let end = ip_to_int(net.broadcast()).min(hi);
            (start <= end).then_some(ExcludedRange { start, end })
        })
        .collect();

    ExclusionSet::from_ranges(ranges)
}
