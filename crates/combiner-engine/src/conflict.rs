//! Splits over-inclusive name-token buckets into clusters of records that
//! plausibly belong to one person.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use combiner_core::{CustomerId, CustomerRecord};

use crate::phone;

/// A record inside a bucket: ids are unique per site only.
pub(crate) type MemberKey = (String, CustomerId);

/// Outcome of checking one pair of records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Both have orders, differing emails, or phone lists with nothing in common.
    Conflict,
    /// Both have phones and at least one number matches.
    SharedPhone,
    /// Nothing contradicts the pair being one person.
    Compatible,
}

pub fn compare(left: &CustomerRecord, right: &CustomerRecord, phone_len: usize) -> Verdict {
    if left.orders_count > 0 && right.orders_count > 0 {
        return Verdict::Conflict;
    }

    let (left_email, right_email) = (left.email_str(), right.email_str());
    if !left_email.is_empty() && !right_email.is_empty() && left_email != right_email {
        return Verdict::Conflict;
    }

    if !left.phones.is_empty() && !right.phones.is_empty() {
        return if phone::share_number(&left.phones, &right.phones, phone_len) {
            Verdict::SharedPhone
        } else {
            Verdict::Conflict
        };
    }

    Verdict::Compatible
}

pub fn same_person(left: &CustomerRecord, right: &CustomerRecord, phone_len: usize) -> bool {
    compare(left, right, phone_len) != Verdict::Conflict
}

/// Rebuild name-token buckets into per-person clusters.
///
/// Records are visited in `record_tokens` order, one token list per record. Each record gathers the
/// members of every bucket under its tokens, accepting a candidate only when
/// it agrees with every member accepted so far. Consumed buckets are removed,
/// so a later record whose tokens were already taken builds nothing, and a
/// candidate rejected from one cluster is not offered to another.
///
/// Clusters of two or more records are returned, keyed by the full name of
/// their first member.
pub(crate) fn resolve_name_clusters(
    mut buckets: BTreeMap<String, BTreeMap<MemberKey, Arc<CustomerRecord>>>,
    record_tokens: &[Vec<String>],
    phone_len: usize,
) -> BTreeMap<String, Vec<Arc<CustomerRecord>>> {
    let mut clusters: BTreeMap<String, Vec<Arc<CustomerRecord>>> = BTreeMap::new();

    for tokens in record_tokens {
        let mut cluster: Vec<Arc<CustomerRecord>> = Vec::new();
        let mut seen: HashSet<MemberKey> = HashSet::new();

        for token in tokens {
            let Some(bucket) = buckets.remove(token) else {
                continue;
            };
            for (member_key, candidate) in bucket {
                if seen.contains(&member_key) {
                    continue;
                }
                if cluster
                    .iter()
                    .all(|member| same_person(member, &candidate, phone_len))
                {
                    seen.insert(member_key);
                    cluster.push(candidate);
                }
            }
        }

        if cluster.len() < 2 {
            continue;
        }

        let name = cluster[0].full_name();
        let key = if clusters.contains_key(&name) {
            format!("{name} #{}", cluster[0].id)
        } else {
            name
        };
        clusters.insert(key, cluster);
    }

    clusters
}
