//! Field merge planner.
//!
//! Collects what the surviving customer of every group should look like after
//! the losers are folded into it. Nothing is written here: the result is a
//! [`MergePlan`] keyed by winner id, and each group's winner is replaced by an
//! updated copy so reports show the merged values.

use std::collections::BTreeMap;
use std::sync::Arc;

use combiner_core::{
    CustomerId, CustomerPatch, CustomerRecord, CustomerRef, Phone, SubscriptionUpdate, is_blank,
};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::grouping::{Buckets, DuplicateGroup};
use crate::path;
use crate::phone;

/// Prefix routing a merge field into the custom fields.
pub const CUSTOM_FIELD_PREFIX: &str = "customField.";

/// Separator of the collected email list.
pub const EMAIL_SEPARATOR: &str = "; ";

/// Which merge policies run, with their parameters.
#[derive(Debug, Clone, Default)]
pub struct MergePolicies {
    pub managers: bool,
    /// Trailing characters two phones must share to be merged.
    pub phones: Option<usize>,
    /// Custom field receiving every secondary email.
    pub collect_emails: Option<String>,
    pub subscriptions: bool,
    /// Field names, `customField.<code>` for custom fields.
    pub fields: Vec<String>,
}

impl MergePolicies {
    /// Phones are matched on at least one trailing character.
    pub fn validate(&self) -> Result<()> {
        if self.phones == Some(0) {
            return Err(EngineError::InvalidOption(
                "merge-phones".to_string(),
                "suffix length must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionPlan {
    pub customer: CustomerRef,
    pub subscriptions: Vec<SubscriptionUpdate>,
}

/// Pending writes for winners, accumulated across every policy and group.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergePlan {
    pub patches: BTreeMap<CustomerId, CustomerPatch>,
    pub subscriptions: BTreeMap<CustomerId, SubscriptionPlan>,
}

impl MergePlan {
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty() && self.subscriptions.is_empty()
    }

    fn patch_for(&mut self, winner: &CustomerRecord) -> &mut CustomerPatch {
        self.patches
            .entry(winner.id)
            .or_insert_with(|| CustomerPatch::new(winner.id, winner.site.clone()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MergePlanner {
    policies: MergePolicies,
}

impl MergePlanner {
    pub fn new(policies: MergePolicies) -> Self {
        Self { policies }
    }

    /// Plan every group. Groups must already be sorted.
    pub fn plan(&self, buckets: &mut Buckets) -> MergePlan {
        let mut plan = MergePlan::default();
        for groups in buckets.values_mut() {
            for group in groups.values_mut() {
                self.plan_group(group, &mut plan);
            }
        }
        plan
    }

    pub fn plan_group(&self, group: &mut DuplicateGroup, plan: &mut MergePlan) {
        if group.members.len() < 2 {
            return;
        }
        let mut winner = group.winner().clone();

        if self.policies.managers {
            merge_manager(&group.members, &mut winner, plan);
        }
        if let Some(len) = self.policies.phones {
            let phones = merge_phones(&group.members, len);
            plan.patch_for(&winner).set_phones(&phones);
            winner.phones = phones;
        }
        if let Some(field) = self.policies.collect_emails.as_deref() {
            let emails = Value::String(collect_emails(&group.members, field));
            plan.patch_for(&winner).set_custom_field(field, emails.clone());
            winner.custom_fields.insert(field.to_string(), emails);
        }
        if self.policies.subscriptions {
            let subscriptions = merge_subscriptions(&group.members);
            if !subscriptions.is_empty() {
                plan.subscriptions.insert(
                    winner.id,
                    SubscriptionPlan {
                        customer: CustomerRef {
                            id: winner.id,
                            site: winner.site.clone(),
                        },
                        subscriptions,
                    },
                );
            }
        }
        for (name, value) in merge_fields(&group.members, &self.policies.fields) {
            let patch = plan.patch_for(&winner);
            match name.strip_prefix(CUSTOM_FIELD_PREFIX) {
                Some(code) => {
                    patch.set_custom_field(code, value.clone());
                    winner.custom_fields.insert(code.to_string(), value);
                }
                None => {
                    patch.set_field(name.clone(), value.clone());
                    winner = with_field(winner, &name, value);
                }
            }
        }

        debug!(winner = winner.id, key = %group.key, "planned merge");
        group.members[0] = Arc::new(winner);
    }
}

fn merge_manager(members: &[Arc<CustomerRecord>], winner: &mut CustomerRecord, plan: &mut MergePlan) {
    let Some(manager) = members.iter().find_map(|m| m.manager_id) else {
        return;
    };
    if winner.manager_id != Some(manager) {
        plan.patch_for(winner).set_manager(manager);
        winner.manager_id = Some(manager);
    }
}

/// One phone per trailing-`len` key, keeping the most complete spelling,
/// longest first.
pub fn merge_phones(members: &[Arc<CustomerRecord>], len: usize) -> Vec<Phone> {
    let mut by_key: BTreeMap<String, (usize, &Phone)> = BTreeMap::new();
    let mut order: Vec<String> = Vec::new();

    for phone in members.iter().flat_map(|m| m.phones.iter()) {
        let dialable = phone::dialable(&phone.number);
        if dialable.is_empty() {
            continue;
        }
        let key = phone::suffix(&dialable, len).to_string();
        match by_key.get_mut(&key) {
            Some(kept) if kept.0 < dialable.len() => *kept = (dialable.len(), phone),
            Some(_) => {}
            None => {
                by_key.insert(key.clone(), (dialable.len(), phone));
                order.push(key);
            }
        }
    }

    let mut phones: Vec<Phone> = order.iter().map(|key| by_key[key].1.clone()).collect();
    phones.sort_by(|a, b| b.number.len().cmp(&a.number.len()));
    phones
}

/// Every member email and every secondary email from `field`, deduplicated,
/// without the winner's own email.
pub fn collect_emails(members: &[Arc<CustomerRecord>], field: &str) -> String {
    let mut emails: Vec<String> = Vec::new();
    let mut push = |email: &str| {
        let email = email.trim();
        if !email.is_empty() && !emails.iter().any(|known| known == email) {
            emails.push(email.to_string());
        }
    };

    for member in members {
        push(member.email_str());
        if let Some(Value::String(secondary)) = member.custom_fields.get(field) {
            secondary.split(EMAIL_SEPARATOR).for_each(&mut push);
        }
    }

    let own = members.first().map(|w| w.email_str().trim()).unwrap_or_default();
    emails.retain(|email| email != own);
    emails.join(EMAIL_SEPARATOR)
}

/// Channel flags seeded from the winner, cleared by any member unsubscribed
/// from the same channel. Channels the winner lacks are ignored.
pub fn merge_subscriptions(members: &[Arc<CustomerRecord>]) -> Vec<SubscriptionUpdate> {
    let Some(winner) = members.first() else {
        return Vec::new();
    };
    let mut active: BTreeMap<&str, bool> = winner
        .customer_subscriptions
        .iter()
        .map(|s| (s.subscription.channel.as_str(), s.subscribed))
        .collect();

    for subscription in members.iter().flat_map(|m| m.customer_subscriptions.iter()) {
        if let Some(flag) = active.get_mut(subscription.subscription.channel.as_str()) {
            *flag = *flag && subscription.subscribed;
        }
    }

    active
        .into_iter()
        .map(|(channel, active)| SubscriptionUpdate {
            channel: channel.to_string(),
            active,
        })
        .collect()
}

/// First non-blank value per field, in member order.
pub fn merge_fields(members: &[Arc<CustomerRecord>], fields: &[String]) -> Vec<(String, Value)> {
    fields
        .iter()
        .filter_map(|name| {
            let value = members.iter().find_map(|member| {
                let value = match name.strip_prefix(CUSTOM_FIELD_PREFIX) {
                    Some(code) => member.custom_fields.get(code).cloned(),
                    None => path::field(member, name),
                };
                value.filter(|v| !is_blank(v))
            })?;
            Some((name.clone(), value))
        })
        .collect()
}

/// Copy of `record` with a top-level field replaced, going through the CRM
/// representation so typed and unknown fields are handled alike.
fn with_field(record: CustomerRecord, name: &str, value: Value) -> CustomerRecord {
    let Ok(Value::Object(mut map)) = serde_json::to_value(&record) else {
        return record;
    };
    map.insert(name.to_string(), value);
    serde_json::from_value(Value::Object(map)).unwrap_or(record)
}
