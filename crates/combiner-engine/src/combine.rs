//! Combine orchestrator: turns sorted groups and a merge plan into CRM writes.
//!
//! Every group goes through `Planned -> PhonesNulled -> CombineRequested ->
//! Combined | Failed`. A failing group is logged and left behind; the run
//! always reaches the remaining groups. Once every combine request is out and
//! at least one succeeded, the orchestrator waits a settle delay and writes
//! the planned patches and subscriptions for the winners that were combined.

use std::collections::HashSet;
use std::time::Duration;

use combiner_core::{CustomerId, CustomerPatch, CustomerRecord};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, Result};
use crate::grouping::{Buckets, DuplicateGroup};
use crate::merge::MergePlan;
use crate::repository::CustomerRepository;

/// Wait after combining before writing to the winners.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(5);

/// Decides whether a loser must stay out of the combine.
pub type ExcludePredicate = fn(&CustomerRecord) -> bool;

/// Keeps every loser in.
pub fn never_exclude(_: &CustomerRecord) -> bool {
    false
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineState {
    Planned,
    PhonesNulled,
    CombineRequested,
    Combined,
    Failed,
    /// Nothing to combine once excluded losers were removed.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombineOutcome {
    pub site: String,
    pub key: String,
    pub winner: CustomerId,
    pub losers: Vec<CustomerId>,
    pub state: CombineState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CombineOutcome {
    fn fail(&mut self, err: &EngineError) {
        error!(
            winner = self.winner,
            losers = ?self.losers,
            status = err.status(),
            "combine failed: {err}"
        );
        self.state = CombineState::Failed;
        self.error = Some(err.to_string());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CombineSummary {
    pub outcomes: Vec<CombineOutcome>,
    /// Losers folded into a winner.
    pub combined: usize,
}

#[derive(Debug, Clone)]
pub struct CombineOptions {
    /// Clear loser phones before combining so the winner's merged list is not duplicated.
    pub null_loser_phones: bool,
    pub settle_delay: Duration,
    pub exclude: ExcludePredicate,
}

impl Default for CombineOptions {
    fn default() -> Self {
        Self {
            null_loser_phones: false,
            settle_delay: DEFAULT_SETTLE_DELAY,
            exclude: never_exclude,
        }
    }
}

pub struct CombineOrchestrator<'a, R: CustomerRepository + ?Sized> {
    repo: &'a R,
    options: CombineOptions,
}

impl<'a, R: CustomerRepository + ?Sized> CombineOrchestrator<'a, R> {
    pub fn new(repo: &'a R, options: CombineOptions) -> Self {
        Self { repo, options }
    }

    pub async fn run(&self, buckets: &Buckets, plan: &MergePlan) -> CombineSummary {
        let mut summary = CombineSummary::default();

        for group in buckets.values().flat_map(|groups| groups.values()) {
            let outcome = self.combine_group(group).await;
            if outcome.state == CombineState::Combined {
                summary.combined += outcome.losers.len();
            }
            summary.outcomes.push(outcome);
        }

        if summary.combined == 0 {
            return summary;
        }

        info!(combined = summary.combined, "combined customers");
        debug!(delay = ?self.options.settle_delay, "waiting for the CRM to settle");
        sleep(self.options.settle_delay).await;

        let mut written: HashSet<CustomerId> = HashSet::new();
        for outcome in &summary.outcomes {
            if outcome.state != CombineState::Combined || !written.insert(outcome.winner) {
                continue;
            }
            self.write_plan(outcome.winner, plan).await;
        }

        summary
    }

    async fn combine_group(&self, group: &DuplicateGroup) -> CombineOutcome {
        let winner = group.winner();
        let losers: Vec<&CustomerRecord> = group.losers().filter(|l| !(self.options.exclude)(l)).collect();

        let mut outcome = CombineOutcome {
            site: group.site.clone(),
            key: group.key.clone(),
            winner: winner.id,
            losers: losers.iter().map(|l| l.id).collect(),
            state: CombineState::Planned,
            error: None,
        };

        if losers.is_empty() {
            outcome.state = CombineState::Skipped;
            return outcome;
        }

        if self.options.null_loser_phones {
            if let Err(err) = self.null_phones(&losers).await {
                outcome.fail(&err);
                return outcome;
            }
            outcome.state = CombineState::PhonesNulled;
        }

        info!(winner = winner.id, losers = ?outcome.losers, key = %group.key, "combining");
        outcome.state = CombineState::CombineRequested;
        match self.repo.combine(winner.id, &outcome.losers).await {
            Ok(true) => outcome.state = CombineState::Combined,
            Ok(false) => outcome.fail(&EngineError::Api {
                status: 200,
                message: "CRM rejected the combine request".to_string(),
            }),
            Err(err) => outcome.fail(&err),
        }
        outcome
    }

    async fn null_phones(&self, losers: &[&CustomerRecord]) -> Result<()> {
        for loser in losers.iter().filter(|l| !l.phones.is_empty()) {
            let mut patch = CustomerPatch::new(loser.id, loser.site.clone());
            patch.set_phones(&[]);
            debug!(customer = loser.id, "clearing phones");
            self.repo.edit_customer(&patch).await?;
        }
        Ok(())
    }

    async fn write_plan(&self, winner: CustomerId, plan: &MergePlan) {
        if let Some(patch) = plan.patches.get(&winner).filter(|p| !p.is_empty()) {
            match self.repo.edit_customer(patch).await {
                Ok(()) => info!(customer = winner, "customer edited"),
                Err(err) => warn!(customer = winner, status = err.status(), "edit failed: {err}"),
            }
        }
        if let Some(subscriptions) = plan.subscriptions.get(&winner) {
            match self
                .repo
                .set_subscriptions(&subscriptions.customer, &subscriptions.subscriptions)
                .await
            {
                Ok(()) => info!(customer = winner, "subscriptions updated"),
                Err(err) => warn!(customer = winner, status = err.status(), "subscription update failed: {err}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use combiner_core::{CustomerRef, Phone, SubscriptionUpdate};
    use serde_json::json;

    use crate::merge::SubscriptionPlan;
    use crate::repository::{InMemoryRepository, RecordedCall};

    fn group(key: &str, members: Vec<CustomerRecord>) -> DuplicateGroup {
        DuplicateGroup {
            site: "shop".to_string(),
            key: key.to_string(),
            members: members.into_iter().map(Arc::new).collect(),
        }
    }

    fn buckets(groups: Vec<DuplicateGroup>) -> Buckets {
        let mut buckets = Buckets::new();
        for group in groups {
            buckets
                .entry(group.site.clone())
                .or_default()
                .insert(group.key.clone(), group);
        }
        buckets
    }

    fn options() -> CombineOptions {
        CombineOptions {
            settle_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    fn customer(id: CustomerId) -> CustomerRecord {
        CustomerRecord::new(id, "shop")
    }

    fn plan_for(winner: CustomerId) -> MergePlan {
        let mut plan = MergePlan::default();
        let mut patch = CustomerPatch::new(winner, "shop");
        patch.set_custom_field("emails", json!("x@example.com"));
        plan.patches.insert(winner, patch);
        plan
    }

    #[tokio::test]
    async fn combines_then_writes_plan() {
        let repo = InMemoryRepository::default();
        let buckets = buckets(vec![group("a", vec![customer(1), customer(2), customer(3)])]);

        let summary = CombineOrchestrator::new(&repo, options())
            .run(&buckets, &plan_for(1))
            .await;

        assert_eq!(summary.combined, 2);
        assert_eq!(summary.outcomes[0].state, CombineState::Combined);
        let calls = repo.calls();
        assert_eq!(calls[0], RecordedCall::Combine { winner: 1, losers: vec![2, 3] });
        assert!(matches!(&calls[1], RecordedCall::Edit(patch) if patch.id == 1));
        assert_eq!(calls.len(), 2);
    }

    #[tokio::test]
    async fn failed_combine_does_not_stop_the_run() {
        let repo = InMemoryRepository::default().fail_combine_into(1).refuse_combine_into(5);
        let buckets = buckets(vec![
            group("a", vec![customer(1), customer(2)]),
            group("b", vec![customer(3), customer(4)]),
            group("c", vec![customer(5), customer(6)]),
        ]);

        let mut plan = plan_for(1);
        plan.patches.extend(plan_for(3).patches);
        let summary = CombineOrchestrator::new(&repo, options()).run(&buckets, &plan).await;

        let states: Vec<_> = summary.outcomes.iter().map(|o| o.state).collect();
        assert_eq!(
            states,
            vec![CombineState::Failed, CombineState::Combined, CombineState::Failed]
        );
        assert_eq!(summary.combined, 1);
        assert!(summary.outcomes[0].error.as_deref().unwrap().contains("cannot be combined"));

        let edits: Vec<_> = repo
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                RecordedCall::Edit(patch) => Some(patch.id),
                _ => None,
            })
            .collect();
        assert_eq!(edits, vec![3]);
    }

    #[tokio::test]
    async fn nothing_is_written_when_nothing_combined() {
        let repo = InMemoryRepository::default().refuse_combine_into(1);
        let buckets = buckets(vec![group("a", vec![customer(1), customer(2)])]);

        let summary = CombineOrchestrator::new(&repo, options())
            .run(&buckets, &plan_for(1))
            .await;

        assert_eq!(summary.combined, 0);
        assert_eq!(repo.calls().len(), 1);
    }

    #[tokio::test]
    async fn loser_phones_are_cleared_first() {
        let repo = InMemoryRepository::default();
        let mut loser = customer(2);
        loser.phones = vec![Phone::new("+79000001122")];
        let buckets = buckets(vec![group("a", vec![customer(1), loser, customer(3)])]);

        let options = CombineOptions {
            null_loser_phones: true,
            ..options()
        };
        CombineOrchestrator::new(&repo, options)
            .run(&buckets, &MergePlan::default())
            .await;

        let calls = repo.calls();
        match &calls[0] {
            RecordedCall::Edit(patch) => {
                assert_eq!(patch.id, 2);
                assert_eq!(patch.phones(), Some(Vec::new()));
            }
            other => panic!("unexpected call {other:?}"),
        }
        assert_eq!(calls[1], RecordedCall::Combine { winner: 1, losers: vec![2, 3] });
        assert_eq!(calls.len(), 2);
    }

    #[tokio::test]
    async fn excluded_losers_stay_out() {
        fn has_external_id(record: &CustomerRecord) -> bool {
            record.external_id.is_some()
        }

        let repo = InMemoryRepository::default();
        let mut kept = customer(2);
        kept.external_id = Some("ext-2".to_string());
        let buckets = buckets(vec![
            group("a", vec![customer(1), kept.clone(), customer(3)]),
            group("b", vec![customer(4), kept]),
        ]);

        let options = CombineOptions {
            exclude: has_external_id,
            ..options()
        };
        let summary = CombineOrchestrator::new(&repo, options)
            .run(&buckets, &MergePlan::default())
            .await;

        assert_eq!(summary.outcomes[0].losers, vec![3]);
        assert_eq!(summary.outcomes[1].state, CombineState::Skipped);
        assert_eq!(repo.calls().len(), 1);
    }

    #[tokio::test]
    async fn subscriptions_follow_the_edit() {
        let repo = InMemoryRepository::default();
        let buckets = buckets(vec![group("a", vec![customer(1), customer(2)])]);
        let mut plan = MergePlan::default();
        plan.subscriptions.insert(
            1,
            SubscriptionPlan {
                customer: CustomerRef { id: 1, site: "shop".to_string() },
                subscriptions: vec![SubscriptionUpdate { channel: "sms".to_string(), active: false }],
            },
        );

        CombineOrchestrator::new(&repo, options()).run(&buckets, &plan).await;

        let calls = repo.calls();
        assert!(matches!(&calls[1], RecordedCall::Subscriptions { customer, .. } if customer.id == 1));
    }
}
