//! One duplicate run: fetch, group, sort, plan and optionally combine.

use std::collections::BTreeMap;

use combiner_core::{CustomerRecord, Order, OrdersBySite};
use serde::Serialize;
use tracing::{debug, info};

use crate::combine::{CombineOptions, CombineOrchestrator, CombineOutcome};
use crate::criteria::{Comparator, CriterionContext, OrderHistorySort};
use crate::error::{EngineError, Result};
use crate::grouping::{Buckets, DuplicateFinder, GroupingOptions};
use crate::merge::{MergePlan, MergePlanner, MergePolicies};
use crate::repository::CustomerRepository;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub grouping: GroupingOptions,
    pub criteria: Vec<String>,
    pub context: CriterionContext,
    pub order_history: OrderHistorySort,
    pub policies: MergePolicies,
    /// Send combine requests; otherwise the run only reports.
    pub combine: bool,
    pub combine_options: CombineOptions,
}

impl RunOptions {
    pub fn new(grouping: GroupingOptions) -> Self {
        Self {
            grouping,
            criteria: Vec::new(),
            context: CriterionContext::default(),
            order_history: OrderHistorySort::default(),
            policies: MergePolicies::default(),
            combine: false,
            combine_options: CombineOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub buckets: Buckets,
    pub plan: MergePlan,
    pub outcomes: Vec<CombineOutcome>,
    pub combined: usize,
}

impl RunReport {
    pub fn bucket_counts(&self) -> BTreeMap<&str, usize> {
        self.buckets
            .iter()
            .map(|(site, groups)| (site.as_str(), groups.len()))
            .collect()
    }
}

pub async fn run<R: CustomerRepository + ?Sized>(repo: &R, options: &RunOptions) -> Result<RunReport> {
    options.grouping.validate()?;
    options.policies.validate()?;
    if options.combine && options.criteria.is_empty() {
        return Err(EngineError::EmptyCriteria);
    }

    let customers = repo.list_customers_by_site().await?;
    let mut buckets = DuplicateFinder::new(options.grouping.clone()).find(&customers);
    drop(customers);

    for (site, groups) in &buckets {
        info!(site = %site, buckets = groups.len(), "duplicate buckets");
    }

    let comparator = Comparator::new(&options.criteria, options.context.clone());
    for group in buckets.values_mut().flat_map(|groups| groups.values_mut()) {
        comparator.sort_group(group);
    }

    if !options.order_history.is_empty() {
        let orders = repo.list_orders_by_site().await?;
        for group in buckets.values_mut().flat_map(|groups| groups.values_mut()) {
            options
                .order_history
                .sort(&mut group.members, |member| orders_of(&orders, member));
        }
    }

    let plan = MergePlanner::new(options.policies.clone()).plan(&mut buckets);

    for group in buckets.values().flat_map(|groups| groups.values()) {
        debug!(
            site = %group.site,
            key = %group.key,
            winner = group.winner().id,
            members = ?group.member_ids(),
            "bucket"
        );
    }

    let mut report = RunReport {
        buckets,
        plan,
        ..Default::default()
    };

    if options.combine {
        let summary = CombineOrchestrator::new(repo, options.combine_options.clone())
            .run(&report.buckets, &report.plan)
            .await;
        report.outcomes = summary.outcomes;
        report.combined = summary.combined;
    }

    Ok(report)
}

fn orders_of<'a>(orders: &'a OrdersBySite, customer: &CustomerRecord) -> &'a [Order] {
    orders
        .get(&customer.site)
        .and_then(|by_customer| by_customer.get(&customer.id))
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use combiner_core::{CreatedAt, CustomersBySite, Phone};

    use crate::grouping::BlockingMode;
    use crate::repository::{InMemoryRepository, RecordedCall, customers_by_site, orders_by_site};

    fn with_phone(id: i64, phone: &str, orders: i64) -> CustomerRecord {
        let mut record = CustomerRecord::new(id, "shop");
        record.phones = vec![Phone::new(phone)];
        record.orders_count = orders;
        record
    }

    fn phone_run(criteria: &[&str]) -> RunOptions {
        let mut options = RunOptions::new(GroupingOptions::new(BlockingMode::Phone));
        options.criteria = criteria.iter().map(|c| c.to_string()).collect();
        options.combine_options.settle_delay = Duration::ZERO;
        options
    }

    #[tokio::test]
    async fn combine_without_criteria_is_refused() {
        let repo = InMemoryRepository::with_customers(vec![
            with_phone(1, "9000001122", 0),
            with_phone(2, "9000001122", 0),
        ]);
        let mut options = phone_run(&[]);
        options.combine = true;

        let err = run(&repo, &options).await.unwrap_err();
        assert!(matches!(err, EngineError::EmptyCriteria));
        assert!(repo.calls().is_empty());
    }

    #[tokio::test]
    async fn zero_phone_suffix_stops_the_run_before_any_write() {
        let repo = InMemoryRepository::with_customers(vec![
            with_phone(1, "+7 900 000-11-22", 0),
            with_phone(2, "9000001122", 0),
        ]);
        let mut options = phone_run(&["ordersCount"]);
        options.combine = true;
        options.policies.phones = Some(0);
        options.combine_options.null_loser_phones = true;

        let err = run(&repo, &options).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidOption(..)));
        assert!(repo.calls().is_empty());

        let mut options = phone_run(&["ordersCount"]);
        options.grouping.phone_suffix_len = 0;
        assert!(run(&repo, &options).await.is_err());
    }

    #[tokio::test]
    async fn report_only_run_makes_no_writes() {
        let repo = InMemoryRepository::with_customers(vec![
            with_phone(1, "9000001122", 3),
            with_phone(2, "+7 900 000-11-22", 5),
            with_phone(3, "9000005555", 1),
        ]);
        let options = phone_run(&["ordersCount"]);

        let report = run(&repo, &options).await.unwrap();
        let group = &report.buckets["shop"]["9000001122"];
        assert_eq!(group.member_ids(), vec![2, 1]);
        assert_eq!(report.bucket_counts()["shop"], 1);
        assert!(repo.calls().is_empty());
    }

    #[tokio::test]
    async fn full_run_combines_and_edits() {
        let repo = InMemoryRepository::with_customers(vec![
            with_phone(1, "9000001122", 3),
            with_phone(2, "+7 900 000-11-22", 5),
        ]);
        let mut options = phone_run(&["ordersCount"]);
        options.combine = true;
        options.policies.phones = Some(10);
        options.combine_options.null_loser_phones = true;

        let report = run(&repo, &options).await.unwrap();
        assert_eq!(report.combined, 1);

        let calls = repo.calls();
        assert!(matches!(&calls[0], RecordedCall::Edit(p) if p.id == 1 && p.phones() == Some(Vec::new())));
        assert_eq!(calls[1], RecordedCall::Combine { winner: 2, losers: vec![1] });
        assert!(matches!(&calls[2], RecordedCall::Edit(p) if p.id == 2
            && p.phones() == Some(vec!["+7 900 000-11-22".to_string()])));
    }

    #[tokio::test]
    async fn order_history_reorders_ties() {
        let customers: CustomersBySite = customers_by_site(vec![
            with_phone(1, "9000001122", 1),
            with_phone(2, "9000001122", 1),
        ]);
        let mut order = Order::new(10, 2);
        order.site = Some("shop".to_string());
        order.created_at = Some(CreatedAt::utc("2022-01-01 00:00:00"));
        let repo = InMemoryRepository::new(customers, orders_by_site(vec![order]));

        let mut options = phone_run(&["ordersCount"]);
        options.order_history = OrderHistorySort::parse(&["createdAt"]).unwrap();

        let report = run(&repo, &options).await.unwrap();
        assert_eq!(report.buckets["shop"]["9000001122"].member_ids(), vec![2, 1]);
    }
}
