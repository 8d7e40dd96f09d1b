//! Priority comparator: orders the members of a duplicate group so that the
//! record to keep comes first.
//!
//! Criteria are compiled once from their codes. Each criterion returns
//! `Ordering::Less` when the left record should be kept over the right one;
//! the first criterion that does not return `Equal` decides.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use combiner_core::{CreatedAt, CustomerId, CustomerRecord, Order, display_value, is_blank, is_blank_opt};
use once_cell::sync::Lazy;

use crate::error::{EngineError, Result};
use crate::grouping::DuplicateGroup;
use crate::path::{self, FieldPath};
use crate::phone;

/// Digits a phone needs to count for `phoneExactLength`.
pub const DEFAULT_PHONE_EXACT_LENGTH: usize = 12;

/// Priority of a source that is missing or not listed.
pub const DEFAULT_SOURCE_PRIORITY: i64 = 1;

pub type CriterionFn = fn(&CustomerRecord, &CustomerRecord, &CriterionContext) -> Ordering;

/// Parameters some criteria read.
#[derive(Debug, Clone)]
pub struct CriterionContext {
    pub phone_exact_length: usize,
    pub source_priority: HashMap<String, i64>,
}

impl Default for CriterionContext {
    fn default() -> Self {
        Self {
            phone_exact_length: DEFAULT_PHONE_EXACT_LENGTH,
            source_priority: HashMap::new(),
        }
    }
}

impl CriterionContext {
    /// Parse `source=priority` pairs separated by commas.
    ///
    /// Pairs missing either side are skipped; a priority that is not an
    /// integer is an error.
    pub fn parse_source_priority(raw: &str) -> Result<HashMap<String, i64>> {
        let mut priorities = HashMap::new();
        for pair in raw.split(',') {
            let Some((source, priority)) = pair.split_once('=') else {
                continue;
            };
            let (source, priority) = (source.trim(), priority.trim());
            if source.is_empty() || priority.is_empty() {
                continue;
            }
            let priority = priority.parse::<i64>().map_err(|_| {
                EngineError::InvalidOption("sourcePriority".to_string(), pair.to_string())
            })?;
            priorities.insert(source.to_string(), priority);
        }
        Ok(priorities)
    }

    fn source_priority_of(&self, record: &CustomerRecord) -> i64 {
        record
            .source_code()
            .and_then(|code| self.source_priority.get(code).copied())
            .unwrap_or(DEFAULT_SOURCE_PRIORITY)
    }
}

static REGISTRY: Lazy<HashMap<&'static str, CriterionFn>> = Lazy::new(|| {
    let mut registry: HashMap<&'static str, CriterionFn> = HashMap::new();
    registry.insert("externalId", by_external_id);
    registry.insert("ordersCount", by_orders_count);
    registry.insert("totalSumm", by_total_summ);
    registry.insert("customFieldsCount", by_custom_fields_count);
    registry.insert("email", by_email);
    registry.insert("phone", by_phone);
    registry.insert("phoneExactLength", by_phone_exact_length);
    registry.insert("sourcePriority", by_source_priority);
    registry.insert("createdAt", by_created_at);
    registry.insert("moreData", by_more_data);
    registry.insert("hasChat", by_chat);
    registry
});

#[derive(Debug, Clone)]
enum Criterion {
    Site(String),
    Path(FieldPath),
    Named(CriterionFn),
    Field(String),
}

impl Criterion {
    fn compile(code: &str) -> Self {
        if let Some(site) = code.strip_prefix("site-") {
            return Self::Site(site.to_string());
        }
        if let Some(compare) = REGISTRY.get(code) {
            return Self::Named(*compare);
        }
        if let Some(path) = FieldPath::parse(code) {
            return Self::Path(path);
        }
        Self::Field(code.to_string())
    }

    fn compare(&self, left: &CustomerRecord, right: &CustomerRecord, ctx: &CriterionContext) -> Ordering {
        match self {
            Self::Site(site) => present_first(left.site == *site, right.site == *site),
            Self::Path(path) => present_first(!path.is_blank_on(left), !path.is_blank_on(right)),
            Self::Named(compare) => compare(left, right, ctx),
            Self::Field(name) => present_first(
                !is_blank_opt(path::field(left, name).as_ref()),
                !is_blank_opt(path::field(right, name).as_ref()),
            ),
        }
    }
}

/// Ordered criteria plus the parameters they need.
#[derive(Debug, Clone)]
pub struct Comparator {
    criteria: Vec<Criterion>,
    context: CriterionContext,
}

impl Comparator {
    pub fn new<S: AsRef<str>>(codes: &[S], context: CriterionContext) -> Self {
        Self {
            criteria: codes.iter().map(|code| Criterion::compile(code.as_ref())).collect(),
            context,
        }
    }

    pub fn compare(&self, left: &CustomerRecord, right: &CustomerRecord) -> Ordering {
        self.criteria
            .iter()
            .map(|criterion| criterion.compare(left, right, &self.context))
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
    }

    /// Stable sort; members the criteria cannot tell apart keep their order.
    pub fn sort(&self, members: &mut [Arc<CustomerRecord>]) {
        members.sort_by(|left, right| self.compare(left, right));
    }

    pub fn sort_group(&self, group: &mut DuplicateGroup) {
        self.sort(&mut group.members);
    }
}

fn present_first(left: bool, right: bool) -> Ordering {
    right.cmp(&left)
}

fn higher_first<T: PartialOrd>(left: T, right: T) -> Ordering {
    right.partial_cmp(&left).unwrap_or(Ordering::Equal)
}

fn by_external_id(left: &CustomerRecord, right: &CustomerRecord, _: &CriterionContext) -> Ordering {
    let filled = |r: &CustomerRecord| r.external_id.as_deref().is_some_and(|id| !id.is_empty() && id != "0");
    present_first(filled(left), filled(right))
}

fn by_orders_count(left: &CustomerRecord, right: &CustomerRecord, _: &CriterionContext) -> Ordering {
    higher_first(left.orders_count, right.orders_count)
}

fn by_total_summ(left: &CustomerRecord, right: &CustomerRecord, _: &CriterionContext) -> Ordering {
    higher_first(left.total_summ, right.total_summ)
}

fn by_custom_fields_count(left: &CustomerRecord, right: &CustomerRecord, _: &CriterionContext) -> Ordering {
    higher_first(left.custom_fields.len(), right.custom_fields.len())
}

fn by_email(left: &CustomerRecord, right: &CustomerRecord, _: &CriterionContext) -> Ordering {
    present_first(!left.email_str().is_empty(), !right.email_str().is_empty())
}

fn by_phone(left: &CustomerRecord, right: &CustomerRecord, _: &CriterionContext) -> Ordering {
    present_first(!left.phones.is_empty(), !right.phones.is_empty())
}

/// Last phone of the record that keeps at least `len` digits.
fn exact_phone(record: &CustomerRecord, len: usize) -> Option<String> {
    record
        .phones
        .iter()
        .map(|p| phone::digits(&p.number))
        .filter(|digits| digits.len() >= len)
        .last()
}

fn by_phone_exact_length(left: &CustomerRecord, right: &CustomerRecord, ctx: &CriterionContext) -> Ordering {
    let len = ctx.phone_exact_length;
    match (exact_phone(left, len), exact_phone(right, len)) {
        (Some(l), Some(r)) => higher_first(l.len(), r.len()),
        (l, r) => present_first(l.is_some(), r.is_some()),
    }
}

fn by_source_priority(left: &CustomerRecord, right: &CustomerRecord, ctx: &CriterionContext) -> Ordering {
    higher_first(ctx.source_priority_of(left), ctx.source_priority_of(right))
}

/// Present timestamps win over missing ones, then the earlier instant wins.
/// Timestamps that cannot be placed in time do not decide.
fn compare_created(left: Option<&CreatedAt>, right: Option<&CreatedAt>) -> Ordering {
    let filled = |ts: Option<&CreatedAt>| ts.is_some_and(|ts| !ts.date.is_empty());
    let (l_filled, r_filled) = (filled(left), filled(right));
    if l_filled != r_filled {
        return present_first(l_filled, r_filled);
    }
    match (left.map(CreatedAt::instant), right.map(CreatedAt::instant)) {
        (Some(Ok(l)), Some(Ok(r))) => l.cmp(&r),
        _ => Ordering::Equal,
    }
}

fn by_created_at(left: &CustomerRecord, right: &CustomerRecord, _: &CriterionContext) -> Ordering {
    compare_created(left.created_at.as_ref(), right.created_at.as_ref())
}

const FILLED_FIELDS: [&str; 5] = ["firstName", "lastName", "email", "phones", "birthday"];

fn filled_fields(record: &CustomerRecord) -> usize {
    let named = FILLED_FIELDS
        .iter()
        .filter(|name| !is_blank_opt(path::field(record, name).as_ref()))
        .count();
    named + record.address.values().filter(|v| !is_blank(v)).count()
}

fn by_more_data(left: &CustomerRecord, right: &CustomerRecord, _: &CriterionContext) -> Ordering {
    higher_first(filled_fields(left), filled_fields(right))
}

fn by_chat(left: &CustomerRecord, right: &CustomerRecord, _: &CriterionContext) -> Ordering {
    let (l_linked, r_linked) = (!left.mg_customers.is_empty(), !right.mg_customers.is_empty());
    if l_linked != r_linked {
        return present_first(l_linked, r_linked);
    }
    present_first(left.has_active_channel(), right.has_active_channel())
}

/// A rule of the order-history sort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderCriterion {
    /// Compare the creation time of each customer's latest order.
    CreatedAt,
    /// Rank customers by the best-placed value of an order attribute.
    Values { attribute: String, values: Vec<String> },
}

impl OrderCriterion {
    /// `createdAt` or `<attribute>=<v1>|<v2>|...`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw == "createdAt" {
            return Ok(Self::CreatedAt);
        }
        let invalid = || EngineError::InvalidOption("consider-orders".to_string(), raw.to_string());
        let (attribute, values) = raw.split_once('=').ok_or_else(invalid)?;
        let values: Vec<String> = values
            .split('|')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect();
        if attribute.trim().is_empty() || values.is_empty() {
            return Err(invalid());
        }
        Ok(Self::Values {
            attribute: attribute.trim().to_string(),
            values,
        })
    }

    fn compare(&self, left: &[Order], right: &[Order]) -> Ordering {
        match self {
            Self::CreatedAt => compare_created(
                left.first().and_then(|o| o.created_at.as_ref()),
                right.first().and_then(|o| o.created_at.as_ref()),
            ),
            Self::Values { attribute, values } => {
                match (best_rank(left, attribute, values), best_rank(right, attribute, values)) {
                    (Some(l), Some(r)) => l.cmp(&r),
                    (l, r) => present_first(l.is_some(), r.is_some()),
                }
            }
        }
    }
}

/// Lowest index in `values` matched by any of the orders.
fn best_rank(orders: &[Order], attribute: &str, values: &[String]) -> Option<usize> {
    orders
        .iter()
        .filter_map(|order| order.attribute(attribute))
        .filter_map(|value| {
            let value = display_value(&value);
            values.iter().position(|wanted| *wanted == value)
        })
        .min()
}

/// Second sort pass driven by each customer's orders.
#[derive(Debug, Clone, Default)]
pub struct OrderHistorySort {
    criteria: Vec<OrderCriterion>,
}

impl OrderHistorySort {
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let criteria = entries
            .iter()
            .map(|entry| OrderCriterion::parse(entry.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { criteria })
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    /// Stable sort of `members` by order history; `orders_of` returns a
    /// customer's orders newest first.
    pub fn sort<'a, F>(&self, members: &mut [Arc<CustomerRecord>], orders_of: F)
    where
        F: Fn(&CustomerRecord) -> &'a [Order],
    {
        if self.criteria.is_empty() {
            return;
        }
        let histories: HashMap<CustomerId, &'a [Order]> =
            members.iter().map(|m| (m.id, orders_of(m.as_ref()))).collect();
        members.sort_by(|left, right| {
            let (l, r) = (histories[&left.id], histories[&right.id]);
            self.criteria
                .iter()
                .map(|criterion| criterion.compare(l, r))
                .find(|ordering| ordering.is_ne())
                .unwrap_or(Ordering::Equal)
        });
    }
}
