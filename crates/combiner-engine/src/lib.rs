//! crm-combiner engine: duplicate grouping, winner selection, merge planning
//! and combining through the CRM API.

pub mod error;
pub mod http;
pub mod cache;
pub mod path;
pub mod phone;
pub mod tokenizer;
pub mod conflict;
pub mod grouping;
pub mod criteria;
pub mod merge;
pub mod repository;
pub mod crm;
pub mod combine;
pub mod report;
pub mod pipeline;

pub use error::{EngineError, Result};
pub use cache::SnapshotCache;
pub use combine::{CombineOptions, CombineOutcome, CombineState};
pub use criteria::{Comparator, CriterionContext, OrderHistorySort};
pub use crm::CrmRepository;
pub use grouping::{BlockingMode, Buckets, DuplicateFinder, DuplicateGroup, GroupingOptions, SiteScope};
pub use merge::{MergePlan, MergePlanner, MergePolicies};
pub use pipeline::{RunOptions, RunReport, run};
pub use repository::{CustomerRepository, InMemoryRepository};
