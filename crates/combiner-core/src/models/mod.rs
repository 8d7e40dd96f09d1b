pub mod customer;
pub mod order;
pub mod patch;
pub mod timestamp;
pub mod value;

use std::collections::BTreeMap;

pub use customer::*;
pub use order::*;
pub use patch::*;
pub use timestamp::CreatedAt;
pub use value::{display_value, is_blank, is_blank_opt};

/// Snapshot of every customer, keyed by site code then customer id.
pub type CustomersBySite = BTreeMap<String, BTreeMap<CustomerId, CustomerRecord>>;

/// Orders keyed by site code then customer id, newest order first.
pub type OrdersBySite = BTreeMap<String, BTreeMap<CustomerId, Vec<Order>>>;
