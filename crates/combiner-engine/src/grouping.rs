use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use combiner_core::{CustomerId, CustomerRecord, CustomersBySite, display_value};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::conflict::{MemberKey, resolve_name_clusters};
use crate::error::{EngineError, Result};
use crate::path::FieldPath;
use crate::phone;
use crate::tokenizer::tokenize;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[_a-z0-9-]+(\.[_a-z0-9-]+)*@[a-z0-9-]+(\.[a-z0-9-]+)*(\.[a-z]{2,})$")
        .expect("valid regex")
});

pub const ALL_SITES: &str = "all_sites";
pub const FILTER_SITES: &str = "filter_sites";

/// How candidate duplicates are bucketed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockingMode {
    Email,
    Phone,
    /// Exact normalized full name of at least two words.
    Name,
    /// Every combination of this many name words is a key.
    NameTokens(usize),
    /// Digits of a `prefix.code` value.
    Path(FieldPath),
}

impl FromStr for BlockingMode {
    type Err = EngineError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "email" => Ok(Self::Email),
            "phone" => Ok(Self::Phone),
            "name" => Ok(Self::Name),
            _ => {
                if let Some(size) = raw.strip_prefix("name-") {
                    return match size.parse::<usize>() {
                        Ok(size) if size >= 2 => Ok(Self::NameTokens(size)),
                        _ => Err(EngineError::InvalidBlockingMode(raw.to_string())),
                    };
                }
                FieldPath::parse(raw)
                    .map(Self::Path)
                    .ok_or_else(|| EngineError::InvalidBlockingMode(raw.to_string()))
            }
        }
    }
}

/// Which sites may share a bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SiteScope {
    /// Buckets never cross sites.
    #[default]
    PerSite,
    /// Every site is pooled into `all_sites`.
    AllSites,
    /// Only the listed sites, pooled into `filter_sites`.
    Filter(Vec<String>),
}

impl SiteScope {
    /// Pseudo-site a record of `site` is bucketed under, or `None` to skip it.
    fn bucket_site(&self, site: &str) -> Option<String> {
        match self {
            Self::PerSite => Some(site.to_string()),
            Self::AllSites => Some(ALL_SITES.to_string()),
            Self::Filter(allowed) => allowed
                .iter()
                .any(|s| s == site)
                .then(|| FILTER_SITES.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GroupingOptions {
    pub mode: BlockingMode,
    pub scope: SiteScope,
    /// Blocking key that must never form a bucket (a shared office email, a
    /// placeholder phone).
    pub exclude: Option<String>,
    pub phone_suffix_len: usize,
}

impl GroupingOptions {
    pub fn new(mode: BlockingMode) -> Self {
        Self {
            mode,
            scope: SiteScope::PerSite,
            exclude: None,
            phone_suffix_len: phone::DEFAULT_SUFFIX_LEN,
        }
    }

    /// An empty phone suffix would put every number under one key.
    pub fn validate(&self) -> Result<()> {
        if self.phone_suffix_len == 0 {
            return Err(EngineError::InvalidOption(
                "phone-suffix-length".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Records sharing one blocking key. Never smaller than two members; the
/// first member is the winner once the group is sorted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateGroup {
    pub site: String,
    pub key: String,
    pub members: Vec<Arc<CustomerRecord>>,
}

impl DuplicateGroup {
    pub fn winner(&self) -> &CustomerRecord {
        &self.members[0]
    }

    pub fn losers(&self) -> impl Iterator<Item = &CustomerRecord> {
        self.members.iter().skip(1).map(|m| &**m)
    }

    pub fn member_ids(&self) -> Vec<CustomerId> {
        self.members.iter().map(|m| m.id).collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Buckets keyed by (pseudo-)site, then blocking key.
pub type Buckets = BTreeMap<String, BTreeMap<String, DuplicateGroup>>;

type KeyedMembers = BTreeMap<MemberKey, Arc<CustomerRecord>>;

#[derive(Debug, Clone)]
pub struct DuplicateFinder {
    options: GroupingOptions,
}

impl DuplicateFinder {
    pub fn new(options: GroupingOptions) -> Self {
        Self { options }
    }

    /// Partition every customer into candidate-duplicate buckets.
    ///
    /// Buckets with a single member and sites left without buckets are
    /// dropped. Members are ordered by site, then customer id, until sorted;
    /// pooled scopes keep records of different sites that share an id.
    pub fn find(&self, customers: &CustomersBySite) -> Buckets {
        let mut raw: BTreeMap<String, BTreeMap<String, KeyedMembers>> = BTreeMap::new();
        let mut record_tokens: BTreeMap<String, Vec<Vec<String>>> = BTreeMap::new();

        for (site, records) in customers {
            let Some(bucket_site) = self.options.scope.bucket_site(site) else {
                continue;
            };
            let site_buckets = raw.entry(bucket_site.clone()).or_default();

            for (id, record) in records {
                let record = Arc::new(record.clone());
                let keys = self.keys_for(&record);
                for key in &keys {
                    site_buckets
                        .entry(key.clone())
                        .or_default()
                        .insert((site.clone(), *id), Arc::clone(&record));
                }
                if matches!(self.options.mode, BlockingMode::NameTokens(_)) && !keys.is_empty() {
                    record_tokens
                        .entry(bucket_site.clone())
                        .or_default()
                        .push(keys);
                }
            }
        }

        let mut buckets = Buckets::new();
        for (site, site_buckets) in raw {
            let groups: BTreeMap<String, Vec<Arc<CustomerRecord>>> =
                if matches!(self.options.mode, BlockingMode::NameTokens(_)) {
                    let tokens = record_tokens.remove(&site).unwrap_or_default();
                    resolve_name_clusters(site_buckets, &tokens, self.options.phone_suffix_len)
                } else {
                    site_buckets
                        .into_iter()
                        .map(|(key, members)| (key, members.into_values().collect()))
                        .collect()
                };

            let groups: BTreeMap<String, DuplicateGroup> = groups
                .into_iter()
                .filter(|(_, members)| members.len() > 1)
                .map(|(key, members)| {
                    let group = DuplicateGroup {
                        site: site.clone(),
                        key: key.clone(),
                        members,
                    };
                    (key, group)
                })
                .collect();

            if !groups.is_empty() {
                buckets.insert(site, groups);
            }
        }

        buckets
    }

    /// Blocking keys of one record under the configured mode, minus the
    /// excluded key.
    pub fn keys_for(&self, record: &CustomerRecord) -> Vec<String> {
        let mut keys: Vec<String> = match &self.options.mode {
            BlockingMode::Email => record
                .email
                .as_deref()
                .filter(|email| EMAIL_RE.is_match(email))
                .map(|email| vec![email.to_string()])
                .unwrap_or_default(),
            BlockingMode::Phone => record
                .phones
                .iter()
                .filter_map(|p| phone::normalize(p, self.options.phone_suffix_len))
                .collect(),
            BlockingMode::Name => {
                let name = record.full_name();
                if name.split(' ').count() < 2 {
                    Vec::new()
                } else {
                    vec![name]
                }
            }
            BlockingMode::NameTokens(size) => tokenize(&record.full_name(), *size),
            BlockingMode::Path(path) => path
                .resolve(record)
                .map(|value| phone::digits(&display_value(&value)))
                .filter(|digits| !digits.is_empty())
                .map(|digits| vec![digits])
                .unwrap_or_default(),
        };

        if let Some(exclude) = self.options.exclude.as_deref() {
            keys.retain(|key| key != exclude);
        }
        keys.dedup();
        keys
    }
}

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

#[cfg(test)]
mod tests {
    use super::*;

    use combiner_core::Phone;
    use serde_json::json;

    fn customer(id: CustomerId, site: &str) -> CustomerRecord {
        CustomerRecord::new(id, site)
    }

    fn snapshot(records: Vec<CustomerRecord>) -> CustomersBySite {
        let mut by_site = CustomersBySite::new();
        for record in records {
            by_site
                .entry(record.site.clone())
                .or_default()
                .insert(record.id, record);
        }
        by_site
    }

    fn with_email(id: CustomerId, site: &str, email: &str) -> CustomerRecord {
        let mut record = customer(id, site);
        record.email = Some(email.to_string());
        record
    }

    #[test]
    fn blocking_mode_parsing() {
        assert_eq!("email".parse::<BlockingMode>().unwrap(), BlockingMode::Email);
        assert_eq!("name-3".parse::<BlockingMode>().unwrap(), BlockingMode::NameTokens(3));
        assert!(matches!(
            "customFields.inn".parse::<BlockingMode>().unwrap(),
            BlockingMode::Path(_)
        ));
        assert!("name-x".parse::<BlockingMode>().is_err());
        assert!("name-1".parse::<BlockingMode>().is_err());
        assert!("birthday".parse::<BlockingMode>().is_err());
    }

    #[test]
    fn email_mode_skips_invalid_and_singletons() {
        let customers = snapshot(vec![
            with_email(1, "shop", "anna@example.com"),
            with_email(2, "shop", "anna@example.com"),
            with_email(3, "shop", "not-an-email"),
            with_email(4, "shop", "not-an-email"),
            with_email(5, "shop", "solo@example.com"),
            customer(6, "shop"),
        ]);

        let finder = DuplicateFinder::new(GroupingOptions::new(BlockingMode::Email));
        let buckets = finder.find(&customers);

        assert_eq!(buckets.len(), 1);
        let groups = &buckets["shop"];
        assert_eq!(groups.len(), 1);
        assert_eq!(groups["anna@example.com"].member_ids(), vec![1, 2]);
    }

    #[test]
    fn buckets_stay_within_site_by_default() {
        let customers = snapshot(vec![
            with_email(1, "a", "anna@example.com"),
            with_email(2, "b", "anna@example.com"),
        ]);

        let finder = DuplicateFinder::new(GroupingOptions::new(BlockingMode::Email));
        assert!(finder.find(&customers).is_empty());

        let mut options = GroupingOptions::new(BlockingMode::Email);
        options.scope = SiteScope::AllSites;
        let buckets = DuplicateFinder::new(options).find(&customers);
        assert_eq!(buckets[ALL_SITES]["anna@example.com"].member_ids(), vec![1, 2]);
    }

    #[test]
    fn filter_sites_restricts_and_pools() {
        let customers = snapshot(vec![
            with_email(1, "a", "anna@example.com"),
            with_email(2, "b", "anna@example.com"),
            with_email(3, "c", "anna@example.com"),
        ]);

        let mut options = GroupingOptions::new(BlockingMode::Email);
        options.scope = SiteScope::Filter(vec!["a".to_string(), "c".to_string()]);
        let buckets = DuplicateFinder::new(options).find(&customers);

        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[FILTER_SITES]["anna@example.com"].member_ids(), vec![1, 3]);
    }

    #[test]
    fn phone_mode_buckets_every_number() {
        let mut a = customer(1, "shop");
        a.phones = vec![Phone::new("+7 900 000-11-22"), Phone::new("+7 900 000-33-44")];
        let mut b = customer(2, "shop");
        b.phones = vec![Phone::new("89000001122")];
        let mut c = customer(3, "shop");
        c.phones = vec![Phone::new("9000003344")];

        let finder = DuplicateFinder::new(GroupingOptions::new(BlockingMode::Phone));
        let buckets = finder.find(&snapshot(vec![a, b, c]));

        let groups = &buckets["shop"];
        assert_eq!(groups["9000001122"].member_ids(), vec![1, 2]);
        assert_eq!(groups["9000003344"].member_ids(), vec![1, 3]);
    }

    #[test]
    fn excluded_key_never_forms_a_bucket() {
        let mut a = customer(1, "shop");
        a.phones = vec![Phone::new("0000000000")];
        let mut b = customer(2, "shop");
        b.phones = vec![Phone::new("0000000000")];

        let mut options = GroupingOptions::new(BlockingMode::Phone);
        options.exclude = Some("0000000000".to_string());
        assert!(DuplicateFinder::new(options).find(&snapshot(vec![a, b])).is_empty());
    }

    #[test]
    fn path_mode_uses_digits() {
        let mut a = customer(1, "shop");
        a.custom_fields.insert("inn".to_string(), json!("77-01-123"));
        let mut b = customer(2, "shop");
        b.custom_fields.insert("inn".to_string(), json!(7701123));
        let mut c = customer(3, "shop");
        c.custom_fields.insert("inn".to_string(), json!("n/a"));
        let d = customer(4, "shop");

        let mode: BlockingMode = "customFields.inn".parse().unwrap();
        let buckets = DuplicateFinder::new(GroupingOptions::new(mode)).find(&snapshot(vec![a, b, c, d]));
        assert_eq!(buckets["shop"].len(), 1);
        assert_eq!(buckets["shop"]["7701123"].member_ids(), vec![1, 2]);
    }

    #[test]
    fn name_token_mode_resolves_clusters() {
        let mut a = customer(1, "shop");
        a.first_name = Some("Anna".to_string());
        a.last_name = Some("Ivanova".to_string());
        let mut b = customer(2, "shop");
        b.first_name = Some("Ivanova".to_string());
        b.last_name = Some("Anna".to_string());
        let mut c = customer(3, "shop");
        c.first_name = Some("Petr".to_string());

        let finder = DuplicateFinder::new(GroupingOptions::new(BlockingMode::NameTokens(2)));
        let buckets = finder.find(&snapshot(vec![a, b, c]));

        assert_eq!(buckets["shop"].len(), 1);
        assert_eq!(buckets["shop"]["anna ivanova"].member_ids(), vec![1, 2]);
    }

    #[test]
    fn exact_name_mode_needs_two_words() {
        let mut a = customer(1, "shop");
        a.first_name = Some("Anna".to_string());
        let mut b = customer(2, "shop");
        b.first_name = Some("anna".to_string());

        let finder = DuplicateFinder::new(GroupingOptions::new(BlockingMode::Name));
        assert!(finder.find(&snapshot(vec![a, b])).is_empty());
    }

    #[test]
    fn exact_name_mode_groups_normalized_names() {
        let named = |id, first: &str, last: &str| {
            let mut record = customer(id, "shop");
            record.first_name = Some(first.to_string());
            record.last_name = Some(last.to_string());
            record
        };
        let customers = snapshot(vec![
            named(1, "Anna", "IVANOVA"),
            named(2, " anna ", "Ivanova"),
            named(3, "Anna", "Petrova"),
        ]);

        let buckets = DuplicateFinder::new(GroupingOptions::new(BlockingMode::Name)).find(&customers);
        assert_eq!(buckets["shop"].len(), 1);
        assert_eq!(buckets["shop"]["anna ivanova"].member_ids(), vec![1, 2]);
    }

    #[test]
    fn phone_suffix_length_is_configurable() {
        let mut a = customer(1, "shop");
        a.phones = vec![Phone::new("+7 900 000-11-22")];
        let mut b = customer(2, "shop");
        b.phones = vec![Phone::new("+1 300 000-11-22")];
        let customers = snapshot(vec![a, b]);

        let finder = DuplicateFinder::new(GroupingOptions::new(BlockingMode::Phone));
        assert!(finder.find(&customers).is_empty());

        let mut options = GroupingOptions::new(BlockingMode::Phone);
        options.phone_suffix_len = 7;
        let buckets = DuplicateFinder::new(options).find(&customers);
        assert_eq!(buckets["shop"]["0001122"].member_ids(), vec![1, 2]);
    }

    #[test]
    fn zero_phone_suffix_is_invalid() {
        let mut options = GroupingOptions::new(BlockingMode::Phone);
        assert!(options.validate().is_ok());
        options.phone_suffix_len = 0;
        assert!(matches!(options.validate(), Err(EngineError::InvalidOption(..))));
    }

    #[test]
    fn pooled_sites_keep_records_sharing_an_id() {
        let customers = snapshot(vec![
            with_email(1, "a", "anna@example.com"),
            with_email(1, "b", "anna@example.com"),
        ]);

        let mut options = GroupingOptions::new(BlockingMode::Email);
        options.scope = SiteScope::AllSites;
        let buckets = DuplicateFinder::new(options).find(&customers);

        let group = &buckets[ALL_SITES]["anna@example.com"];
        let sites: Vec<_> = group.members.iter().map(|m| m.site.as_str()).collect();
        assert_eq!(sites, vec!["a", "b"]);
    }

    #[test]
    fn email_pattern() {
        assert!(is_valid_email("Anna.Ivanova@Mail.Example.COM"));
        assert!(!is_valid_email("anna@localhost"));
        assert!(!is_valid_email("anna ivanova@example.com"));
    }
}
