use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use combiner_core::{AppConfig, ExitCode, RunProfile};
use combiner_engine::combine::{DEFAULT_SETTLE_DELAY, never_exclude};
use combiner_engine::criteria::DEFAULT_PHONE_EXACT_LENGTH;
use combiner_engine::phone::DEFAULT_SUFFIX_LEN;
use combiner_engine::report::{self, SiteReport};
use combiner_engine::{
    BlockingMode, CombineOptions, CriterionContext, CrmRepository, EngineError, GroupingOptions,
    MergePolicies, OrderHistorySort, RunOptions, RunReport, SiteScope, SnapshotCache,
};

const DEFAULT_LOG_FILTER: &str = "combiner_cli=info,combiner_engine=info";

// ─── CLI Definition ─────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "combiner",
    about = "Find and combine duplicate customers in a Simla (RetailCRM) account",
    version,
    long_about = None
)]
struct Cli {
    /// Blocking mode: email, phone, name, name-<N> or <prefix>.<code>.
    by: Option<String>,

    /// Comparison criteria, most important first.
    criteria: Vec<String>,

    /// TOML profile with `[arguments]` and `[options]`; command-line values win.
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Columns to show in the report, comma separated.
    #[arg(long)]
    fields: Option<String>,

    /// Look for duplicates across all sites.
    #[arg(long)]
    all_sites: bool,

    /// Only these sites, comma separated, pooled together.
    #[arg(long)]
    filter_sites: Option<String>,

    /// Refetch customers and orders instead of using the snapshot cache.
    #[arg(long)]
    no_cache: bool,

    /// Save the report as CSV, one file per site.
    #[arg(long)]
    csv: bool,

    /// Combine duplicates into the winner.
    #[arg(long)]
    combine: bool,

    /// Give the winner the first manager found in the group.
    #[arg(long)]
    merge_managers: bool,

    /// Merge phones, matching on the last N digits (`--merge-phones=N`).
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "10", value_name = "N")]
    merge_phones: Option<usize>,

    /// AND every member's subscription flags into the winner's channels.
    #[arg(long)]
    merge_subscriptions: bool,

    /// Custom field receiving every other email of the group.
    #[arg(long, value_name = "FIELD")]
    collect_emails: Option<String>,

    /// Fields to fill from other members, comma separated; `customField.<code>` for custom fields.
    #[arg(long)]
    merge_fields: Option<String>,

    /// Order-history rules: `createdAt` or `<field>=<v1>|<v2>`. Repeatable.
    #[arg(long = "consider-orders", value_name = "RULE")]
    consider_orders: Vec<String>,

    /// Digits a phone needs for the phoneExactLength criterion.
    #[arg(long)]
    phone_exact_length: Option<usize>,

    /// `source=priority` pairs for the sourcePriority criterion, comma separated.
    #[arg(long)]
    source_priority: Option<String>,

    /// Blocking key that must never be combined.
    #[arg(long)]
    exclude: Option<String>,

    #[arg(long)]
    crm_url: Option<String>,

    #[arg(long)]
    api_key: Option<String>,

    /// Seconds to wait after combining before editing winners.
    #[arg(long, value_name = "SECS")]
    settle_delay: Option<u64>,

    /// Output in JSON format.
    #[arg(long)]
    json: bool,
}

impl Cli {
    /// Fill every value the command line left unset from `profile`.
    fn apply_profile(&mut self, profile: RunProfile) {
        let RunProfile { arguments, options } = profile;

        if self.by.is_none() {
            self.by = arguments.by;
        }
        if self.criteria.is_empty() {
            self.criteria = arguments.criteria;
        }

        self.all_sites |= options.all_sites.unwrap_or(false);
        self.no_cache |= options.no_cache.unwrap_or(false);
        self.csv |= options.csv.unwrap_or(false);
        self.combine |= options.combine.unwrap_or(false);
        self.merge_managers |= options.merge_managers.unwrap_or(false);
        self.merge_subscriptions |= options.merge_subscriptions.unwrap_or(false);

        fill(&mut self.fields, options.fields);
        fill(&mut self.filter_sites, options.filter_sites);
        fill(&mut self.merge_phones, options.merge_phones);
        fill(&mut self.collect_emails, options.collect_emails);
        fill(&mut self.merge_fields, options.merge_fields);
        fill(&mut self.phone_exact_length, options.phone_exact_length);
        fill(&mut self.source_priority, options.source_priority);
        fill(&mut self.exclude, options.exclude);
        fill(&mut self.crm_url, options.crm_url);
        fill(&mut self.api_key, options.api_key);

        if self.consider_orders.is_empty() {
            self.consider_orders = options.consider_orders;
        }
    }

    fn field_list(&self) -> Vec<String> {
        self.fields.as_deref().map(report::parse_fields).unwrap_or_default()
    }

    fn run_options(&self, mode: BlockingMode) -> Result<RunOptions, EngineError> {
        let filter = self.filter_sites.as_deref().map(report::parse_fields).unwrap_or_default();
        let scope = if !filter.is_empty() {
            SiteScope::Filter(filter)
        } else if self.all_sites {
            SiteScope::AllSites
        } else {
            SiteScope::PerSite
        };

        let source_priority = match self.source_priority.as_deref() {
            Some(raw) => CriterionContext::parse_source_priority(raw)?,
            None => Default::default(),
        };

        let policies = MergePolicies {
            managers: self.merge_managers,
            phones: self.merge_phones,
            collect_emails: self.collect_emails.clone(),
            subscriptions: self.merge_subscriptions,
            fields: self.merge_fields.as_deref().map(report::parse_fields).unwrap_or_default(),
        };
        policies.validate()?;

        Ok(RunOptions {
            grouping: GroupingOptions {
                mode,
                scope,
                exclude: self.exclude.clone(),
                phone_suffix_len: DEFAULT_SUFFIX_LEN,
            },
            criteria: self.criteria.clone(),
            context: CriterionContext {
                phone_exact_length: self.phone_exact_length.unwrap_or(DEFAULT_PHONE_EXACT_LENGTH),
                source_priority,
            },
            order_history: OrderHistorySort::parse(&self.consider_orders)?,
            policies,
            combine: self.combine,
            combine_options: CombineOptions {
                null_loser_phones: self.merge_phones.is_some(),
                settle_delay: self
                    .settle_delay
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_SETTLE_DELAY),
                exclude: never_exclude,
            },
        })
    }
}

fn fill<T>(slot: &mut Option<T>, fallback: Option<T>) {
    if slot.is_none() {
        *slot = fallback;
    }
}

// ─── Main ────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let json_output = cli.json;

    if let Err(err) = execute(cli).await {
        let code = exit_code(&err);
        if json_output {
            let _ = print_json(&serde_json::json!({
                "status": "error",
                "message": format!("{err:#}"),
            }));
        } else {
            eprintln!("Error: {err:#}");
        }
        std::process::exit(code.code());
    }
}

async fn execute(mut cli: Cli) -> Result<()> {
    let start = Instant::now();

    if let Some(path) = cli.config.clone() {
        let profile = RunProfile::load_from(&path)
            .with_context(|| format!("reading profile {}", path.display()))?;
        cli.apply_profile(profile);
    }

    let by = cli
        .by
        .clone()
        .ok_or_else(|| EngineError::InvalidOption("by".to_string(), "missing blocking mode".to_string()))?;
    let mode: BlockingMode = by.parse()?;
    let options = cli.run_options(mode)?;

    let mut config = AppConfig::load().context("loading configuration")?;
    if cli.crm_url.is_some() {
        config.crm.url = cli.crm_url.clone();
    }
    if cli.api_key.is_some() {
        config.crm.api_key = cli.api_key.clone();
    }

    if cli.criteria.is_empty() {
        warn!("no criteria set for comparing customers");
    }

    let repo = CrmRepository::new(&config.crm)?
        .with_cache(SnapshotCache::new(config.cache_dir()), cli.no_cache);
    let crm_url = config.crm.url.clone().unwrap_or_default();
    info!(crm = %crm_url, by = %by, "start combining");

    let result = combiner_engine::run(&repo, &options).await?;
    let fields = cli.field_list();
    let reports = report::build(&result.buckets, &by, &fields);

    if cli.json {
        print_json(&serde_json::json!({
            "status": "ok",
            "data": {
                "by": by,
                "buckets": result.bucket_counts(),
                "report": reports,
                "plan": result.plan,
                "outcomes": result.outcomes,
                "combined": result.combined,
            },
            "meta": { "duration_ms": start.elapsed().as_millis() }
        }))?;
        return Ok(());
    }

    print_summary(&result, &by);

    if !fields.is_empty() {
        for site in &reports {
            print_table(site, &fields);
        }
    }

    if cli.csv && !fields.is_empty() {
        let written = report::write_reports(
            &reports,
            &fields,
            &config.report_dir(),
            &report::crm_name(&crm_url),
            &by,
        )?;
        for path in written {
            println!("CSV file saved to {}", path.display());
        }
    }

    if cli.combine {
        println!("Combined customers: {}", result.combined);
    }

    Ok(())
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn exit_code(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<EngineError>() {
        Some(EngineError::MissingCredentials) => ExitCode::MissingCredentials,
        Some(
            EngineError::EmptyCriteria | EngineError::InvalidBlockingMode(_) | EngineError::InvalidOption(..),
        ) => ExitCode::InvalidArgs,
        _ => ExitCode::GeneralError,
    }
}

fn print_json(val: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(val)?);
    Ok(())
}

fn print_summary(result: &RunReport, by: &str) {
    let counts = result.bucket_counts();
    if counts.is_empty() {
        println!("No duplicates by {by}.");
        return;
    }
    println!("List of duplicates by {by}");
    for (site, count) in counts {
        println!("  {site:<24} {count}");
    }
}

fn print_table(site: &SiteReport, fields: &[String]) {
    let mut widths: Vec<usize> = fields.iter().map(|f| f.chars().count()).collect();
    for row in site.sections.iter().flat_map(|s| s.rows.iter()) {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }
    let rule = widths
        .iter()
        .map(|w| "-".repeat(w + 2))
        .collect::<Vec<_>>()
        .join("+");
    let line = |cells: &[String]| {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, &width)| format!(" {cell:<width$} "))
            .collect::<Vec<_>>()
            .join("|")
    };

    println!();
    println!("{}", site.title);
    println!("+{rule}+");
    println!("|{}|", line(fields));
    println!("+{rule}+");
    for section in &site.sections {
        println!("| {}", section.title);
        for row in &section.rows {
            println!("|{}|", line(row.as_slice()));
        }
        println!("+{rule}+");
    }
}
