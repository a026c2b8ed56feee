use chrono::NaiveDate;
use clap::Args;
use serde_json::json;

use crate::error::MetricsError;
use crate::metrics::{Metric, MetricQuery};
use crate::runtime::MetricsRuntime;

#[derive(Args, Debug, Default)]
pub struct ListArgs {
    #[arg(long)]
    pub name: Option<String>,

    #[arg(long)]
    pub category: Option<String>,

    /// First day to include (YYYY-MM-DD)
    #[arg(long)]
    pub from: Option<NaiveDate>,

    /// Last day to include (YYYY-MM-DD)
    #[arg(long)]
    pub to: Option<NaiveDate>,

    /// Only daily rows
    #[arg(long, conflicts_with = "hourly")]
    pub daily: bool,

    /// Only hourly rows
    #[arg(long)]
    pub hourly: bool,

    /// Print the total value instead of rows
    #[arg(long)]
    pub sum: bool,

    #[arg(long)]
    pub json: bool,
}

impl ListArgs {
    pub fn query(&self) -> MetricQuery {
        let mut query = MetricQuery::new();
        if let Some(name) = &self.name {
            query = query.name(name.clone());
        }
        if let Some(category) = &self.category {
            query = query.category(category.clone());
        }
        if self.daily {
            query = query.daily();
        }
        if self.hourly {
            query = query.hourly();
        }
        match (self.from, self.to) {
            (None, None) => query,
            (from, to) => query.between_dates(
                from.unwrap_or(NaiveDate::MIN),
                to.unwrap_or(NaiveDate::MAX),
            ),
        }
    }
}

pub fn handle_list(runtime: &MetricsRuntime, args: ListArgs) -> Result<(), MetricsError> {
    let query = args.query();

    if args.sum {
        let sum = runtime.db.sum(&query)?;
        if args.json {
            println!("{}", json!({ "sum": sum }));
        } else {
            println!("{}", sum);
        }
        return Ok(());
    }

    let metrics = runtime.db.get(&query)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&metrics)?);
        return Ok(());
    }

    if metrics.is_empty() {
        println!("No metrics found.");
        return Ok(());
    }
    for metric in &metrics {
        println!("{}", format_row(metric));
    }
    Ok(())
}

fn format_row(metric: &Metric) -> String {
    let mut row = format!("{:04}-{:02}-{:02}", metric.year, metric.month, metric.day);
    match metric.hour {
        Some(hour) => row.push_str(&format!(" {:02}:00", hour)),
        None => row.push_str("      "),
    }
    row.push_str(&format!("  {}", metric.name));
    if let Some(category) = &metric.category {
        row.push_str(&format!(" [{}]", category));
    }
    if let (Some(kind), Some(id)) = (&metric.measurable_type, &metric.measurable_id) {
        row.push_str(&format!(" {}:{}", kind, id));
    }
    row.push_str(&format!("  {}", metric.value));
    row
}
