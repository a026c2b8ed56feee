use chrono::{NaiveDate, NaiveDateTime};
use clap::Args;
use serde_json::Value;

use crate::error::MetricsError;
use crate::metrics::{MeasurableRef, Metadata, MetricsManager, metric};
use crate::runtime::MetricsRuntime;

#[derive(Args, Debug)]
pub struct RecordArgs {
    /// Metric name
    pub name: String,

    #[arg(long)]
    pub category: Option<String>,

    #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
    pub value: i64,

    /// YYYY-MM-DD or YYYY-MM-DDTHH:MM[:SS], UTC. Defaults to now.
    #[arg(long, value_parser = parse_date)]
    pub date: Option<NaiveDateTime>,

    /// Bucket by hour as well as by day
    #[arg(long)]
    pub hourly: bool,

    /// Entity the metric belongs to
    #[arg(long, value_name = "TYPE:ID", value_parser = parse_measurable)]
    pub measurable: Option<MeasurableRef>,

    /// Metadata to merge into the row; values are parsed as JSON when possible
    #[arg(long = "meta", value_name = "KEY=VALUE", value_parser = parse_meta)]
    pub meta: Vec<(String, Value)>,

    /// Stage in the buffer until the next commit
    #[arg(long)]
    pub buffer: bool,
}

pub fn handle_record(runtime: &MetricsRuntime, args: RecordArgs) -> Result<(), MetricsError> {
    let mut pending = metric(args.name.clone());
    if let Some(category) = args.category {
        pending = pending.category(category);
    }
    if let Some(date) = args.date {
        pending = pending.date(date);
    }
    if args.hourly {
        pending = pending.hourly();
    }
    if let Some(measurable) = args.measurable {
        pending = pending.measurable(measurable);
    }
    if !args.meta.is_empty() {
        pending = pending.with(args.meta.into_iter().collect::<Metadata>());
    }

    if args.buffer {
        runtime.manager.capture();
    }

    match pending.record(&*runtime.manager, args.value)? {
        Some(row) => println!("Recorded {} ({} total).", row.name, row.value),
        None if args.buffer => println!("Buffered {}.", args.name),
        None => println!("Queued {}.", args.name),
    }
    Ok(())
}

fn parse_date(input: &str) -> Result<NaiveDateTime, String> {
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        return Ok(date.and_time(chrono::NaiveTime::MIN));
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(input, format).ok())
        .ok_or_else(|| format!("invalid date '{}', expected YYYY-MM-DD[THH:MM[:SS]]", input))
}

fn parse_measurable(input: &str) -> Result<MeasurableRef, String> {
    match input.split_once(':') {
        Some((kind, id)) if !kind.is_empty() && !id.is_empty() => Ok(MeasurableRef::new(kind, id)),
        _ => Err(format!("invalid measurable '{}', expected TYPE:ID", input)),
    }
}

fn parse_meta(input: &str) -> Result<(String, Value), String> {
    let (key, value) = input
        .split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .ok_or_else(|| format!("invalid metadata '{}', expected KEY=VALUE", input))?;
    let value =
        serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
