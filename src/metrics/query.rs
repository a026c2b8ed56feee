//! Simple filters over persisted metric rows.

use chrono::{Datelike, Duration, Months, NaiveDate, NaiveDateTime, Timelike, Utc};
use rusqlite::types::Value;

use crate::metrics::measurable::{Granularity, MeasurableRef};

/// Sortable day key: `yyyymmdd`
const DAY_KEY: &str = "(year * 10000 + month * 100 + day)";
/// Sortable hour key: `yyyymmddhh`, only meaningful for hourly rows
const HOUR_KEY: &str = "((year * 10000 + month * 100 + day) * 100 + hour)";

#[derive(Debug, Clone, Default)]
pub struct MetricQuery {
    name: Option<String>,
    category: Option<String>,
    measurable: Option<MeasurableRef>,
    granularity: Option<Granularity>,
    days: Option<(i64, i64)>,
    hours: Option<(i64, i64)>,
}

impl MetricQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn measurable(mut self, measurable: &MeasurableRef) -> Self {
        self.measurable = Some(measurable.clone());
        self
    }

    /// Only rows without an hour component
    pub fn daily(mut self) -> Self {
        self.granularity = Some(Granularity::Daily);
        self
    }

    /// Only hourly rows
    pub fn hourly(mut self) -> Self {
        self.granularity = Some(Granularity::Hourly);
        self
    }

    pub fn on_date(self, date: NaiveDate) -> Self {
        self.between_dates(date, date)
    }

    /// Rows dated from `start` through `end`, inclusive
    pub fn between_dates(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.days = Some((day_key(start), day_key(end)));
        self
    }

    pub fn in_month(self, year: i32, month: u32) -> Self {
        let first = NaiveDate::from_ymd_opt(year, month, 1);
        let last = match month {
            12 => NaiveDate::from_ymd_opt(year, 12, 31),
            _ => first
                .and_then(|first| first.checked_add_months(Months::new(1)))
                .and_then(|next| next.pred_opt()),
        };
        match (first, last) {
            (Some(first), Some(last)) => self.between_dates(first, last),
            // Out-of-range month: match nothing
            _ => self.between_dates(NaiveDate::MAX, NaiveDate::MIN),
        }
    }

    pub fn this_month(self) -> Self {
        let today = Utc::now().date_naive();
        self.in_month(today.year(), today.month())
    }

    pub fn last_month(self) -> Self {
        let today = Utc::now().date_naive();
        let previous = today - Months::new(1);
        self.in_month(previous.year(), previous.month())
    }

    /// Hourly rows for the hour containing `at`
    pub fn on_hour(self, at: NaiveDateTime) -> Self {
        self.between_hours(at, at)
    }

    /// Hourly rows from the hour of `start` through the hour of `end`, inclusive
    pub fn between_hours(mut self, start: NaiveDateTime, end: NaiveDateTime) -> Self {
        self.granularity = Some(Granularity::Hourly);
        self.hours = Some((hour_key(start), hour_key(end)));
        self
    }

    pub fn this_hour(self) -> Self {
        self.on_hour(Utc::now().naive_utc())
    }

    pub fn last_hour(self) -> Self {
        self.on_hour(Utc::now().naive_utc() - Duration::hours(1))
    }

    /// Render as a ` WHERE ...` clause (empty when unfiltered) plus its bound values.
    pub(crate) fn to_sql(&self) -> (String, Vec<Value>) {
        let mut conditions = Vec::new();
        let mut values = Vec::new();

        if let Some(name) = &self.name {
            values.push(Value::Text(name.clone()));
            conditions.push(format!("name = ?{}", values.len()));
        }
        if let Some(category) = &self.category {
            values.push(Value::Text(category.clone()));
            conditions.push(format!("category = ?{}", values.len()));
        }
        if let Some(measurable) = &self.measurable {
            values.push(Value::Text(measurable.kind.clone()));
            conditions.push(format!("measurable_type = ?{}", values.len()));
            values.push(Value::Text(measurable.id.clone()));
            conditions.push(format!("measurable_id = ?{}", values.len()));
        }
        match self.granularity {
            Some(Granularity::Daily) => conditions.push("hour IS NULL".to_string()),
            Some(Granularity::Hourly) => conditions.push("hour IS NOT NULL".to_string()),
            None => {}
        }
        if let Some((start, end)) = self.days {
            values.push(Value::Integer(start));
            values.push(Value::Integer(end));
            conditions.push(format!(
                "{} BETWEEN ?{} AND ?{}",
                DAY_KEY,
                values.len() - 1,
                values.len()
            ));
        }
        if let Some((start, end)) = self.hours {
            values.push(Value::Integer(start));
            values.push(Value::Integer(end));
            conditions.push(format!(
                "{} BETWEEN ?{} AND ?{}",
                HOUR_KEY,
                values.len() - 1,
                values.len()
            ));
        }

        if conditions.is_empty() {
            (String::new(), values)
        } else {
            (format!(" WHERE {}", conditions.join(" AND ")), values)
        }
    }
}

fn day_key(date: NaiveDate) -> i64 {
    date.year() as i64 * 10000 + date.month() as i64 * 100 + date.day() as i64
}

fn hour_key(at: NaiveDateTime) -> i64 {
    day_key(at.date()) * 100 + at.hour() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::db::MetricsDatabase;
    use crate::metrics::measurable::{Identity, MetricData};

    fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn seed(db: &MetricsDatabase, metric: MetricData) {
        db.record(&Identity::of(&metric), metric.value, None).unwrap();
    }

    fn seeded() -> MetricsDatabase {
        let db = MetricsDatabase::open_in_memory().unwrap();
        for (hour, value) in [(14, 5), (15, 10), (16, 15)] {
            seed(
                &db,
                MetricData::new("api:requests")
                    .with_date(at(2025, 10, 19, hour))
                    .hourly()
                    .with_value(value),
            );
        }
        seed(
            &db,
            MetricData::new("page_views")
                .with_date(at(2025, 10, 19, 0))
                .with_value(7),
        );
        seed(
            &db,
            MetricData::new("page_views")
                .with_date(at(2025, 9, 30, 0))
                .with_category("marketing")
                .with_value(2),
        );
        seed(
            &db,
            MetricData::new("page_views")
                .with_date(at(2025, 11, 1, 0))
                .with_measurable(MeasurableRef::new("user", 1))
                .with_value(4),
        );
        db
    }

    #[test]
    fn test_unfiltered_has_no_where_clause() {
        let (clause, values) = MetricQuery::new().to_sql();
        assert!(clause.is_empty());
        assert!(values.is_empty());
    }

    #[test]
    fn test_between_hours_is_inclusive() {
        let db = seeded();
        let query = MetricQuery::new().between_hours(at(2025, 10, 19, 14), at(2025, 10, 19, 15));
        assert_eq!(db.sum(&query).unwrap(), 15);
    }

    #[test]
    fn test_on_hour() {
        let db = seeded();
        let query = MetricQuery::new().on_hour(at(2025, 10, 19, 16));
        assert_eq!(db.sum(&query).unwrap(), 15);
    }

    #[test]
    fn test_daily_and_hourly_filters() {
        let db = seeded();
        assert_eq!(db.count(&MetricQuery::new().hourly()).unwrap(), 3);
        assert_eq!(db.count(&MetricQuery::new().daily()).unwrap(), 3);
    }

    #[test]
    fn test_in_month() {
        let db = seeded();
        let october = MetricQuery::new().name("page_views").in_month(2025, 10);
        assert_eq!(db.sum(&october).unwrap(), 7);

        let september = MetricQuery::new().in_month(2025, 9);
        assert_eq!(db.sum(&september).unwrap(), 2);
    }

    #[test]
    fn test_in_december_wraps_year() {
        let db = MetricsDatabase::open_in_memory().unwrap();
        seed(&db, MetricData::new("x").with_date(at(2025, 12, 31, 0)).with_value(3));
        seed(&db, MetricData::new("x").with_date(at(2026, 1, 1, 0)).with_value(4));
        assert_eq!(db.sum(&MetricQuery::new().in_month(2025, 12)).unwrap(), 3);
    }

    #[test]
    fn test_invalid_month_matches_nothing() {
        let db = seeded();
        assert_eq!(db.count(&MetricQuery::new().in_month(2025, 13)).unwrap(), 0);
    }

    #[test]
    fn test_month_at_end_of_calendar() {
        let db = seeded();
        let query = MetricQuery::new().in_month(NaiveDate::MAX.year(), 12);

        let first = NaiveDate::MAX.with_day(1).unwrap();
        let (_, values) = query.to_sql();
        assert_eq!(
            values,
            vec![Value::Integer(day_key(first)), Value::Integer(day_key(NaiveDate::MAX))]
        );
        assert_eq!(db.count(&query).unwrap(), 0);
    }

    #[test]
    fn test_leap_february() {
        let query = MetricQuery::new().in_month(2024, 2);
        let (_, values) = query.to_sql();
        assert_eq!(values, vec![Value::Integer(20240201), Value::Integer(20240229)]);
    }

    #[test]
    fn test_between_dates_spans_months() {
        let db = seeded();
        let query = MetricQuery::new().name("page_views").between_dates(
            NaiveDate::from_ymd_opt(2025, 9, 30).unwrap(),
            NaiveDate::from_ymd_opt(2025, 10, 31).unwrap(),
        );
        assert_eq!(db.sum(&query).unwrap(), 9);
    }

    #[test]
    fn test_category_and_measurable_filters() {
        let db = seeded();
        assert_eq!(db.sum(&MetricQuery::new().category("marketing")).unwrap(), 2);

        let user = MeasurableRef::new("user", 1);
        assert_eq!(db.sum(&MetricQuery::new().measurable(&user)).unwrap(), 4);
    }

    #[test]
    fn test_this_hour_and_last_hour() {
        let db = MetricsDatabase::open_in_memory().unwrap();
        let now = Utc::now().naive_utc();
        seed(
            &db,
            MetricData::new("api:requests")
                .with_date(now)
                .hourly()
                .with_value(5),
        );
        seed(
            &db,
            MetricData::new("api:requests")
                .with_date(now - Duration::hours(1))
                .hourly()
                .with_value(3),
        );

        assert_eq!(db.sum(&MetricQuery::new().this_hour()).unwrap(), 5);
        assert_eq!(db.sum(&MetricQuery::new().last_hour()).unwrap(), 3);
    }

    #[test]
    fn test_this_month_and_last_month() {
        let db = MetricsDatabase::open_in_memory().unwrap();
        let now = Utc::now().naive_utc();
        seed(&db, MetricData::new("signups").with_date(now).with_value(6));
        seed(
            &db,
            MetricData::new("signups")
                .with_date(now - Months::new(1))
                .with_value(1),
        );

        assert_eq!(db.sum(&MetricQuery::new().this_month()).unwrap(), 6);
        assert_eq!(db.sum(&MetricQuery::new().last_month()).unwrap(), 1);
    }
}
