use crate::clock::Clock;
use chrono::{Duration as ChronoDuration, FixedOffset, NaiveDate};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Inclusive range of venue-local dates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// The `days` days ending with `today`, clipped at the earliest date
    pub fn trailing(today: NaiveDate, days: u32) -> Self {
        let span = ChronoDuration::days(i64::from(days.max(1)) - 1);
        Self {
            start: today.checked_sub_signed(span).unwrap_or(NaiveDate::MIN),
            end: today,
        }
    }
}

/// Running response-time aggregate
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct ResponseStats {
    count: u64,
    slow: u64,
    total_ms: u64,
    min_ms: u64,
    max_ms: u64,
}

impl ResponseStats {
    fn observe(&mut self, ms: u64, slow: bool) {
        if self.count == 0 {
            self.min_ms = ms;
            self.max_ms = ms;
        } else {
            self.min_ms = self.min_ms.min(ms);
            self.max_ms = self.max_ms.max(ms);
        }
        self.count += 1;
        self.total_ms += ms;
        if slow {
            self.slow += 1;
        }
    }

    fn merge(&mut self, other: &ResponseStats) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        self.min_ms = self.min_ms.min(other.min_ms);
        self.max_ms = self.max_ms.max(other.max_ms);
        self.count += other.count;
        self.slow += other.slow;
        self.total_ms += other.total_ms;
    }

    fn avg_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms as f64 / self.count as f64
        }
    }

    fn fast(&self) -> u64 {
        self.count - self.slow
    }

    fn score(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.fast() as f64 / self.count as f64 * 100.0
        }
    }
}

/// Per-day slice of a performance report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyPerformance {
    pub date: NaiveDate,
    pub avg_response_time_ms: f64,
    pub min_response_time_ms: u64,
    pub max_response_time_ms: u64,
    pub total_triggers: u64,
    pub fast_responses: u64,
    pub slow_responses: u64,
    pub performance_score: f64,
}

/// Response-time summary against the SLA
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub sla_threshold_ms: u64,
    pub avg_response_time_ms: f64,
    pub min_response_time_ms: u64,
    pub max_response_time_ms: u64,
    pub total_triggers: u64,
    pub fast_responses: u64,
    pub slow_responses: u64,
    pub performance_score: f64,
    pub target_met: bool,
    pub daily: Vec<DailyPerformance>,
}

/// Aggregates trigger response times by venue-local day
pub struct PerformanceMonitor {
    clock: Arc<dyn Clock>,
    zone: FixedOffset,
    sla_threshold_ms: u64,
    target_score: f64,
    retention_days: u32,
    days: Mutex<BTreeMap<NaiveDate, ResponseStats>>,
}

impl PerformanceMonitor {
    pub fn new(
        clock: Arc<dyn Clock>,
        zone: FixedOffset,
        sla_threshold_ms: u64,
        target_score: f64,
        retention_days: u32,
    ) -> Self {
        Self {
            clock,
            zone,
            sla_threshold_ms,
            target_score,
            retention_days,
            days: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn sla_threshold_ms(&self) -> u64 {
        self.sla_threshold_ms
    }

    /// Record one response time
    pub fn observe(&self, ms: u64) {
        let slow = ms > self.sla_threshold_ms;
        let today = self.clock.today(self.zone);

        {
            let mut days = self.days.lock();
            days.entry(today).or_default().observe(ms, slow);

            if self.retention_days > 0 {
                let window = ChronoDuration::days(i64::from(self.retention_days));
                if let Some(cutoff) = today.checked_sub_signed(window) {
                    days.retain(|date, _| *date > cutoff);
                }
            }
        }

        metrics::histogram!("ceremony.trigger.response_time_ms").record(ms as f64);
        if slow {
            metrics::counter!("ceremony.triggers.sla_violations").increment(1);
            warn!(
                response_time_ms = ms,
                sla_threshold_ms = self.sla_threshold_ms,
                "Trigger response exceeded SLA"
            );
        }
    }

    /// The trailing window ending today
    pub fn default_range(&self, days: u32) -> DateRange {
        DateRange::trailing(self.clock.today(self.zone), days)
    }

    /// Summarise observations within `range`, with one entry per observed day
    pub fn report(&self, range: DateRange) -> PerformanceReport {
        let days = self.days.lock();

        let mut overall = ResponseStats::default();
        let mut daily = Vec::new();
        for (date, stats) in days.range(range.start..=range.end) {
            overall.merge(stats);
            daily.push(DailyPerformance {
                date: *date,
                avg_response_time_ms: stats.avg_ms(),
                min_response_time_ms: stats.min_ms,
                max_response_time_ms: stats.max_ms,
                total_triggers: stats.count,
                fast_responses: stats.fast(),
                slow_responses: stats.slow,
                performance_score: stats.score(),
            });
        }

        let performance_score = overall.score();

        PerformanceReport {
            start_date: range.start,
            end_date: range.end,
            sla_threshold_ms: self.sla_threshold_ms,
            avg_response_time_ms: overall.avg_ms(),
            min_response_time_ms: overall.min_ms,
            max_response_time_ms: overall.max_ms,
            total_triggers: overall.count,
            fast_responses: overall.fast(),
            slow_responses: overall.slow,
            performance_score,
            target_met: overall.count > 0 && performance_score >= self.target_score,
            daily,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};

    fn monitor(clock: Arc<ManualClock>) -> PerformanceMonitor {
        PerformanceMonitor::new(clock, FixedOffset::east_opt(0).unwrap(), 500, 95.0, 30)
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 8, day).unwrap()
    }

    #[test]
    fn test_aggregates_and_sla_counts() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 8, 10, 12, 0, 0).unwrap()));
        let monitor = monitor(clock);

        for ms in [40, 120, 500, 700] {
            monitor.observe(ms);
        }

        let report = monitor.report(DateRange::new(date(10), date(10)).unwrap());
        assert_eq!(report.total_triggers, 4);
        assert_eq!(report.min_response_time_ms, 40);
        assert_eq!(report.max_response_time_ms, 700);
        assert!((report.avg_response_time_ms - 340.0).abs() < 1e-9);
        assert_eq!(report.fast_responses, 3);
        assert_eq!(report.slow_responses, 1);
        assert!((report.performance_score - 75.0).abs() < 1e-9);
        assert!(!report.target_met);
    }

    #[test]
    fn test_target_met_at_95_percent() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 8, 10, 12, 0, 0).unwrap()));
        let monitor = monitor(clock);

        for _ in 0..19 {
            monitor.observe(100);
        }
        monitor.observe(900);

        let report = monitor.report(monitor.default_range(7));
        assert!((report.performance_score - 95.0).abs() < 1e-9);
        assert!(report.target_met);
    }

    #[test]
    fn test_daily_breakdown_respects_range() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 8, 1, 12, 0, 0).unwrap()));
        let monitor = monitor(clock.clone());

        monitor.observe(100);
        clock.advance(chrono::Duration::days(5));
        monitor.observe(300);
        monitor.observe(600);
        clock.advance(chrono::Duration::days(5));
        monitor.observe(50);

        let report = monitor.report(DateRange::new(date(2), date(11)).unwrap());
        assert_eq!(report.total_triggers, 3);
        let days: Vec<NaiveDate> = report.daily.iter().map(|d| d.date).collect();
        assert_eq!(days, vec![date(6), date(11)]);
        assert_eq!(report.daily[0].slow_responses, 1);
    }

    #[test]
    fn test_empty_report() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 8, 10, 12, 0, 0).unwrap()));
        let monitor = monitor(clock);

        let report = monitor.report(monitor.default_range(7));

        assert_eq!(report.start_date, date(4));
        assert_eq!(report.end_date, date(10));
        assert_eq!(report.total_triggers, 0);
        assert_eq!(report.performance_score, 0.0);
        assert!(!report.target_met);
        assert!(report.daily.is_empty());
    }

    #[test]
    fn test_old_days_are_pruned() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap()));
        let monitor = monitor(clock.clone());

        monitor.observe(100);
        clock.advance(chrono::Duration::days(31));
        monitor.observe(100);

        let everything = DateRange::new(date(1) - ChronoDuration::days(60), date(31)).unwrap();
        assert_eq!(monitor.report(everything).total_triggers, 1);
    }

    #[test]
    fn test_trailing_clips_at_earliest_date() {
        let near_earliest = NaiveDate::MIN.succ_opt().unwrap();

        let range = DateRange::trailing(near_earliest, 7);
        assert_eq!(range.start, NaiveDate::MIN);
        assert_eq!(range.end, near_earliest);

        let range = DateRange::trailing(NaiveDate::MIN, 366);
        assert_eq!(range.start, NaiveDate::MIN);
    }

    #[test]
    fn test_inverted_range_rejected() {
        assert!(DateRange::new(date(5), date(4)).is_none());
    }
}
