//! Benchmarks for next-fire-time calculations.

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc, Weekday};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use cadence::{
    CalendarIntervalSchedule, DailyTimeIntervalSchedule, IntervalUnit, Repeat, Schedule,
};

/// Walk `n` consecutive fire times.
fn walk(schedule: &Schedule, start: DateTime<Utc>, n: usize) -> Option<DateTime<Utc>> {
    let mut t = schedule.first_fire_time(start, None)?;
    for _ in 1..n {
        t = schedule.fire_time_after(start, None, t)?;
    }
    Some(t)
}

fn bench_next_fire_times(c: &mut Criterion) {
    let mut group = c.benchmark_group("next_fire_times");

    let start = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
    let schedules = [
        ("simple_5m", Schedule::every(Duration::minutes(5), Repeat::Forever)),
        ("cron_minute", Schedule::cron("0 * * * * *").unwrap()),
        (
            "cron_weekdays_berlin",
            Schedule::cron_in("0 30 9 * * Mon-Fri", "Europe/Berlin").unwrap(),
        ),
        (
            "calendar_monthly",
            Schedule::CalendarInterval(
                CalendarIntervalSchedule::new(IntervalUnit::Month, 1).in_timezone("America/New_York"),
            ),
        ),
        (
            "daily_business_hours",
            Schedule::DailyTimeInterval(
                DailyTimeIntervalSchedule::new(
                    NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                    NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
                    IntervalUnit::Minute,
                    15,
                )
                .on_days([Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri])
                .with_repeat(Repeat::Forever),
            ),
        ),
    ];

    for n in [10, 100].iter() {
        for (name, schedule) in &schedules {
            group.bench_with_input(BenchmarkId::new(*name, n), n, |b, &n| {
                b.iter(|| walk(schedule, start, n));
            });
        }
    }

    group.finish();
}

fn bench_simple_catch_up(c: &mut Criterion) {
    // simple schedules jump straight to the slot after a long gap
    let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    let after = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
    let schedule = Schedule::every(Duration::seconds(1), Repeat::Forever);

    c.bench_function("simple_catch_up_four_years", |b| {
        b.iter(|| schedule.fire_time_after(start, None, after));
    });
}

criterion_group!(benches, bench_next_fire_times, bench_simple_catch_up);

criterion_main!(benches);
