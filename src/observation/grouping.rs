use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

use super::{Boundary, ObservationGroup};
use crate::measurement::MeasurementGroup;
use crate::template::PeriodInterval;

/// Buckets a measurement group into observation windows, ordered by start time.
///
/// Correlated measurements always form a single window spanning all of them.
/// Otherwise `Single` gives one window per measurement, even when timestamps
/// repeat, and the periodic intervals give one window per UTC hour or day.
pub fn create_observation_groups(group: &MeasurementGroup, interval: PeriodInterval) -> Vec<ObservationGroup> {
    if group.is_empty() {
        return Vec::new();
    }

    if group.correlation_id().is_some() {
        return vec![correlated_group(group)];
    }

    let Some(period) = interval.duration() else {
        return single_groups(group);
    };

    let mut windows: BTreeMap<Boundary, ObservationGroup> = BTreeMap::new();
    for measurement in group.measurements() {
        let boundary = periodic_window(measurement.occurrence_time_utc, period);
        windows
            .entry(boundary)
            .or_insert_with(|| ObservationGroup::new(group.key(), boundary))
            .add_measurement(measurement);
    }
    windows.into_values().collect()
}

/// Measurements sharing a timestamp keep their arrival order.
fn single_groups(group: &MeasurementGroup) -> Vec<ObservationGroup> {
    let mut windows: Vec<ObservationGroup> = group
        .measurements()
        .iter()
        .map(|measurement| {
            let mut window = ObservationGroup::new(group.key(), Boundary::instant(measurement.occurrence_time_utc));
            window.add_measurement(measurement);
            window
        })
        .collect();
    windows.sort_by_key(|window| window.boundary().start);
    windows
}

fn correlated_group(group: &MeasurementGroup) -> ObservationGroup {
    let first = group
        .measurements()
        .first()
        .map(|m| m.occurrence_time_utc)
        .unwrap_or_default();

    let mut observation = ObservationGroup::new(group.key(), Boundary::instant(first));
    for measurement in group.measurements() {
        observation.boundary_mut().include(measurement.occurrence_time_utc);
        observation.add_measurement(measurement);
    }
    observation
}

fn periodic_window(time: DateTime<Utc>, period: Duration) -> Boundary {
    let start = window_start(time, period);
    Boundary::new(start, start + period - Duration::milliseconds(1))
}

/// Floors `time` to a multiple of `period` since the Unix epoch.
pub fn window_start(time: DateTime<Utc>, period: Duration) -> DateTime<Utc> {
    let period_millis = period.num_milliseconds();
    if period_millis <= 0 {
        return time;
    }
    let offset_millis = time.timestamp_millis().rem_euclid(period_millis);
    let sub_millis = i64::from(time.timestamp_subsec_nanos() % 1_000_000);
    time - Duration::milliseconds(offset_millis) - Duration::nanoseconds(sub_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::Measurement;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, minute, second).unwrap()
    }

    fn create_test_group(times: &[DateTime<Utc>], correlation_id: Option<&str>) -> MeasurementGroup {
        let measurements = times.iter().enumerate().map(|(i, time)| {
            let mut measurement = Measurement::new("heartrate", "abc", *time);
            measurement.correlation_id = correlation_id.map(str::to_string);
            measurement.add_property("hr", (60 + i).to_string());
            measurement
        });
        MeasurementGroup::group(measurements).remove(0)
    }

    #[test]
    fn test_single_interval_gives_one_window_per_measurement() {
        let group = create_test_group(&[at(10, 5, 0), at(10, 0, 0), at(10, 5, 0)], None);
        let windows = create_observation_groups(&group, PeriodInterval::Single);

        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].boundary(), Boundary::instant(at(10, 0, 0)));
        assert_eq!(windows[1].boundary(), Boundary::instant(at(10, 5, 0)));
        assert_eq!(windows[2].boundary(), Boundary::instant(at(10, 5, 0)));
        for window in &windows {
            assert_eq!(window.values_of("hr").len(), 1);
        }
        // repeated timestamps keep arrival order
        assert_eq!(windows[1].values_of("hr")[0].1, "60");
        assert_eq!(windows[2].values_of("hr")[0].1, "62");
    }

    #[test]
    fn test_hourly_interval_collapses_same_hour() {
        let group = create_test_group(&[at(10, 0, 0), at(10, 59, 59), at(11, 0, 0)], None);
        let windows = create_observation_groups(&group, PeriodInterval::Hourly);

        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].boundary().start, at(10, 0, 0));
        assert_eq!(
            windows[0].boundary().end,
            at(10, 59, 59) + Duration::milliseconds(999)
        );
        assert_eq!(windows[0].values_of("hr").len(), 2);
        assert_eq!(windows[1].boundary().start, at(11, 0, 0));
        assert_eq!(windows[0].name(), "heartrate");
    }

    #[test]
    fn test_daily_interval_floors_to_utc_midnight() {
        let group = create_test_group(&[at(23, 30, 0)], None);
        let windows = create_observation_groups(&group, PeriodInterval::Daily);

        assert_eq!(windows[0].boundary().start, at(0, 0, 0));
        assert_eq!(windows[0].boundary().end, at(23, 59, 59) + Duration::milliseconds(999));
    }

    #[test]
    fn test_correlated_measurements_form_one_window() {
        let group = create_test_group(&[at(10, 30, 0), at(9, 0, 0), at(12, 0, 0)], Some("session-1"));
        let windows = create_observation_groups(&group, PeriodInterval::Hourly);

        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].boundary(), Boundary::new(at(9, 0, 0), at(12, 0, 0)));
        assert_eq!(windows[0].identity_segment(), "session-1");
        assert_eq!(windows[0].values_of("hr").len(), 3);
    }

    #[test]
    fn test_window_start_drops_sub_millisecond_precision() {
        let time = at(10, 17, 3) + Duration::nanoseconds(1_500_000);
        assert_eq!(window_start(time, Duration::hours(1)), at(10, 0, 0));
        assert_eq!(window_start(time, Duration::seconds(5)), at(10, 17, 0));
    }
}
