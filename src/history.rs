// ===============================
// src/history.rs (compacted per-group time series)
// ===============================
use std::collections::BTreeMap;

use serde::Serialize;

const DECIMATE_AFTER: i64 = 25 * 3600;
const KEEP_WINDOW: i64 = 24 * 3600;
const MIN_GAP: i64 = 60;
const MIN_REL_CHANGE: f64 = 0.0005;

/// `(unix seconds, value)`, oldest first.
pub type Point = (i64, f64);

/// Series per group name for one graphed parameter.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct History {
    series: BTreeMap<String, Vec<Point>>,
}

impl History {
    pub fn new() -> Self { Self::default() }

    pub fn record(&mut self, group: &str, value: f64) {
        self.record_at(group, chrono::Utc::now().timestamp(), value);
    }

    pub fn record_at(&mut self, group: &str, now: i64, value: f64) {
        if value.is_nan() {
            return;
        }
        let pts = self.series.entry(group.to_string()).or_default();
        decimate(pts, now);

        let n = pts.len();
        if n < 2 {
            pts.push((now, value));
            return;
        }
        let (t_prev, v_prev) = pts[n - 2];
        let mean = (v_prev.abs() + value.abs()) / 2.0;
        if now - t_prev >= MIN_GAP && (value - v_prev).abs() > MIN_REL_CHANGE * mean {
            pts.push((now, value));
        } else {
            // timpa titik terakhir
            pts[n - 1] = (now, value);
        }
    }

    pub fn series(&self, group: &str) -> Option<&[Point]> {
        self.series.get(group).map(Vec::as_slice)
    }

    pub fn groups(&self) -> impl Iterator<Item = (&str, &[Point])> {
        self.series.iter().map(|(g, p)| (g.as_str(), p.as_slice()))
    }
}

/// Drop leading points older than a day once the oldest is past 25h.
/// The two most recent points always stay.
fn decimate(pts: &mut Vec<Point>, now: i64) {
    let n = pts.len();
    if n <= 1 || now - pts[0].0 <= DECIMATE_AFTER {
        return;
    }
    let cut = pts
        .iter()
        .position(|(t, _)| now - t < KEEP_WINDOW)
        .unwrap_or(n)
        .min(n - 2);
    pts.drain(..cut);
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000;

    #[test]
    fn first_two_samples_always_append() {
        let mut h = History::new();
        h.record_at("g", T0, 1.0);
        h.record_at("g", T0, 1.0);
        assert_eq!(h.series("g").unwrap().len(), 2);
    }

    #[test]
    fn rapid_or_flat_samples_coalesce_into_last_point() {
        let mut h = History::new();
        h.record_at("g", T0, 100.0);
        h.record_at("g", T0 + 1, 100.0);
        // terlalu cepat, walau berubah besar
        h.record_at("g", T0 + 30, 150.0);
        assert_eq!(h.series("g").unwrap(), &[(T0, 100.0), (T0 + 30, 150.0)]);
        // cukup lama, tapi perubahan < 0.05%
        h.record_at("g", T0 + 120, 100.01);
        assert_eq!(h.series("g").unwrap(), &[(T0, 100.0), (T0 + 120, 100.01)]);
    }

    #[test]
    fn significant_change_after_a_minute_appends() {
        let mut h = History::new();
        h.record_at("g", T0, 100.0);
        h.record_at("g", T0 + 10, 101.0);
        h.record_at("g", T0 + 60, 101.0);
        assert_eq!(h.series("g").unwrap().len(), 3);
    }

    #[test]
    fn decimation_drops_old_points_but_keeps_two_latest() {
        let mut h = History::new();
        for i in 0..5 {
            h.record_at("g", T0 + i * 3600, i as f64 * 10.0);
        }
        assert_eq!(h.series("g").unwrap().len(), 5);
        // 30 jam kemudian semua titik > 24 jam, tetap sisa 2 terbaru + baru
        let later = T0 + 30 * 3600;
        h.record_at("g", later, 1000.0);
        let s = h.series("g").unwrap();
        assert_eq!(s.len(), 3);
        assert_eq!(s[0], (T0 + 3 * 3600, 30.0));
        assert_eq!(s[2], (later, 1000.0));
    }

    #[test]
    fn decimation_keeps_last_day() {
        let mut h = History::new();
        h.record_at("g", T0, 1.0);
        h.record_at("g", T0 + 3600, 2.0);
        h.record_at("g", T0 + 20 * 3600, 3.0);
        h.record_at("g", T0 + 22 * 3600, 4.0);
        h.record_at("g", T0 + 26 * 3600, 5.0);
        assert_eq!(
            h.series("g").unwrap(),
            &[(T0 + 20 * 3600, 3.0), (T0 + 22 * 3600, 4.0), (T0 + 26 * 3600, 5.0)]
        );
    }

    #[test]
    fn nan_is_not_recorded_and_groups_are_separate() {
        let mut h = History::new();
        h.record_at("a", T0, f64::NAN);
        h.record_at("b", T0, 1.0);
        assert!(h.series("a").is_none());
        assert_eq!(h.groups().count(), 1);
    }
}
