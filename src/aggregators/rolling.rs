use std::collections::VecDeque;

use crate::aggregators::aggregation_block::{Candle, MovingAverage};
use crate::utils::commons::finite;

/// Annotates each candle with `ma_<N>` / `ma_<N>_valid` for every window in `windows`.
///
/// The average covers the trailing N rows present in the series, ignoring rows whose
/// metric is missing, so it has a value from the first row on. It is flagged valid only
/// once those N rows all carry the metric. Zero-length windows are ignored.
pub fn annotate(candles: &mut [Candle], metric: &str, windows: &[usize]) {
    let values: Vec<Option<f64>> = candles.iter().map(|c| c.metric(metric)).collect();

    for &window in windows.iter().filter(|w| **w > 0) {
        let mut trailing: VecDeque<Option<f64>> = VecDeque::with_capacity(window + 1);
        let mut sum = 0.0;
        let mut count = 0usize;

        for (candle, value) in candles.iter_mut().zip(&values) {
            trailing.push_back(*value);
            if let Some(v) = value {
                sum += v;
                count += 1;
            }

            if trailing.len() > window {
                if let Some(Some(expired)) = trailing.pop_front() {
                    sum -= expired;
                    count -= 1;
                }
            }

            // Reset on an empty window so subtraction error cannot accumulate
            if count == 0 {
                sum = 0.0;
            }

            candle.averages.insert(
                window,
                MovingAverage {
                    value: if count > 0 { finite(sum / count as f64) } else { None },
                    valid: count >= window,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    const METRIC: &str = "spread_avg_L20_pct";

    fn candles(values: &[Option<f64>]) -> Vec<Candle> {
        let base = Utc.with_ymd_and_hms(2025, 8, 7, 0, 0, 0).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| Candle::new(base + Duration::minutes(i as i64), Some(1.0)).with_metric(METRIC, *v))
            .collect()
    }

    fn brute_force(values: &[Option<f64>], i: usize, window: usize) -> Option<f64> {
        let start = (i + 1).saturating_sub(window);
        let present: Vec<f64> = values[start..=i].iter().flatten().copied().collect();
        if present.is_empty() {
            None
        } else {
            Some(present.iter().sum::<f64>() / present.len() as f64)
        }
    }

    #[test]
    fn test_valid_flag_follows_row_count() {
        for len in [0usize, 1, 2, 3, 4, 5, 9] {
            let values: Vec<_> = (0..len).map(|i| Some(i as f64)).collect();
            let mut series = candles(&values);
            annotate(&mut series, METRIC, &[3, 5]);

            for (i, candle) in series.iter().enumerate() {
                assert_eq!(candle.averages[&3].valid, i + 1 >= 3, "len {} row {}", len, i);
                assert_eq!(candle.averages[&5].valid, i + 1 >= 5, "len {} row {}", len, i);
            }
        }
    }

    #[test]
    fn test_partial_window_average_from_first_row() {
        let values: Vec<_> = (1..=6).map(|i| Some(i as f64)).collect();
        let mut series = candles(&values);
        annotate(&mut series, METRIC, &[4]);

        let averages: Vec<_> = series.iter().map(|c| c.averages[&4].value).collect();
        assert_eq!(
            averages,
            vec![Some(1.0), Some(1.5), Some(2.0), Some(2.5), Some(3.5), Some(4.5)]
        );
    }

    #[test]
    fn test_missing_values_shrink_window_and_block_validity() {
        let values = vec![
            Some(1.0),
            None,
            Some(3.0),
            Some(f64::NAN),
            Some(5.0),
            Some(6.0),
            Some(7.0),
            None,
            None,
            None,
        ];
        let mut series = candles(&values);
        annotate(&mut series, METRIC, &[3]);

        for (i, candle) in series.iter().enumerate() {
            let cleaned: Vec<Option<f64>> = values.iter().map(|v| v.and_then(finite)).collect();
            let expected = brute_force(&cleaned, i, 3);
            let actual = candle.averages[&3].value;
            match (expected, actual) {
                (Some(e), Some(a)) => assert!((e - a).abs() < 1e-9, "row {}", i),
                (e, a) => assert_eq!(e, a, "row {}", i),
            }
        }

        let valid: Vec<bool> = series.iter().map(|c| c.averages[&3].valid).collect();
        assert_eq!(
            valid,
            vec![false, false, false, false, false, false, true, false, false, false]
        );
        assert_eq!(series[9].averages[&3].value, None);
    }

    #[test]
    fn test_window_longer_than_series() {
        let mut series = candles(&[Some(2.0), Some(4.0)]);
        annotate(&mut series, METRIC, &[50, 0]);
        assert_eq!(series[1].averages[&50], MovingAverage { value: Some(3.0), valid: false });
        assert!(!series[1].averages.contains_key(&0));
    }
}
