use crate::models::ParameterRange;
use std::collections::{BTreeMap, HashMap};

/// Extract a parameter as usize with a default value
pub fn get_param_usize(params: &HashMap<String, f64>, key: &str, default: usize) -> usize {
    params
        .get(key)
        .copied()
        .filter(|v| v.is_finite())
        .map(|v| v.round().max(0.0) as usize)
        .unwrap_or(default)
}

/// Extract a parameter as usize, rounded and clamped to a range with finite checks
pub fn get_param_usize_rounded_clamped(
    params: &HashMap<String, f64>,
    key: &str,
    default: usize,
    min: usize,
    max: usize,
) -> usize {
    let raw = params.get(key).copied().unwrap_or(default as f64);
    if !raw.is_finite() {
        return default;
    }
    raw.round().clamp(min as f64, max as f64) as usize
}

/// Get a parameter value with a default fallback
pub fn get_param(params: &HashMap<String, f64>, key: &str, default: f64) -> f64 {
    params.get(key).copied().unwrap_or(default)
}

/// Get a parameter rounded to an i32
pub fn get_rounded_param(params: &HashMap<String, f64>, key: &str, default: i32) -> i32 {
    params
        .get(key)
        .copied()
        .filter(|v| v.is_finite())
        .map(|v| v.round() as i32)
        .unwrap_or(default)
}

/// Get a finite parameter value, returns None if not found or not finite
pub fn finite_param(params: &HashMap<String, f64>, key: &str) -> Option<f64> {
    params.get(key).copied().filter(|v| v.is_finite())
}

/// Every value a range visits from `min` to `max` inclusive, stepping by `step`.
/// A non-positive step yields just `min`.
pub fn range_values(range: &ParameterRange) -> Vec<f64> {
    if !range.step.is_finite() || range.step <= 0.0 || range.max <= range.min {
        return vec![range.min];
    }
    let steps = ((range.max - range.min) / range.step + 1e-9).floor() as usize;
    (0..=steps)
        .map(|i| (range.min + i as f64 * range.step).min(range.max))
        .collect()
}

/// Cartesian product of `ranges` layered over `base`, in deterministic key order.
pub fn expand_parameter_grid(
    base: &HashMap<String, f64>,
    ranges: &BTreeMap<String, ParameterRange>,
) -> Vec<HashMap<String, f64>> {
    let mut variations = vec![base.clone()];
    for (key, range) in ranges {
        let values = range_values(range);
        variations = variations
            .into_iter()
            .flat_map(|params| {
                values.iter().map(move |value| {
                    let mut next = params.clone();
                    next.insert(key.clone(), *value);
                    next
                })
            })
            .collect();
    }
    variations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_values_include_both_ends() {
        let values = range_values(&ParameterRange {
            min: 0.1,
            max: 0.3,
            step: 0.1,
        });
        assert_eq!(values.len(), 3);
        assert!((values[2] - 0.3).abs() < 1e-12);

        let single = range_values(&ParameterRange {
            min: 5.0,
            max: 5.0,
            step: 1.0,
        });
        assert_eq!(single, vec![5.0]);
    }

    #[test]
    fn grid_is_cartesian_product_over_base() {
        let mut base = HashMap::new();
        base.insert("initialCapital".to_string(), 10_000.0);
        let mut ranges = BTreeMap::new();
        ranges.insert(
            "maxPositions".to_string(),
            ParameterRange {
                min: 2.0,
                max: 4.0,
                step: 1.0,
            },
        );
        ranges.insert(
            "cashBuffer".to_string(),
            ParameterRange {
                min: 0.0,
                max: 0.1,
                step: 0.1,
            },
        );

        let grid = expand_parameter_grid(&base, &ranges);
        assert_eq!(grid.len(), 6);
        assert!(grid
            .iter()
            .all(|params| params.get("initialCapital") == Some(&10_000.0)));
    }

    #[test]
    fn usize_params_round_and_ignore_non_finite() {
        let mut params = HashMap::new();
        params.insert("a".to_string(), 3.6);
        params.insert("b".to_string(), f64::NAN);
        assert_eq!(get_param_usize(&params, "a", 1), 4);
        assert_eq!(get_param_usize(&params, "b", 1), 1);
        assert_eq!(get_param_usize_rounded_clamped(&params, "a", 0, 0, 2), 2);
    }
}
