//! Weighted random sampling without replacement.

use rand::Rng;

/// Pick `min(k, items.len())` distinct items, favouring heavier weights.
///
/// Efraimidis-Spirakis: every item draws `u` uniformly from (0, 1) and gets
/// the key `u^(1/w)`; the `k` largest keys win. Keys are compared as
/// `ln(u) / w`, which orders identically without underflowing for small
/// weights. Missing weights count as 1 and non-positive ones as the smallest
/// positive float.
pub fn weighted_random_sample<T: Clone, R: Rng>(
    items: &[T],
    weights: Option<&[f64]>,
    k: usize,
    rng: &mut R,
) -> Vec<T> {
    if k == 0 || items.is_empty() {
        return Vec::new();
    }

    let mut keyed: Vec<(f64, usize)> = items
        .iter()
        .enumerate()
        .map(|(i, _)| {
            let weight = weights.and_then(|w| w.get(i)).copied().unwrap_or(1.0);
            let weight = if weight.is_finite() && weight > 0.0 {
                weight
            } else {
                f64::MIN_POSITIVE
            };
            let u: f64 = rng.gen_range(f64::EPSILON..1.0);
            (u.ln() / weight, i)
        })
        .collect();

    keyed.sort_by(|a, b| b.0.total_cmp(&a.0));
    keyed
        .into_iter()
        .take(k)
        .map(|(_, i)| items[i].clone())
        .collect()
}
