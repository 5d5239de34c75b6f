// src/metrics.rs
//
// Concentration indices over a balance distribution. Every function takes the
// distribution sorted in descending order together with the circulation it
// sums to, and is deterministic and side-effect free.

/// Number of entities in the distribution.
pub fn total_entities(distribution: &[f64]) -> usize {
    distribution.len()
}

/// Market share of the single largest holder, 0 when circulation is 0.
pub fn max_power_ratio(distribution: &[f64], circulation: f64) -> f64 {
    if circulation == 0.0 {
        return 0.0;
    }
    match distribution.first() {
        Some(top) => top / circulation,
        None => 0.0,
    }
}

/// Gini coefficient using the discrete formula
/// `1 - sum_i share_i * (1/N + 2*i/N)` where `i` is the zero-based rank of
/// the richer population already processed.
pub fn gini(distribution: &[f64], circulation: f64) -> f64 {
    let population = distribution.len() as f64;
    let mut parsed = 0.0;
    let mut gini = 1.0;
    for balance in distribution {
        let richer_population_percentage = parsed / population;
        let market_share = balance / circulation;
        gini -= market_share * ((1.0 / population) + (2.0 * richer_population_percentage));
        parsed += 1.0;
    }
    gini
}

/// Herfindahl-Hirschman index: sum of squared percentage market shares,
/// in [0, 10000].
pub fn hhi(distribution: &[f64], circulation: f64) -> f64 {
    distribution
        .iter()
        .map(|balance| {
            let market_share = balance / circulation * 100.0;
            market_share * market_share
        })
        .sum()
}

/// Shannon entropy `-sum share_i * log2(share_i)` over strictly positive
/// shares; 0 for a single holder.
pub fn shannon_entropy(distribution: &[f64], circulation: f64) -> f64 {
    let mut entropy = 0.0;
    for balance in distribution {
        let market_share = balance / circulation;
        if market_share > 0.0 {
            entropy -= market_share * market_share.log2();
        }
    }
    entropy
}

/// Theil-T index `(1/N) * sum (x_i/mu) * ln(x_i/mu)` with `mu = circulation/N`.
/// Zero entries contribute 0; an empty distribution yields 0.
pub fn theil_index(distribution: &[f64], circulation: f64) -> f64 {
    let population = distribution.len();
    if population == 0 {
        return 0.0;
    }
    let mu = circulation / population as f64;
    let mut theil = 0.0;
    for balance in distribution {
        if *balance > 0.0 {
            let ratio = balance / mu;
            theil += ratio * ratio.ln();
        }
    }
    theil / population as f64
}

/// Nakamoto-style tau index: the number of top entities whose cumulative
/// market share reaches `threshold`, together with the share they capture.
///
/// The loop tests the share accumulated so far and stops before counting the
/// next entry once the threshold is met, so share equality counts as reached.
pub fn tau(distribution: &[f64], circulation: f64, threshold: f64) -> (usize, f64) {
    let mut tau_index = 0;
    let mut tau_market_share = 0.0;
    for balance in distribution {
        if tau_market_share >= threshold {
            break;
        }
        tau_index += 1;
        tau_market_share += balance / circulation;
    }
    (tau_index, tau_market_share)
}
