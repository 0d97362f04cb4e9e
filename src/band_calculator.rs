/// Distance buckets from the mark price, carrying point multipliers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    A,
    B,
    C,
    Out,
}

impl Band {
    pub fn points_multiplier(self) -> f64 {
        match self {
            Band::A => 1.0,
            Band::B => 0.5,
            Band::C => 0.1,
            Band::Out => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BandConfig {
    pub a_max_bps: f64,
    pub b_max_bps: f64,
    pub c_max_bps: f64,
}

impl Default for BandConfig {
    fn default() -> Self {
        BandConfig {
            a_max_bps: 10.0,
            b_max_bps: 30.0,
            c_max_bps: 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DynamicDistanceConfig {
    pub min_bps: f64,
    pub max_bps: f64,
    pub spread_factor: f64,
    pub volatility_factor: f64,
}

impl Default for DynamicDistanceConfig {
    fn default() -> Self {
        DynamicDistanceConfig {
            min_bps: 5.0,
            max_bps: 9.0,
            spread_factor: 0.6,
            volatility_factor: 0.8,
        }
    }
}

/// `|p - ref| / ref * 10000`.
pub fn distance_bps(reference_price: f64, order_price: f64) -> f64 {
    if reference_price <= 0.0 {
        return 0.0;
    }
    (order_price - reference_price).abs() / reference_price * 10_000.0
}

/// First interval whose upper bound is ≥ distance; else `Out`. Each bound is
/// inclusive to its own band — distance exactly at a boundary stays in the
/// narrower band.
pub fn get_band(distance_bps: f64, config: &BandConfig) -> Band {
    if distance_bps <= config.a_max_bps {
        Band::A
    } else if distance_bps <= config.b_max_bps {
        Band::B
    } else if distance_bps <= config.c_max_bps {
        Band::C
    } else {
        Band::Out
    }
}

pub fn get_points_multiplier(distance_bps: f64, config: &BandConfig) -> f64 {
    get_band(distance_bps, config).points_multiplier()
}

/// `clamp(max(tick_bps*2, spread*spread_factor, vol*vol_factor), min, max)`.
pub fn calculate_dynamic_distance(
    tick_bps: f64,
    spread_bps: f64,
    volatility_bps: f64,
    config: &DynamicDistanceConfig,
) -> f64 {
    let raw = (tick_bps * 2.0)
        .max(spread_bps * config.spread_factor)
        .max(volatility_bps * config.volatility_factor);
    raw.clamp(config.min_bps, config.max_bps)
}

/// Per-order rebalance predicate: `true` iff the order's current band is not
/// A. The near-boundary condition is informational only — evaluating it here
/// would reintroduce the churn the prior implementation had to be fixed for.
pub fn needs_rebalance(reference_price: f64, order_price: f64, config: &BandConfig) -> bool {
    get_band(distance_bps(reference_price, order_price), config) != Band::A
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_zero_is_band_a() {
        let config = BandConfig::default();
        assert_eq!(get_band(0.0, &config), Band::A);
    }

    #[test]
    fn band_upper_bounds_are_inclusive_to_the_narrower_band() {
        let config = BandConfig::default();
        assert_eq!(get_band(10.0, &config), Band::A);
        assert_eq!(get_band(30.0, &config), Band::B);
        assert_eq!(get_band(100.0, &config), Band::C);
        assert_eq!(get_band(100.01, &config), Band::Out);
    }

    #[test]
    fn needs_rebalance_is_false_only_inside_band_a() {
        let config = BandConfig::default();
        assert!(!needs_rebalance(50000.0, 50000.0 * 1.0005, &config)); // 5 bps -> A
        assert!(needs_rebalance(50000.0, 50000.0 * 1.0025, &config)); // 25 bps -> B
    }

    #[test]
    fn near_boundary_distance_does_not_force_rebalance() {
        // 9.2 bps is informational only per §4.5 — still Band A.
        let config = BandConfig::default();
        let reference_price = 50000.0;
        let order_price = reference_price * (1.0 + 9.2 / 10_000.0);
        assert!(!needs_rebalance(reference_price, order_price, &config));
    }

    #[test]
    fn dynamic_distance_is_clamped() {
        let config = DynamicDistanceConfig::default();
        let too_low = calculate_dynamic_distance(0.1, 1.0, 1.0, &config);
        assert_eq!(too_low, config.min_bps);

        let too_high = calculate_dynamic_distance(0.1, 100.0, 100.0, &config);
        assert_eq!(too_high, config.max_bps);
    }

    #[test]
    fn points_multiplier_matches_band() {
        assert_eq!(Band::A.points_multiplier(), 1.0);
        assert_eq!(Band::B.points_multiplier(), 0.5);
        assert_eq!(Band::C.points_multiplier(), 0.1);
        assert_eq!(Band::Out.points_multiplier(), 0.0);
    }
}
