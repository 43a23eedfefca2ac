// Sanity guards for conversion rates coming from providers or caches.

use rust_decimal::Decimal;

/// Plausible band for the coin/display-currency rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBand {
    pub min: Decimal,
    pub max: Decimal,
}

impl RateBand {
    pub fn new(min: Decimal, max: Decimal) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, rate: Decimal) -> bool {
        rate > Decimal::ZERO && rate >= self.min && rate <= self.max
    }
}

// Internal helper that validates a decimal rate.
pub fn sanitize_rate(rate: Decimal, band: &RateBand) -> Option<Decimal> {
    band.contains(rate).then_some(rate)
}
