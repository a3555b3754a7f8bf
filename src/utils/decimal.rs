//! Decimal arithmetic utilities for financial calculations.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Calculate basis points (1 bp = 0.01%)
pub fn to_basis_points(rate: Decimal) -> Decimal {
    rate * dec!(10000)
}

/// Convert basis points to decimal rate
pub fn from_basis_points(bps: Decimal) -> Decimal {
    bps / dec!(10000)
}

/// Relative deviation of `observed` from `reference`, as a fraction.
/// Zero reference yields zero.
pub fn relative_deviation(observed: Decimal, reference: Decimal) -> Decimal {
    if reference == Decimal::ZERO {
        return Decimal::ZERO;
    }
    ((observed - reference) / reference).abs()
}

/// Imbalance between two notionals as a fraction of the larger one.
/// Both zero yields zero.
pub fn imbalance_pct(a: Decimal, b: Decimal) -> Decimal {
    let larger = a.abs().max(b.abs());
    if larger == Decimal::ZERO {
        return Decimal::ZERO;
    }
    (a.abs() - b.abs()).abs() / larger
}
