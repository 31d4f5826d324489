//! Line-item amount and invoice total arithmetic.
//!
//! Every derived money value is rounded to 2 decimal places, half away from
//! zero. Rounding happens per formula: `tax_amount` and `total` are each
//! rounded from their own inputs, so `total` is not `amount + tax_amount`
//! re-added after the fact.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use billflow_core::{DomainError, DomainResult};

use crate::line_item::LineItem;

/// Decimal places kept on every stored money amount.
pub const MONEY_SCALE: u32 = 2;

/// Round to cents, half away from zero.
pub fn round2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Derived amounts of a single line item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineAmounts {
    pub amount: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
}

/// Aggregated amounts of an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceTotals {
    pub subtotal_amount: Decimal,
    pub total_tax_amount: Decimal,
    pub total_amount: Decimal,
}

impl InvoiceTotals {
    pub fn zero() -> Self {
        Self {
            subtotal_amount: Decimal::ZERO,
            total_tax_amount: Decimal::ZERO,
            total_amount: Decimal::ZERO,
        }
    }
}

impl Default for InvoiceTotals {
    fn default() -> Self {
        Self::zero()
    }
}

/// Compute `amount`, `tax_amount` and `total` for one line.
///
/// Range checks on the inputs are the caller's job
/// (see [`crate::line_item::validate_line_values`]); this only rejects
/// results that do not fit in a `Decimal`.
pub fn calculate_amounts(
    quantity: Decimal,
    unit_price: Decimal,
    tax_rate: Decimal,
    tax_included: bool,
) -> DomainResult<LineAmounts> {
    let amount = round2(
        quantity
            .checked_mul(unit_price)
            .ok_or_else(|| out_of_range("amount"))?,
    );

    if tax_included {
        return Ok(LineAmounts {
            amount,
            tax_amount: Decimal::ZERO,
            total: amount,
        });
    }

    let tax_amount = round2(
        amount
            .checked_mul(tax_rate)
            .and_then(|v| v.checked_div(Decimal::ONE_HUNDRED))
            .ok_or_else(|| out_of_range("tax_amount"))?,
    );
    let total = round2(
        amount
            .checked_add(tax_amount)
            .ok_or_else(|| out_of_range("total"))?,
    );

    Ok(LineAmounts {
        amount,
        tax_amount,
        total,
    })
}

/// Sum the amounts of all non-deleted line items.
///
/// Soft-deleted items are skipped, so callers can pass the full item set.
pub fn calculate_invoice_totals<'a, I>(line_items: I) -> DomainResult<InvoiceTotals>
where
    I: IntoIterator<Item = &'a LineItem>,
{
    let mut subtotal = Decimal::ZERO;
    let mut tax = Decimal::ZERO;
    let mut total = Decimal::ZERO;

    for item in line_items.into_iter().filter(|i| i.is_active()) {
        subtotal = subtotal
            .checked_add(item.amount())
            .ok_or_else(|| out_of_range("subtotal_amount"))?;
        tax = tax
            .checked_add(item.tax_amount())
            .ok_or_else(|| out_of_range("total_tax_amount"))?;
        total = total
            .checked_add(item.total())
            .ok_or_else(|| out_of_range("total_amount"))?;
    }

    Ok(InvoiceTotals {
        subtotal_amount: round2(subtotal),
        total_tax_amount: round2(tax),
        total_amount: round2(total),
    })
}

fn out_of_range(field: &str) -> DomainError {
    DomainError::validation(format!("{field} is out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line_item::{LineItem, LineItemInput};
    use billflow_core::{InvoiceId, LineItemId};
    use chrono::Utc;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn item(invoice_id: InvoiceId, order: u32, qty: Decimal, price: Decimal, rate: Decimal) -> LineItem {
        LineItem::create(
            LineItemId::new(),
            invoice_id,
            LineItemInput {
                description: format!("line {order}"),
                quantity: qty,
                unit_price: price,
                tax_rate: rate,
                tax_included: false,
                metadata: Default::default(),
            },
            order,
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn whole_numbers_with_twenty_percent_tax() {
        let a = calculate_amounts(dec!(10), dec!(100), dec!(20), false).unwrap();
        assert_eq!(a.amount, dec!(1000.00));
        assert_eq!(a.tax_amount, dec!(200.00));
        assert_eq!(a.total, dec!(1200.00));
    }

    #[test]
    fn tax_is_rounded_before_total() {
        let a = calculate_amounts(dec!(3), dec!(33.33), dec!(20), false).unwrap();
        assert_eq!(a.amount, dec!(99.99));
        assert_eq!(a.tax_amount, dec!(20.00));
        assert_eq!(a.total, dec!(119.99));
    }

    #[test]
    fn tax_included_line_carries_no_tax() {
        let a = calculate_amounts(dec!(2), dec!(59.99), dec!(21), true).unwrap();
        assert_eq!(a.amount, dec!(119.98));
        assert_eq!(a.tax_amount, Decimal::ZERO);
        assert_eq!(a.total, a.amount);
    }

    #[test]
    fn midpoint_rounds_away_from_zero() {
        // 0.5 * 0.05 = 0.025
        let a = calculate_amounts(dec!(0.5), dec!(0.05), dec!(0), false).unwrap();
        assert_eq!(a.amount, dec!(0.03));
    }

    #[test]
    fn product_beyond_decimal_range_is_a_value_error() {
        let err = calculate_amounts(Decimal::MAX, dec!(2), dec!(20), false).unwrap_err();
        assert_eq!(err, DomainError::validation("amount is out of range"));
    }

    #[test]
    fn tax_beyond_decimal_range_is_a_value_error() {
        // 1e14 * 1e14 still fits; the 20% tax on it does not.
        let big = Decimal::from(100_000_000_000_000i64);
        let err = calculate_amounts(big, big, dec!(20), false).unwrap_err();
        assert_eq!(err, DomainError::validation("tax_amount is out of range"));

        let included = calculate_amounts(big, big, dec!(20), true).unwrap();
        assert_eq!(included.total, big * big);
    }

    #[test]
    fn empty_invoice_has_zero_totals() {
        let totals = calculate_invoice_totals(std::iter::empty()).unwrap();
        assert_eq!(totals, InvoiceTotals::zero());
    }

    #[test]
    fn totals_sum_lines_and_skip_deleted() {
        let invoice_id = InvoiceId::new();
        let a = item(invoice_id, 0, dec!(5), dec!(100), dec!(20));
        let b = item(invoice_id, 1, dec!(3), dec!(200), dec!(20));
        let mut c = item(invoice_id, 2, dec!(1), dec!(999), dec!(20));
        c.soft_delete(Utc::now());

        let items = vec![a, b, c];
        let totals = calculate_invoice_totals(&items).unwrap();
        assert_eq!(totals.subtotal_amount, dec!(1100.00));
        assert_eq!(totals.total_tax_amount, dec!(220.00));
        assert_eq!(totals.total_amount, dec!(1320.00));

        // Same input, same output.
        assert_eq!(calculate_invoice_totals(&items).unwrap(), totals);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: total is rebuilt from independently rounded parts,
        /// never from a single final rounding.
        #[test]
        fn total_follows_per_formula_rounding(
            qty_milli in 1i64..10_000_000i64,
            price_cents in 1i64..10_000_000i64,
            rate_bp in 0i64..=10_000i64,
        ) {
            let q = Decimal::new(qty_milli, 3);
            let p = Decimal::new(price_cents, 2);
            let r = Decimal::new(rate_bp, 2);

            let a = calculate_amounts(q, p, r, false).unwrap();
            let amount = round2(q * p);
            let expected = round2(amount + round2(amount * r / Decimal::ONE_HUNDRED));
            prop_assert_eq!(a.amount, amount);
            prop_assert_eq!(a.total, expected);
        }

        /// Property: tax-included lines never carry tax.
        #[test]
        fn tax_included_total_equals_amount(
            qty_milli in 1i64..10_000_000i64,
            price_cents in 1i64..10_000_000i64,
            rate_bp in 0i64..=10_000i64,
        ) {
            let a = calculate_amounts(
                Decimal::new(qty_milli, 3),
                Decimal::new(price_cents, 2),
                Decimal::new(rate_bp, 2),
                true,
            ).unwrap();
            prop_assert_eq!(a.tax_amount, Decimal::ZERO);
            prop_assert_eq!(a.total, a.amount);
        }

        /// Property: every derived amount has at most two decimal places.
        #[test]
        fn amounts_are_kept_at_cent_precision(
            qty_milli in 1i64..10_000_000i64,
            price_milli in 1i64..10_000_000i64,
            rate_bp in 0i64..=10_000i64,
        ) {
            let a = calculate_amounts(
                Decimal::new(qty_milli, 3),
                Decimal::new(price_milli, 3),
                Decimal::new(rate_bp, 2),
                false,
            ).unwrap();
            prop_assert!(a.amount.scale() <= MONEY_SCALE);
            prop_assert!(a.tax_amount.scale() <= MONEY_SCALE);
            prop_assert!(a.total.scale() <= MONEY_SCALE);
        }
    }
}
