//! Line items: billable rows owned by exactly one invoice.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use billflow_core::{DomainError, DomainResult, InvoiceId, LineItemId, Metadata};

use crate::calculator::{LineAmounts, calculate_amounts};

/// Caller-supplied values of a new line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItemInput {
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    /// Percentage, 0–100.
    pub tax_rate: Decimal,
    #[serde(default)]
    pub tax_included: bool,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Partial update of a line item. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineItemPatch {
    pub description: Option<String>,
    pub quantity: Option<Decimal>,
    pub unit_price: Option<Decimal>,
    pub tax_rate: Option<Decimal>,
    pub tax_included: Option<bool>,
    pub metadata: Option<Metadata>,
}

impl LineItemPatch {
    pub fn is_empty(&self) -> bool {
        self.description.is_none()
            && self.quantity.is_none()
            && self.unit_price.is_none()
            && self.tax_rate.is_none()
            && self.tax_included.is_none()
            && self.metadata.is_none()
    }
}

/// Largest accepted quantity on one line.
pub const MAX_QUANTITY: Decimal = Decimal::from_parts(1_000_000, 0, 0, false, 0);
/// Largest accepted unit price on one line.
pub const MAX_UNIT_PRICE: Decimal = Decimal::from_parts(1_000_000_000, 0, 0, false, 0);
/// Decimal places accepted on quantity and unit price.
pub const MAX_INPUT_SCALE: u32 = 4;
/// Decimal places accepted on the tax rate.
pub const MAX_TAX_RATE_SCALE: u32 = 2;

/// Range and precision checks on the inputs of [`calculate_amounts`].
///
/// The bounds keep every line's `amount`, `tax_amount` and `total` below
/// 10^16 and every input at the precision the store keeps.
pub fn validate_line_values(
    description: &str,
    quantity: Decimal,
    unit_price: Decimal,
    tax_rate: Decimal,
) -> DomainResult<()> {
    if description.trim().is_empty() {
        return Err(DomainError::validation("description must not be empty"));
    }
    if quantity <= Decimal::ZERO {
        return Err(DomainError::validation("quantity must be positive"));
    }
    if quantity > MAX_QUANTITY {
        return Err(DomainError::validation(format!(
            "quantity must not exceed {MAX_QUANTITY}"
        )));
    }
    check_scale("quantity", quantity, MAX_INPUT_SCALE)?;
    if unit_price <= Decimal::ZERO {
        return Err(DomainError::validation("unit_price must be positive"));
    }
    if unit_price > MAX_UNIT_PRICE {
        return Err(DomainError::validation(format!(
            "unit_price must not exceed {MAX_UNIT_PRICE}"
        )));
    }
    check_scale("unit_price", unit_price, MAX_INPUT_SCALE)?;
    if tax_rate < Decimal::ZERO || tax_rate > Decimal::ONE_HUNDRED {
        return Err(DomainError::validation("tax_rate must be between 0 and 100"));
    }
    check_scale("tax_rate", tax_rate, MAX_TAX_RATE_SCALE)?;
    Ok(())
}

fn check_scale(field: &str, value: Decimal, max_scale: u32) -> DomainResult<()> {
    if value.normalize().scale() > max_scale {
        return Err(DomainError::validation(format!(
            "{field} must have at most {max_scale} decimal places"
        )));
    }
    Ok(())
}

/// A line on an invoice.
///
/// `amount`, `tax_amount` and `total` are derived and private: they are
/// recomputed whenever an input changes and never set directly.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineItem {
    id: LineItemId,
    invoice_id: InvoiceId,
    description: String,
    quantity: Decimal,
    unit_price: Decimal,
    tax_rate: Decimal,
    tax_included: bool,
    amount: Decimal,
    tax_amount: Decimal,
    total: Decimal,
    line_order: u32,
    metadata: Metadata,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

/// Raw stored columns of a line item, used to rehydrate from storage.
#[derive(Debug, Clone)]
pub struct LineItemRecord {
    pub id: LineItemId,
    pub invoice_id: InvoiceId,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub tax_rate: Decimal,
    pub tax_included: bool,
    pub line_order: u32,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl LineItem {
    /// Validate the input and build a line with freshly computed amounts.
    pub fn create(
        id: LineItemId,
        invoice_id: InvoiceId,
        input: LineItemInput,
        line_order: u32,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        validate_line_values(
            &input.description,
            input.quantity,
            input.unit_price,
            input.tax_rate,
        )?;

        let amounts = calculate_amounts(
            input.quantity,
            input.unit_price,
            input.tax_rate,
            input.tax_included,
        )?;

        Ok(Self {
            id,
            invoice_id,
            description: input.description.trim().to_string(),
            quantity: input.quantity,
            unit_price: input.unit_price,
            tax_rate: input.tax_rate,
            tax_included: input.tax_included,
            amount: amounts.amount,
            tax_amount: amounts.tax_amount,
            total: amounts.total,
            line_order,
            metadata: input.metadata,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }

    /// Rebuild from stored columns. Amounts are recomputed rather than trusted.
    pub fn restore(record: LineItemRecord) -> DomainResult<Self> {
        let amounts = calculate_amounts(
            record.quantity,
            record.unit_price,
            record.tax_rate,
            record.tax_included,
        )?;
        Ok(Self {
            id: record.id,
            invoice_id: record.invoice_id,
            description: record.description,
            quantity: record.quantity,
            unit_price: record.unit_price,
            tax_rate: record.tax_rate,
            tax_included: record.tax_included,
            amount: amounts.amount,
            tax_amount: amounts.tax_amount,
            total: amounts.total,
            line_order: record.line_order,
            metadata: record.metadata,
            created_at: record.created_at,
            updated_at: record.updated_at,
            deleted_at: record.deleted_at,
        })
    }

    /// Apply a patch, re-validate, and recompute the derived amounts.
    ///
    /// On error the item is left unchanged.
    pub fn apply_patch(&mut self, patch: LineItemPatch, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.is_active() {
            return Err(DomainError::not_found(format!("line item {}", self.id)));
        }

        let description = patch
            .description
            .map(|d| d.trim().to_string())
            .unwrap_or_else(|| self.description.clone());
        let quantity = patch.quantity.unwrap_or(self.quantity);
        let unit_price = patch.unit_price.unwrap_or(self.unit_price);
        let tax_rate = patch.tax_rate.unwrap_or(self.tax_rate);
        let tax_included = patch.tax_included.unwrap_or(self.tax_included);

        validate_line_values(&description, quantity, unit_price, tax_rate)?;

        let amounts = calculate_amounts(quantity, unit_price, tax_rate, tax_included)?;
        self.description = description;
        self.quantity = quantity;
        self.unit_price = unit_price;
        self.tax_rate = tax_rate;
        self.tax_included = tax_included;
        self.set_amounts(amounts);
        if let Some(metadata) = patch.metadata {
            self.metadata = metadata;
        }
        self.updated_at = now;
        Ok(())
    }

    /// Mark as removed. The line keeps its order; it just stops counting.
    pub fn soft_delete(&mut self, now: DateTime<Utc>) {
        if self.deleted_at.is_none() {
            self.deleted_at = Some(now);
            self.updated_at = now;
        }
    }

    fn set_amounts(&mut self, amounts: LineAmounts) {
        self.amount = amounts.amount;
        self.tax_amount = amounts.tax_amount;
        self.total = amounts.total;
    }

    pub fn id(&self) -> LineItemId {
        self.id
    }

    pub fn invoice_id(&self) -> InvoiceId {
        self.invoice_id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn quantity(&self) -> Decimal {
        self.quantity
    }

    pub fn unit_price(&self) -> Decimal {
        self.unit_price
    }

    pub fn tax_rate(&self) -> Decimal {
        self.tax_rate
    }

    pub fn tax_included(&self) -> bool {
        self.tax_included
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn tax_amount(&self) -> Decimal {
        self.tax_amount
    }

    pub fn total(&self) -> Decimal {
        self.total
    }

    pub fn line_order(&self) -> u32 {
        self.line_order
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// Order for the next line on an invoice: one past the highest order ever
/// used (deleted lines included), or 0 for the first line.
pub fn next_line_order<'a, I>(existing: I) -> u32
where
    I: IntoIterator<Item = &'a LineItem>,
{
    existing
        .into_iter()
        .map(|i| i.line_order)
        .max()
        .map(|max| max + 1)
        .unwrap_or(0)
}
