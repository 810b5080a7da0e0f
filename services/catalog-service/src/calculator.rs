// =============================================================================
// CALCULATOR MODULE
// =============================================================================
// Derived (read-only) product fields: final price, commission, tax, margin,
// margin %, total stock and volume.
//
// NOTES:
// - Everything here is a pure function of the stored inputs; nothing is
//   persisted, so a stale value can never shadow a fresh one
// - "Unset" is None, never 0. A derived value that cannot be computed is
//   simply None and renders as an empty cell / JSON null
// - The calculator does not clamp the seller discount; write paths refuse
//   out-of-range values before they are stored (Product::validate)
// =============================================================================

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::models::Product;

// =============================================================================
// PRICE PRECEDENCE
// =============================================================================
// An import can record a final price verbatim (`price_final_literal`) for a
// product that has no list price. This decides which value wins when both a
// literal and a computable price exist.
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PricePrecedence {
    /// A computable `price_src` wins; the literal is only a fallback
    #[default]
    Computed,
    /// A stored literal always wins
    Literal,
}

impl fmt::Display for PricePrecedence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PricePrecedence::Computed => f.write_str("computed"),
            PricePrecedence::Literal => f.write_str("literal"),
        }
    }
}

impl FromStr for PricePrecedence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "computed" => Ok(PricePrecedence::Computed),
            "literal" => Ok(PricePrecedence::Literal),
            other => Err(format!(
                "unknown price precedence '{other}', expected 'computed' or 'literal'"
            )),
        }
    }
}

// =============================================================================
// DERIVED FIELDS
// =============================================================================
/// Snapshot of the read-only fields of one product.
///
/// # Example
/// ```
/// let derived = DerivedFields::compute(&product, PricePrecedence::Computed);
/// if let Some(margin) = derived.margin { println!("margin: {margin}"); }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct DerivedFields {
    /// Explicit volume, or package L*W*H / 1000
    pub volume_l: Option<f64>,
    /// stock_wb + stock_seller, unset operands count as 0
    pub stock_total: i64,
    pub price_final: Option<f64>,
    pub commission: Option<f64>,
    pub tax: Option<f64>,
    pub margin: Option<f64>,
    pub margin_percent: Option<f64>,
}

impl DerivedFields {
    /// Compute every derived field of `product`.
    ///
    /// Calling this twice on identical inputs yields bit-identical output:
    /// the operations and their order are fixed.
    pub fn compute(product: &Product, precedence: PricePrecedence) -> Self {
        let price_final = price_final(product, precedence);
        let commission = percent_of(price_final, product.custom_data.commission_pct);
        let tax = percent_of(price_final, product.custom_data.tax_pct);
        let margin = margin(
            price_final,
            &[
                product.product_cost,
                product.shipping_cost,
                product.logistics_back_cost,
                product.warehouse_coeff,
                commission,
                tax,
            ],
        );

        Self {
            volume_l: volume_l(product),
            stock_total: stock_total(product.stock_wb, product.stock_seller),
            price_final,
            commission,
            tax,
            margin,
            margin_percent: margin_percent(margin, product.product_cost),
        }
    }
}

// -----------------------------------------------------------------------------
// INDIVIDUAL RULES
// -----------------------------------------------------------------------------

/// Explicit `volume_l`, else the package volume in litres.
/// Any missing dimension leaves the volume unset.
pub fn volume_l(product: &Product) -> Option<f64> {
    if product.volume_l.is_some() {
        return product.volume_l;
    }
    match (product.package_l_cm, product.package_w_cm, product.package_h_cm) {
        (Some(l), Some(w), Some(h)) => Some(l * w * h / 1000.0),
        _ => None,
    }
}

pub fn stock_total(stock_wb: Option<i32>, stock_seller: Option<i32>) -> i64 {
    i64::from(stock_wb.unwrap_or(0)) + i64::from(stock_seller.unwrap_or(0))
}

/// `price_src * (1 - discount / 100)`; unset discount means no discount.
fn computed_price(product: &Product) -> Option<f64> {
    let discount = product.seller_discount_pct.unwrap_or(0.0);
    product
        .price_src
        .map(|price| price * (1.0 - discount / 100.0))
}

/// Final price under the configured precedence between the computed value
/// and an imported literal.
pub fn price_final(product: &Product, precedence: PricePrecedence) -> Option<f64> {
    match precedence {
        PricePrecedence::Computed => computed_price(product).or(product.price_final_literal),
        PricePrecedence::Literal => product.price_final_literal.or_else(|| computed_price(product)),
    }
}

/// `base * pct / 100`, unset when either side is unset
pub fn percent_of(base: Option<f64>, pct: Option<f64>) -> Option<f64> {
    match (base, pct) {
        (Some(base), Some(pct)) => Some(base * pct / 100.0),
        _ => None,
    }
}

/// Final price minus every cost term. Unset terms count as 0 for this sum
/// only; the margin is unset only when the price is.
pub fn margin(price_final: Option<f64>, costs: &[Option<f64>]) -> Option<f64> {
    price_final.map(|price| {
        costs
            .iter()
            .fold(price, |acc, cost| acc - cost.unwrap_or(0.0))
    })
}

/// Margin relative to product cost, in percent. Unset when the cost is unset
/// or zero.
pub fn margin_percent(margin: Option<f64>, product_cost: Option<f64>) -> Option<f64> {
    let cost = product_cost.filter(|cost| *cost != 0.0)?;
    margin.map(|margin| margin * 100.0 / cost)
}
