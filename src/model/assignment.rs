//! Learned product → master associations.

use jiff::Timestamp;
use serde::{Deserialize, Deserializer, Serialize};

/// Confidence given to a brand-new association.
pub const INITIAL_CONFIDENCE: f64 = 0.3;

/// Confidence gained per repeated confirmation.
pub const CONFIDENCE_STEP: f64 = 0.1;

/// A product code as part of a product key: blank reads as no code.
pub fn normalize_code(code: Option<&str>) -> Option<&str> {
    code.filter(|c| !c.trim().is_empty())
}

/// Deserializes an optional product code, reading a blank one as `None`.
pub(crate) fn deserialize_code<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let code = Option::<String>::deserialize(deserializer)?;
    Ok(code.filter(|c| !c.trim().is_empty()))
}

/// A remembered "this master handles this product" record.
///
/// Keyed by product name plus the presence and value of the product code:
/// a record without a code never matches a lookup with one, and vice versa.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterAssignment {
    pub product_name: String,
    #[serde(
        default,
        deserialize_with = "deserialize_code",
        skip_serializing_if = "Option::is_none"
    )]
    pub product_code: Option<String>,
    pub master_name: String,
    /// In `[0, 1]`.
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_assigned_time: Option<Timestamp>,
}

impl MasterAssignment {
    /// Whether this record is the one for the given product key.
    pub fn matches_key(&self, product_name: &str, product_code: Option<&str>) -> bool {
        self.product_name == product_name
            && normalize_code(self.product_code.as_deref()) == normalize_code(product_code)
    }

    /// `name(code)` when coded, the bare name otherwise.
    pub fn product_label(&self) -> String {
        match &self.product_code {
            Some(code) => format!("{}({code})", self.product_name),
            None => self.product_name.clone(),
        }
    }
}

/// Confidence after `count` confirmations (the first one included).
pub fn confidence_for_count(count: i64) -> f64 {
    let steps = (count.max(1) - 1) as f64;
    (INITIAL_CONFIDENCE + steps * CONFIDENCE_STEP).min(1.0)
}

/// Inverse of [`confidence_for_count`], rounding to the nearest confirmation.
#[allow(clippy::cast_possible_truncation)]
pub fn count_for_confidence(confidence: f64) -> i64 {
    let steps = ((confidence - INITIAL_CONFIDENCE) / CONFIDENCE_STEP).round();
    1 + steps.max(0.0) as i64
}
