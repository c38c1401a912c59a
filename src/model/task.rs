//! Task types: the schedulable unit of workshop work.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Worker name for a task nobody has picked up yet.
pub const UNASSIGNED: &str = "unassigned";

/// Sentinel written by older installations; read as [`UNASSIGNED`].
pub const LEGACY_UNASSIGNED: &str = "待分配";

/// Priority at or above which a task is urgent.
pub const URGENT_PRIORITY: i64 = 8;

/// Whether a worker name means "nobody".
pub fn is_unassigned(master_name: &str) -> bool {
    let name = master_name.trim();
    name.is_empty() || name == UNASSIGNED || name == LEGACY_UNASSIGNED
}

/// A work order assigned (or not yet) to a workshop master.
///
/// Dates are kept as the free-form strings the workshop enters; they are
/// compared lexically and never parsed by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub product_name: String,
    /// A blank code reads as no code.
    #[serde(
        default,
        deserialize_with = "super::assignment::deserialize_code",
        skip_serializing_if = "Option::is_none"
    )]
    pub product_code: Option<String>,
    /// Raw estimate in minutes.
    pub work_hours: f64,
    pub master_name: String,
    pub batch_number: String,
    pub client_name: String,
    pub commit_time: String,
    pub status: TaskStatus,
    pub priority: i64,
    /// Difficulty multiplier; `None` reads as 1.0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coefficient: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_person: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_team: Option<String>,
}

impl Task {
    /// Coefficient with the 1.0 default applied.
    pub fn coefficient(&self) -> f64 {
        self.coefficient.unwrap_or(1.0)
    }

    /// Quantity with the default of one piece applied.
    pub fn quantity(&self) -> i64 {
        self.quantity.unwrap_or(1)
    }

    /// `work_hours × coefficient × quantity`, in minutes.
    pub fn effective_duration(&self) -> f64 {
        self.work_hours * self.coefficient() * self.quantity() as f64
    }

    pub fn is_urgent(&self) -> bool {
        self.priority >= URGENT_PRIORITY
    }

    pub fn is_unassigned(&self) -> bool {
        is_unassigned(&self.master_name)
    }

    /// Checks the fields every stored task must satisfy.
    ///
    /// Returns a one-line reason on the first violated rule.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("task id is empty".into());
        }
        if self.product_name.trim().is_empty() {
            return Err("product name is empty".into());
        }
        if !(self.work_hours.is_finite() && self.work_hours > 0.0) {
            return Err(format!("work hours must be positive, got {}", self.work_hours));
        }
        if let Some(c) = self.coefficient
            && !(c.is_finite() && c > 0.0)
        {
            return Err(format!("coefficient must be positive, got {c}"));
        }
        if let Some(q) = self.quantity
            && q <= 0
        {
            return Err(format!("quantity must be positive, got {q}"));
        }
        for (field, value) in [
            ("master name", &self.master_name),
            ("batch number", &self.batch_number),
            ("client name", &self.client_name),
            ("commit time", &self.commit_time),
        ] {
            if value.trim().is_empty() {
                return Err(format!("{field} is empty"));
            }
        }
        Ok(())
    }
}

/// Where a task stands on the board.
///
/// Any state may move to any other; the board does not enforce an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in-progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_task(id: &str) -> Task {
    Task {
        id: id.into(),
        product_name: "Valve-Body".into(),
        product_code: Some("V1".into()),
        work_hours: 120.0,
        master_name: UNASSIGNED.into(),
        batch_number: "BATCH-001".into(),
        client_name: "Plant A".into(),
        commit_time: "2025-01-13".into(),
        status: TaskStatus::Pending,
        priority: 5,
        coefficient: None,
        process_order_id: None,
        factory_code: None,
        order_date: None,
        delivery_time: None,
        quantity: None,
        assigned_person: None,
        assigned_team: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_duration_applies_defaults() {
        let mut task = sample_task("t1");
        assert!((task.effective_duration() - 120.0).abs() < f64::EPSILON);

        task.coefficient = Some(1.5);
        task.quantity = Some(2);
        assert!((task.effective_duration() - 360.0).abs() < f64::EPSILON);
    }

    #[test]
    fn validate_rejects_non_positive_hours() {
        let mut task = sample_task("t1");
        task.work_hours = 0.0;
        assert!(task.validate().is_err());

        task.work_hours = -3.0;
        assert!(task.validate().is_err());

        task.work_hours = f64::NAN;
        assert!(task.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_coefficient_and_quantity() {
        let mut task = sample_task("t1");
        task.coefficient = Some(0.0);
        assert!(task.validate().is_err());

        let mut task = sample_task("t1");
        task.quantity = Some(0);
        assert!(task.validate().is_err());
    }

    #[test]
    fn validate_rejects_blank_required_text() {
        assert!(sample_task("t1").validate().is_ok());

        let mut task = sample_task("t1");
        task.batch_number = String::new();
        assert_eq!(task.validate(), Err("batch number is empty".to_string()));

        let mut task = sample_task("t1");
        task.client_name = "  ".into();
        assert_eq!(task.validate(), Err("client name is empty".to_string()));

        let mut task = sample_task("t1");
        task.commit_time = String::new();
        assert_eq!(task.validate(), Err("commit time is empty".to_string()));
    }

    #[test]
    fn legacy_sentinel_is_unassigned() {
        assert!(is_unassigned("unassigned"));
        assert!(is_unassigned("待分配"));
        assert!(is_unassigned("  "));
        assert!(!is_unassigned("Li"));
    }

    #[test]
    fn status_serializes_kebab_case() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in-progress\"");
        assert_eq!("in-progress".parse::<TaskStatus>(), Ok(TaskStatus::InProgress));
    }

    #[test]
    fn blank_product_code_deserializes_as_none() {
        let mut json = serde_json::to_value(sample_task("t1")).unwrap();
        json["productCode"] = "".into();

        let task: Task = serde_json::from_value(json).unwrap();

        assert_eq!(task.product_code, None);
    }

    #[test]
    fn task_json_uses_camel_case_and_omits_none() {
        let task = sample_task("t1");
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["productName"], "Valve-Body");
        assert_eq!(json["masterName"], "unassigned");
        assert!(json.get("coefficient").is_none());
    }
}
