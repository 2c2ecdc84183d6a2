//! Syncable domain snapshots.
//!
//! The clinical write layer owns the real entities; all this subsystem needs
//! from them is an identity, a serializable snapshot taken at enqueue time and
//! the list of systems of record that must receive it.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::ledger::{EntityType, NewLedgerEntry, TargetSystem};

/// A domain entity whose writes are propagated to external systems.
pub trait Syncable {
    fn entity_type(&self) -> EntityType;

    fn entity_id(&self) -> String;

    /// Serialized snapshot captured at enqueue time.
    fn snapshot(&self) -> JsonValue;

    /// Systems of record that must receive every write of this entity.
    fn targets(&self) -> Vec<TargetSystem> {
        TargetSystem::ALL.to_vec()
    }

    /// Sweep priority (lower = earlier).
    fn priority(&self) -> i32 {
        NewLedgerEntry::DEFAULT_PRIORITY
    }
}

/// Patient demographics as written by the clinical layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientSnapshot {
    /// Local identifier, e.g. `P-2025-000123`
    pub patient_id: String,
    pub given_name: String,
    pub family_name: String,
    pub birth_date: Option<NaiveDate>,
    /// `male`, `female`, `other` or `unknown`
    pub gender: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    /// Free-form, comma separated: `street, city, state`
    pub address: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A clinical encounter (visit).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncounterSnapshot {
    pub encounter_id: String,
    pub patient_id: String,
    /// `outpatient`, `inpatient` or `emergency`
    pub encounter_class: String,
    pub status: String,
    pub chief_complaint: Option<String>,
    pub attending_doctor: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// A clinical order (lab, imaging, medication...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub order_id: String,
    pub patient_id: String,
    pub encounter_id: Option<String>,
    pub order_type: String,
    pub code: String,
    pub display: Option<String>,
    /// `routine`, `urgent` or `stat`
    pub urgency: String,
    pub status: String,
    pub ordered_at: DateTime<Utc>,
}

impl Syncable for PatientSnapshot {
    fn entity_type(&self) -> EntityType {
        EntityType::Patient
    }

    fn entity_id(&self) -> String {
        self.patient_id.clone()
    }

    fn snapshot(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

impl Syncable for EncounterSnapshot {
    fn entity_type(&self) -> EntityType {
        EntityType::Encounter
    }

    fn entity_id(&self) -> String {
        self.encounter_id.clone()
    }

    fn snapshot(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

impl Syncable for OrderSnapshot {
    fn entity_type(&self) -> EntityType {
        EntityType::Order
    }

    fn entity_id(&self) -> String {
        self.order_id.clone()
    }

    fn snapshot(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }

    fn priority(&self) -> i32 {
        match self.urgency.as_str() {
            "stat" => 1,
            "urgent" => 3,
            _ => NewLedgerEntry::DEFAULT_PRIORITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(urgency: &str) -> OrderSnapshot {
        OrderSnapshot {
            order_id: "O-1".into(),
            patient_id: "P-1".into(),
            encounter_id: None,
            order_type: "lab".into(),
            code: "2345-7".into(),
            display: Some("Glucose".into()),
            urgency: urgency.into(),
            status: "active".into(),
            ordered_at: Utc::now(),
        }
    }

    #[test]
    fn stat_orders_jump_the_queue() {
        assert_eq!(order("stat").priority(), 1);
        assert_eq!(order("urgent").priority(), 3);
        assert_eq!(order("routine").priority(), NewLedgerEntry::DEFAULT_PRIORITY);
    }

    #[test]
    fn patient_snapshot_fans_out_to_every_target() {
        let p = PatientSnapshot {
            patient_id: "P-1".into(),
            given_name: "Ada".into(),
            family_name: "Lovelace".into(),
            birth_date: NaiveDate::from_ymd_opt(1815, 12, 10),
            gender: Some("female".into()),
            phone: None,
            email: None,
            address: None,
            updated_at: Utc::now(),
        };

        assert_eq!(p.entity_type(), EntityType::Patient);
        assert_eq!(p.entity_id(), "P-1");
        assert_eq!(p.targets(), vec![TargetSystem::LegacyEmr, TargetSystem::FhirServer]);
        assert_eq!(p.snapshot()["family_name"], "Lovelace");
    }
}
