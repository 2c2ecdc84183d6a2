//! Builders for the legacy records system's native tables.

use serde_json::json;

use clinsync_core::{LedgerEntry, Operation};

use super::{date_part, BuildError, DeliveryPayload, PayloadBuilder, Snapshot};

pub const PATIENT_TABLE: &str = "patient_data";
pub const ENCOUNTER_TABLE: &str = "form_encounter";
pub const ORDER_TABLE: &str = "procedure_order";

/// `patient_data` row from a patient snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyPatientBuilder;

impl PayloadBuilder for LegacyPatientBuilder {
    fn build(&self, entry: &LedgerEntry) -> Result<DeliveryPayload, BuildError> {
        let s = Snapshot::of(entry)?;
        let patient_id = s.required("patient_id")?;

        let (street, city, state) = split_address(s.optional("address").unwrap_or_default());
        let phone = s.optional("phone").unwrap_or_default();

        Ok(DeliveryPayload {
            resource: PATIENT_TABLE,
            external_key: patient_id.to_string(),
            body: json!({
                "pubpid": patient_id,
                "fname": s.required("given_name")?,
                "lname": s.required("family_name")?,
                "DOB": s.optional("birth_date"),
                "sex": capitalize(s.optional("gender").unwrap_or("unknown")),
                "street": street,
                "city": city,
                "state": state,
                "phone_home": phone,
                "phone_cell": phone,
                "email": s.optional("email").unwrap_or_default(),
                "status": record_status(entry.operation),
            }),
        })
    }
}

/// `form_encounter` row from an encounter snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyEncounterBuilder;

impl PayloadBuilder for LegacyEncounterBuilder {
    fn build(&self, entry: &LedgerEntry) -> Result<DeliveryPayload, BuildError> {
        let s = Snapshot::of(entry)?;
        let encounter_id = s.required("encounter_id")?;
        let class = s.required("encounter_class")?;

        Ok(DeliveryPayload {
            resource: ENCOUNTER_TABLE,
            external_key: encounter_id.to_string(),
            body: json!({
                "external_id": encounter_id,
                "pubpid": s.required("patient_id")?,
                "date": s.required("started_at")?,
                "date_end": s.optional("ended_at"),
                "reason": s.optional("chief_complaint").unwrap_or_default(),
                "class_code": act_code(class)?,
                "provider": s.optional("attending_doctor").unwrap_or_default(),
                "status": record_status(entry.operation),
            }),
        })
    }
}

/// `procedure_order` row from an order snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyOrderBuilder;

impl PayloadBuilder for LegacyOrderBuilder {
    fn build(&self, entry: &LedgerEntry) -> Result<DeliveryPayload, BuildError> {
        let s = Snapshot::of(entry)?;
        let order_id = s.required("order_id")?;
        let status = if entry.operation == Operation::Delete {
            "canceled"
        } else {
            s.required("status")?
        };

        Ok(DeliveryPayload {
            resource: ORDER_TABLE,
            external_key: order_id.to_string(),
            body: json!({
                "control_id": order_id,
                "pubpid": s.required("patient_id")?,
                "encounter_ref": s.optional("encounter_id"),
                "procedure_order_type": s.required("order_type")?,
                "procedure_code": s.required("code")?,
                "procedure_name": s.optional("display").unwrap_or_default(),
                "order_priority": s.optional("urgency").unwrap_or("routine"),
                "order_status": status,
                "date_ordered": date_part(s.required("ordered_at")?),
            }),
        })
    }
}

fn record_status(operation: Operation) -> &'static str {
    match operation {
        Operation::Delete => "inactive",
        Operation::Create | Operation::Update => "active",
    }
}

/// `street, city, state`; missing parts are empty.
fn split_address(address: &str) -> (String, String, String) {
    let mut parts = address.split(',').map(|p| p.trim().to_string());
    (
        parts.next().unwrap_or_default(),
        parts.next().unwrap_or_default(),
        parts.next().unwrap_or_default(),
    )
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// HL7 v3 ActCode for an encounter class.
pub(crate) fn act_code(class: &str) -> Result<&'static str, BuildError> {
    match class {
        "outpatient" | "ambulatory" => Ok("AMB"),
        "inpatient" => Ok("IMP"),
        "emergency" => Ok("EMER"),
        other => Err(BuildError::InvalidField {
            field: "encounter_class",
            reason: format!("unsupported encounter class `{other}`"),
        }),
    }
}
