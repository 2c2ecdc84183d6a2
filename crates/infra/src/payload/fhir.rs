//! Builders for FHIR R4 resources.
//!
//! Resources never carry a server id: the adapter adds it when it already
//! knows one. Cross-resource references use logical identifiers so they stay
//! valid before the referenced resource has been delivered.

use serde_json::{json, Map, Value as JsonValue};

use clinsync_core::{LedgerEntry, Operation};

use super::legacy::act_code;
use super::{BuildError, DeliveryPayload, PayloadBuilder, Snapshot};

const ACT_CODE_SYSTEM: &str = "http://terminology.hl7.org/CodeSystem/v3-ActCode";

fn identifier(system: &str, value: &str) -> JsonValue {
    json!([{ "use": "official", "system": system, "value": value }])
}

fn reference(resource: &str, system: &str, value: &str) -> JsonValue {
    json!({
        "type": resource,
        "identifier": { "system": system, "value": value }
    })
}

/// Drop `null` members so the server never sees explicit nulls.
fn compact(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(fields) => JsonValue::Object(
            fields
                .into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, compact(v)))
                .collect::<Map<_, _>>(),
        ),
        JsonValue::Array(items) => JsonValue::Array(items.into_iter().map(compact).collect()),
        other => other,
    }
}

#[derive(Debug, Clone)]
pub struct FhirPatientBuilder {
    identifier_system: String,
}

impl FhirPatientBuilder {
    pub fn new(identifier_system: impl Into<String>) -> Self {
        Self {
            identifier_system: identifier_system.into(),
        }
    }
}

impl PayloadBuilder for FhirPatientBuilder {
    fn build(&self, entry: &LedgerEntry) -> Result<DeliveryPayload, BuildError> {
        let s = Snapshot::of(entry)?;
        let patient_id = s.required("patient_id")?;
        let given = s.required("given_name")?;
        let family = s.required("family_name")?;

        let gender = match s.optional("gender") {
            None => "unknown",
            Some(g @ ("male" | "female" | "other" | "unknown")) => g,
            Some(other) => {
                return Err(BuildError::InvalidField {
                    field: "gender",
                    reason: format!("unsupported gender `{other}`"),
                });
            }
        };

        let mut telecom = Vec::new();
        if let Some(phone) = s.optional("phone") {
            telecom.push(json!({ "system": "phone", "value": phone, "use": "mobile" }));
        }
        if let Some(email) = s.optional("email") {
            telecom.push(json!({ "system": "email", "value": email }));
        }

        let address = s.optional("address").map(|text| json!([{ "text": text }]));

        Ok(DeliveryPayload {
            resource: "Patient",
            external_key: patient_id.to_string(),
            body: compact(json!({
                "resourceType": "Patient",
                "identifier": identifier(&self.identifier_system, patient_id),
                "active": entry.operation != Operation::Delete,
                "name": [{
                    "use": "official",
                    "family": family,
                    "given": [given],
                    "text": format!("{family} {given}"),
                }],
                "gender": gender,
                "birthDate": s.optional("birth_date"),
                "telecom": telecom,
                "address": address,
            })),
        })
    }
}

#[derive(Debug, Clone)]
pub struct FhirEncounterBuilder {
    identifier_system: String,
}

impl FhirEncounterBuilder {
    pub fn new(identifier_system: impl Into<String>) -> Self {
        Self {
            identifier_system: identifier_system.into(),
        }
    }
}

impl PayloadBuilder for FhirEncounterBuilder {
    fn build(&self, entry: &LedgerEntry) -> Result<DeliveryPayload, BuildError> {
        let s = Snapshot::of(entry)?;
        let encounter_id = s.required("encounter_id")?;
        let class = act_code(s.required("encounter_class")?)?;

        let status = match (entry.operation, s.required("status")?) {
            (Operation::Delete, _) => "cancelled",
            (_, "scheduled" | "planned") => "planned",
            (_, "in-progress" | "in_progress" | "active") => "in-progress",
            (_, "completed" | "finished") => "finished",
            (_, "cancelled" | "canceled") => "cancelled",
            (_, other) => {
                return Err(BuildError::InvalidField {
                    field: "status",
                    reason: format!("unsupported encounter status `{other}`"),
                });
            }
        };

        let reason = s
            .optional("chief_complaint")
            .map(|text| json!([{ "text": text }]));
        let participant = s
            .optional("attending_doctor")
            .map(|name| json!([{ "individual": { "display": name } }]));

        Ok(DeliveryPayload {
            resource: "Encounter",
            external_key: encounter_id.to_string(),
            body: compact(json!({
                "resourceType": "Encounter",
                "identifier": identifier(&self.identifier_system, encounter_id),
                "status": status,
                "class": { "system": ACT_CODE_SYSTEM, "code": class },
                "subject": reference("Patient", &self.identifier_system, s.required("patient_id")?),
                "period": {
                    "start": s.required("started_at")?,
                    "end": s.optional("ended_at"),
                },
                "reasonCode": reason,
                "participant": participant,
            })),
        })
    }
}

#[derive(Debug, Clone)]
pub struct FhirServiceRequestBuilder {
    identifier_system: String,
}

impl FhirServiceRequestBuilder {
    pub fn new(identifier_system: impl Into<String>) -> Self {
        Self {
            identifier_system: identifier_system.into(),
        }
    }
}

impl PayloadBuilder for FhirServiceRequestBuilder {
    fn build(&self, entry: &LedgerEntry) -> Result<DeliveryPayload, BuildError> {
        let s = Snapshot::of(entry)?;
        let order_id = s.required("order_id")?;
        let code = s.required("code")?;

        let priority = match s.optional("urgency").unwrap_or("routine") {
            p @ ("routine" | "urgent" | "asap" | "stat") => p,
            other => {
                return Err(BuildError::InvalidField {
                    field: "urgency",
                    reason: format!("unsupported urgency `{other}`"),
                });
            }
        };
        let status = if entry.operation == Operation::Delete {
            "revoked"
        } else {
            s.required("status")?
        };
        let encounter = s
            .optional("encounter_id")
            .map(|id| reference("Encounter", &self.identifier_system, id));

        Ok(DeliveryPayload {
            resource: "ServiceRequest",
            external_key: order_id.to_string(),
            body: compact(json!({
                "resourceType": "ServiceRequest",
                "identifier": identifier(&self.identifier_system, order_id),
                "status": status,
                "intent": "order",
                "priority": priority,
                "category": [{ "text": s.required("order_type")? }],
                "code": {
                    "coding": [{ "code": code, "display": s.optional("display") }],
                    "text": s.optional("display").unwrap_or(code),
                },
                "subject": reference("Patient", &self.identifier_system, s.required("patient_id")?),
                "encounter": encounter,
                "authoredOn": s.required("ordered_at")?,
            })),
        })
    }
}
