//! Typed per-entity records
//!
//! Each struct accepts both the CRM field names and the local column names, so
//! the same type deserializes a record from either side.

use chrono::{DateTime, NaiveDate, Utc};
use recon_common::EntityType;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::value::{de, FieldValue};

/// A typed record of one entity type
pub trait EntityRecord: DeserializeOwned + Send + 'static {
    const ENTITY: EntityType;

    fn record_id(&self) -> &str;

    fn updated_at(&self) -> Option<DateTime<Utc>>;

    /// Data fields in declared order, excluding identity and updated-at
    fn into_fields(self) -> Vec<(&'static str, FieldValue)>;
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Volunteer {
    #[serde(alias = "Id", deserialize_with = "de::record_id")]
    pub id: String,
    #[serde(default, alias = "FirstName", deserialize_with = "de::opt_text")]
    pub first_name: Option<String>,
    #[serde(default, alias = "LastName", deserialize_with = "de::opt_text")]
    pub last_name: Option<String>,
    #[serde(default, alias = "Email", deserialize_with = "de::opt_text")]
    pub email: Option<String>,
    #[serde(default, alias = "Title", deserialize_with = "de::opt_text")]
    pub title: Option<String>,
    #[serde(default, alias = "Department", deserialize_with = "de::opt_text")]
    pub department: Option<String>,
    #[serde(default, alias = "AccountId", deserialize_with = "de::opt_text")]
    pub organization_id: Option<String>,
    #[serde(default, alias = "Volunteer_Hours__c", deserialize_with = "de::opt_f64")]
    pub total_hours: Option<f64>,
    #[serde(default, alias = "Last_Volunteer_Date__c", deserialize_with = "de::opt_date")]
    pub last_volunteer_date: Option<NaiveDate>,
    #[serde(default, alias = "HasOptedOutOfEmail", deserialize_with = "de::opt_bool")]
    pub email_opt_out: Option<bool>,
    #[serde(default, alias = "LastModifiedDate", deserialize_with = "de::opt_datetime")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl EntityRecord for Volunteer {
    const ENTITY: EntityType = EntityType::Volunteer;

    fn record_id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    fn into_fields(self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("first_name", self.first_name.into()),
            ("last_name", self.last_name.into()),
            ("email", self.email.into()),
            ("title", self.title.into()),
            ("department", self.department.into()),
            ("organization_id", self.organization_id.into()),
            ("total_hours", self.total_hours.into()),
            ("last_volunteer_date", self.last_volunteer_date.into()),
            ("email_opt_out", self.email_opt_out.into()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Organization {
    #[serde(alias = "Id", deserialize_with = "de::record_id")]
    pub id: String,
    #[serde(default, alias = "Name", deserialize_with = "de::opt_text")]
    pub name: Option<String>,
    #[serde(default, alias = "Type", deserialize_with = "de::opt_text")]
    pub org_type: Option<String>,
    #[serde(default, alias = "BillingCity", deserialize_with = "de::opt_text")]
    pub city: Option<String>,
    #[serde(default, alias = "BillingState", deserialize_with = "de::opt_text")]
    pub state: Option<String>,
    #[serde(default, alias = "NumberOfEmployees", deserialize_with = "de::opt_i64")]
    pub employee_count: Option<i64>,
    #[serde(default, alias = "LastModifiedDate", deserialize_with = "de::opt_datetime")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl EntityRecord for Organization {
    const ENTITY: EntityType = EntityType::Organization;

    fn record_id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    fn into_fields(self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("name", self.name.into()),
            ("org_type", self.org_type.into()),
            ("city", self.city.into()),
            ("state", self.state.into()),
            ("employee_count", self.employee_count.into()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Event {
    #[serde(alias = "Id", deserialize_with = "de::record_id")]
    pub id: String,
    #[serde(default, alias = "Name", deserialize_with = "de::opt_text")]
    pub title: Option<String>,
    #[serde(default, alias = "Session_Type__c", deserialize_with = "de::opt_text")]
    pub event_type: Option<String>,
    #[serde(default, alias = "Session_Status__c", deserialize_with = "de::opt_text")]
    pub status: Option<String>,
    #[serde(default, alias = "Start_Date_and_Time__c", deserialize_with = "de::opt_datetime")]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "End_Date_and_Time__c", deserialize_with = "de::opt_datetime")]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "Location_Information__c", deserialize_with = "de::opt_text")]
    pub location: Option<String>,
    #[serde(default, alias = "Registered_Count__c", deserialize_with = "de::opt_i64")]
    pub registered_count: Option<i64>,
    #[serde(default, alias = "Volunteers_Needed__c", deserialize_with = "de::opt_i64")]
    pub volunteers_needed: Option<i64>,
    #[serde(default, alias = "LastModifiedDate", deserialize_with = "de::opt_datetime")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl EntityRecord for Event {
    const ENTITY: EntityType = EntityType::Event;

    fn record_id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    fn into_fields(self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("title", self.title.into()),
            ("event_type", self.event_type.into()),
            ("status", self.status.into()),
            ("start_at", self.start_at.into()),
            ("end_at", self.end_at.into()),
            ("location", self.location.into()),
            ("registered_count", self.registered_count.into()),
            ("volunteers_needed", self.volunteers_needed.into()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Student {
    #[serde(alias = "Id", deserialize_with = "de::record_id")]
    pub id: String,
    #[serde(default, alias = "First_Name__c", deserialize_with = "de::opt_text")]
    pub first_name: Option<String>,
    #[serde(default, alias = "Last_Name__c", deserialize_with = "de::opt_text")]
    pub last_name: Option<String>,
    #[serde(default, alias = "Grade__c", deserialize_with = "de::opt_i64")]
    pub grade: Option<i64>,
    #[serde(default, alias = "School__c", deserialize_with = "de::opt_text")]
    pub school_id: Option<String>,
    #[serde(default, alias = "Birthdate__c", deserialize_with = "de::opt_date")]
    pub birthdate: Option<NaiveDate>,
    #[serde(default, alias = "LastModifiedDate", deserialize_with = "de::opt_datetime")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl EntityRecord for Student {
    const ENTITY: EntityType = EntityType::Student;

    fn record_id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    fn into_fields(self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("first_name", self.first_name.into()),
            ("last_name", self.last_name.into()),
            ("grade", self.grade.into()),
            ("school_id", self.school_id.into()),
            ("birthdate", self.birthdate.into()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Teacher {
    #[serde(alias = "Id", deserialize_with = "de::record_id")]
    pub id: String,
    #[serde(default, alias = "First_Name__c", deserialize_with = "de::opt_text")]
    pub first_name: Option<String>,
    #[serde(default, alias = "Last_Name__c", deserialize_with = "de::opt_text")]
    pub last_name: Option<String>,
    #[serde(default, alias = "Email__c", deserialize_with = "de::opt_text")]
    pub email: Option<String>,
    #[serde(default, alias = "School__c", deserialize_with = "de::opt_text")]
    pub school_id: Option<String>,
    #[serde(default, alias = "Department__c", deserialize_with = "de::opt_text")]
    pub department: Option<String>,
    #[serde(default, alias = "LastModifiedDate", deserialize_with = "de::opt_datetime")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl EntityRecord for Teacher {
    const ENTITY: EntityType = EntityType::Teacher;

    fn record_id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    fn into_fields(self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("first_name", self.first_name.into()),
            ("last_name", self.last_name.into()),
            ("email", self.email.into()),
            ("school_id", self.school_id.into()),
            ("department", self.department.into()),
        ]
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::entity::descriptor;
    use serde_json::json;

    fn field_names<R: EntityRecord>(record: R) -> Vec<&'static str> {
        record.into_fields().into_iter().map(|(name, _)| name).collect()
    }

    #[test]
    fn test_field_order_matches_declared_schema() {
        let v: Volunteer = serde_json::from_value(json!({"Id": "a"})).unwrap();
        let o: Organization = serde_json::from_value(json!({"Id": "a"})).unwrap();
        let e: Event = serde_json::from_value(json!({"Id": "a"})).unwrap();
        let s: Student = serde_json::from_value(json!({"Id": "a"})).unwrap();
        let t: Teacher = serde_json::from_value(json!({"Id": "a"})).unwrap();

        let declared = |entity| descriptor(entity).canonical_fields().collect::<Vec<_>>();
        assert_eq!(field_names(v), declared(EntityType::Volunteer));
        assert_eq!(field_names(o), declared(EntityType::Organization));
        assert_eq!(field_names(e), declared(EntityType::Event));
        assert_eq!(field_names(s), declared(EntityType::Student));
        assert_eq!(field_names(t), declared(EntityType::Teacher));
    }

    #[test]
    fn test_crm_and_local_shapes_deserialize_alike() {
        let crm: Volunteer = serde_json::from_value(json!({
            "Id": "0035e00000AbCdE",
            "FirstName": "Ada",
            "LastName": "Lovelace",
            "Email": "ada@example.org",
            "Volunteer_Hours__c": "12.5",
            "Last_Volunteer_Date__c": "2024-03-01",
            "HasOptedOutOfEmail": false,
            "LastModifiedDate": "2024-03-02T08:00:00.000+0000",
            "attributes": {"type": "Contact"}
        }))
        .unwrap();
        let local: Volunteer = serde_json::from_value(json!({
            "id": "0035e00000AbCdE",
            "first_name": "Ada",
            "last_name": "Lovelace",
            "email": "ada@example.org",
            "total_hours": 12.5,
            "last_volunteer_date": "2024-03-01T00:00:00",
            "email_opt_out": "false",
            "updated_at": "2024-03-02T08:00:00Z"
        }))
        .unwrap();

        assert_eq!(crm, local);
    }

    #[test]
    fn test_text_is_kept_as_delivered() {
        let t: Teacher = serde_json::from_value(json!({"Id": "t1", "Email__c": "  ", "Last_Name__c": "Hopper "})).unwrap();
        assert_eq!(t.email.as_deref(), Some("  "));
        assert_eq!(t.last_name.as_deref(), Some("Hopper "));

        let t: Teacher = serde_json::from_value(json!({"Id": "t1", "Email__c": null})).unwrap();
        assert_eq!(t.email, None);
    }

    #[test]
    fn test_empty_string_is_null_for_typed_fields() {
        let s: Student = serde_json::from_value(json!({"Id": "s1", "Grade__c": ""})).unwrap();
        assert_eq!(s.grade, None);
    }

    #[test]
    fn test_type_mismatch_is_rejected() {
        let result: Result<Student, _> = serde_json::from_value(json!({"Id": "s1", "Grade__c": "ninth"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_id_is_rejected() {
        let result: Result<Organization, _> = serde_json::from_value(json!({"Name": "Acme"}));
        assert!(result.is_err());
    }
}
