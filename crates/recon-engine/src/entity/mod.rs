//! Entity descriptors
//!
//! Each entity type has a fixed descriptor naming its local table, its CRM
//! object, the declared CRM schema, the fields that must be populated, and the
//! fields compared by the canonical hash. Local column names double as the
//! canonical field names used throughout the engine.

pub mod records;
pub mod value;

use recon_common::EntityType;

pub use records::{EntityRecord, Event, Organization, Student, Teacher, Volunteer};
pub use value::{FieldType, FieldValue, FIELD_SEPARATOR, NULL_MARKER};

/// One declared CRM field and its canonical (local) name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaField {
    pub source_name: &'static str,
    pub canonical: &'static str,
    pub field_type: FieldType,
}

impl SchemaField {
    const fn new(source_name: &'static str, canonical: &'static str, field_type: FieldType) -> Self {
        Self {
            source_name,
            canonical,
            field_type,
        }
    }
}

/// Static description of how one entity type is stored on both sides
#[derive(Debug)]
pub struct EntityDescriptor {
    pub entity_type: EntityType,
    /// Local mirror table
    pub table: &'static str,
    /// Local column holding the CRM identifier
    pub primary_key: &'static str,
    pub updated_at_column: &'static str,
    /// CRM object name, also the HTTP resource path
    pub crm_object: &'static str,
    pub source_primary_key: &'static str,
    pub source_updated_at: &'static str,
    /// Declared CRM schema, in the typed struct's field order
    pub schema: &'static [SchemaField],
    /// Canonical names of fields that must be populated
    pub required: &'static [&'static str],
    /// Canonical names of fields covered by the record hash
    pub comparison: &'static [&'static str],
}

impl EntityDescriptor {
    pub fn field(&self, canonical: &str) -> Option<&SchemaField> {
        self.schema.iter().find(|f| f.canonical == canonical)
    }

    pub fn field_type(&self, canonical: &str) -> Option<FieldType> {
        self.field(canonical).map(|f| f.field_type)
    }

    /// Canonical names of every declared field
    pub fn canonical_fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.schema.iter().map(|f| f.canonical)
    }

    /// Source-side names that carry identity or bookkeeping rather than data
    pub fn is_system_field(&self, source_name: &str) -> bool {
        source_name == self.source_primary_key
            || source_name == self.source_updated_at
            || source_name == self.primary_key
            || source_name == "id"
            || source_name == self.updated_at_column
    }
}

use FieldType::{Boolean, Date, DateTime, Decimal, Integer, Text};

static VOLUNTEER: EntityDescriptor = EntityDescriptor {
    entity_type: EntityType::Volunteer,
    table: "volunteers",
    primary_key: "salesforce_id",
    updated_at_column: "updated_at",
    crm_object: "Contact",
    source_primary_key: "Id",
    source_updated_at: "LastModifiedDate",
    schema: &[
        SchemaField::new("FirstName", "first_name", Text),
        SchemaField::new("LastName", "last_name", Text),
        SchemaField::new("Email", "email", Text),
        SchemaField::new("Title", "title", Text),
        SchemaField::new("Department", "department", Text),
        SchemaField::new("AccountId", "organization_id", Text),
        SchemaField::new("Volunteer_Hours__c", "total_hours", Decimal),
        SchemaField::new("Last_Volunteer_Date__c", "last_volunteer_date", Date),
        SchemaField::new("HasOptedOutOfEmail", "email_opt_out", Boolean),
    ],
    required: &["first_name", "last_name", "email"],
    comparison: &[
        "last_name",
        "first_name",
        "email",
        "title",
        "department",
        "organization_id",
        "total_hours",
        "last_volunteer_date",
        "email_opt_out",
    ],
};

static ORGANIZATION: EntityDescriptor = EntityDescriptor {
    entity_type: EntityType::Organization,
    table: "organizations",
    primary_key: "salesforce_id",
    updated_at_column: "updated_at",
    crm_object: "Account",
    source_primary_key: "Id",
    source_updated_at: "LastModifiedDate",
    schema: &[
        SchemaField::new("Name", "name", Text),
        SchemaField::new("Type", "org_type", Text),
        SchemaField::new("BillingCity", "city", Text),
        SchemaField::new("BillingState", "state", Text),
        SchemaField::new("NumberOfEmployees", "employee_count", Integer),
    ],
    required: &["name"],
    comparison: &["name", "org_type", "city", "state", "employee_count"],
};

static EVENT: EntityDescriptor = EntityDescriptor {
    entity_type: EntityType::Event,
    table: "events",
    primary_key: "salesforce_id",
    updated_at_column: "updated_at",
    crm_object: "Session__c",
    source_primary_key: "Id",
    source_updated_at: "LastModifiedDate",
    schema: &[
        SchemaField::new("Name", "title", Text),
        SchemaField::new("Session_Type__c", "event_type", Text),
        SchemaField::new("Session_Status__c", "status", Text),
        SchemaField::new("Start_Date_and_Time__c", "start_at", DateTime),
        SchemaField::new("End_Date_and_Time__c", "end_at", DateTime),
        SchemaField::new("Location_Information__c", "location", Text),
        SchemaField::new("Registered_Count__c", "registered_count", Integer),
        SchemaField::new("Volunteers_Needed__c", "volunteers_needed", Integer),
    ],
    required: &["title", "start_at", "status"],
    comparison: &[
        "title",
        "status",
        "event_type",
        "start_at",
        "end_at",
        "location",
        "registered_count",
        "volunteers_needed",
    ],
};

static STUDENT: EntityDescriptor = EntityDescriptor {
    entity_type: EntityType::Student,
    table: "students",
    primary_key: "salesforce_id",
    updated_at_column: "updated_at",
    crm_object: "Student__c",
    source_primary_key: "Id",
    source_updated_at: "LastModifiedDate",
    schema: &[
        SchemaField::new("First_Name__c", "first_name", Text),
        SchemaField::new("Last_Name__c", "last_name", Text),
        SchemaField::new("Grade__c", "grade", Integer),
        SchemaField::new("School__c", "school_id", Text),
        SchemaField::new("Birthdate__c", "birthdate", Date),
    ],
    required: &["first_name", "last_name", "school_id"],
    comparison: &["school_id", "first_name", "last_name", "grade", "birthdate"],
};

static TEACHER: EntityDescriptor = EntityDescriptor {
    entity_type: EntityType::Teacher,
    table: "teachers",
    primary_key: "salesforce_id",
    updated_at_column: "updated_at",
    crm_object: "Teacher__c",
    source_primary_key: "Id",
    source_updated_at: "LastModifiedDate",
    schema: &[
        SchemaField::new("First_Name__c", "first_name", Text),
        SchemaField::new("Last_Name__c", "last_name", Text),
        SchemaField::new("Email__c", "email", Text),
        SchemaField::new("School__c", "school_id", Text),
        SchemaField::new("Department__c", "department", Text),
    ],
    required: &["first_name", "last_name", "school_id"],
    comparison: &["school_id", "email", "first_name", "last_name", "department"],
};

/// Descriptor for an entity type
pub fn descriptor(entity: EntityType) -> &'static EntityDescriptor {
    match entity {
        EntityType::Volunteer => &VOLUNTEER,
        EntityType::Organization => &ORGANIZATION,
        EntityType::Event => &EVENT,
        EntityType::Student => &STUDENT,
        EntityType::Teacher => &TEACHER,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_matches_entity() {
        for entity in EntityType::ALL {
            assert_eq!(descriptor(entity).entity_type, entity);
        }
    }

    #[test]
    fn test_required_and_comparison_fields_are_declared() {
        for entity in EntityType::ALL {
            let d = descriptor(entity);
            for name in d.required.iter().chain(d.comparison) {
                assert!(d.field(name).is_some(), "{entity}: '{name}' is not declared");
            }
        }
    }

    #[test]
    fn test_system_fields() {
        let d = descriptor(EntityType::Volunteer);
        assert!(d.is_system_field("Id"));
        assert!(d.is_system_field("LastModifiedDate"));
        assert!(!d.is_system_field("Email"));
    }
}
