//! SQLite schema definitions for the poller database.
//!
//! Subjects and recipients are written by the registration CLI; watermarks,
//! the missing flag and delivery records are written by the poller.

use crate::sqlite_column;
use crate::sqlite_persistence::{ForeignKey, OnDelete, SqlType, Table, VersionedSchema, DEFAULT_TIMESTAMP};
use rusqlite::Transaction;

const SUBJECT_FK: ForeignKey = ForeignKey {
    foreign_table: "subjects",
    foreign_column: "id",
    on_delete: OnDelete::Cascade,
};

const RECIPIENT_FK: ForeignKey = ForeignKey {
    foreign_table: "recipients",
    foreign_column: "id",
    on_delete: OnDelete::Cascade,
};

// =============================================================================
// Version 1 - Subjects, recipients, watermarks, delivery records
// =============================================================================

const SUBJECTS_TABLE_V1: Table = Table {
    name: "subjects",
    columns: &[
        sqlite_column!("id", SqlType::Text, is_primary_key = true),
        sqlite_column!("label", SqlType::Text, non_null = true),
        sqlite_column!("target", SqlType::Text, non_null = true),
        sqlite_column!("selector", SqlType::Text),
        sqlite_column!("kind", SqlType::Text, non_null = true), // sequence | timestamp | marker
        sqlite_column!(
            "created",
            SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[],
    unique_constraints: &[],
};

const RECIPIENTS_TABLE_V1: Table = Table {
    name: "recipients",
    columns: &[
        sqlite_column!("id", SqlType::Text, is_primary_key = true),
        sqlite_column!("address", SqlType::Text, non_null = true),
        sqlite_column!(
            "notifications_enabled",
            SqlType::Integer,
            non_null = true,
            default_value = Some("1")
        ),
        sqlite_column!(
            "created",
            SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[],
    unique_constraints: &[],
};

const SUBSCRIPTIONS_TABLE_V1: Table = Table {
    name: "subscriptions",
    columns: &[
        sqlite_column!("id", SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "subject_id",
            SqlType::Text,
            non_null = true,
            foreign_key = Some(&SUBJECT_FK)
        ),
        sqlite_column!(
            "recipient_id",
            SqlType::Text,
            non_null = true,
            foreign_key = Some(&RECIPIENT_FK)
        ),
    ],
    indices: &[("idx_subscriptions_recipient", "recipient_id")],
    unique_constraints: &[&["subject_id", "recipient_id"]],
};

/// One row per subject, only ever moved forward.
const WATERMARKS_TABLE_V1: Table = Table {
    name: "watermarks",
    columns: &[
        sqlite_column!(
            "subject_id",
            SqlType::Text,
            is_primary_key = true,
            foreign_key = Some(&SUBJECT_FK)
        ),
        sqlite_column!("kind", SqlType::Text, non_null = true),
        sqlite_column!("value", SqlType::Text, non_null = true),
        sqlite_column!("updated_at", SqlType::Text, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[],
};

const DELIVERY_RECORDS_TABLE_V1: Table = Table {
    name: "delivery_records",
    columns: &[
        sqlite_column!("id", SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "subject_id",
            SqlType::Text,
            non_null = true,
            foreign_key = Some(&SUBJECT_FK)
        ),
        sqlite_column!("change_id", SqlType::Text, non_null = true),
        sqlite_column!(
            "recipient_id",
            SqlType::Text,
            non_null = true,
            foreign_key = Some(&RECIPIENT_FK)
        ),
        sqlite_column!("outcome", SqlType::Text, non_null = true),
        sqlite_column!("attempts", SqlType::Integer, non_null = true),
        sqlite_column!("last_error", SqlType::Text),
        sqlite_column!("first_attempt_at", SqlType::Text, non_null = true),
        sqlite_column!("last_attempt_at", SqlType::Text, non_null = true),
    ],
    indices: &[("idx_delivery_records_last_attempt", "last_attempt_at")],
    unique_constraints: &[&["subject_id", "change_id", "recipient_id"]],
};

// =============================================================================
// Version 2 - Missing flag on subjects
// =============================================================================

const SUBJECTS_TABLE_V2: Table = Table {
    name: "subjects",
    columns: &[
        sqlite_column!("id", SqlType::Text, is_primary_key = true),
        sqlite_column!("label", SqlType::Text, non_null = true),
        sqlite_column!("target", SqlType::Text, non_null = true),
        sqlite_column!("selector", SqlType::Text),
        sqlite_column!("kind", SqlType::Text, non_null = true),
        sqlite_column!(
            "created",
            SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
        sqlite_column!("missing_since", SqlType::Text),
    ],
    indices: &[],
    unique_constraints: &[],
};

fn migrate_v1_to_v2(tx: &Transaction) -> anyhow::Result<()> {
    tx.execute("ALTER TABLE subjects ADD COLUMN missing_since TEXT", [])?;
    Ok(())
}

// =============================================================================
// Versioned Schema Definition
// =============================================================================

/// Version 1: subjects, recipients, subscriptions, watermarks, delivery records
/// Version 2: subjects.missing_since
pub const POLLER_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[
            SUBJECTS_TABLE_V1,
            RECIPIENTS_TABLE_V1,
            SUBSCRIPTIONS_TABLE_V1,
            WATERMARKS_TABLE_V1,
            DELIVERY_RECORDS_TABLE_V1,
        ],
        migration: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[
            SUBJECTS_TABLE_V2,
            RECIPIENTS_TABLE_V1,
            SUBSCRIPTIONS_TABLE_V1,
            WATERMARKS_TABLE_V1,
            DELIVERY_RECORDS_TABLE_V1,
        ],
        migration: Some(migrate_v1_to_v2),
    },
];
