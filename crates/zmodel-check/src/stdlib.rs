//! The bundled standard library document.
//!
//! Parsed once per process and shared read-only by every compile unit.

use std::sync::OnceLock;

use zmodel_dsl::ast::Document;
use zmodel_dsl::parse_document;

pub const STDLIB_SOURCE: &str = r#"
enum SortOrder {
    Asc
    Desc
}

enum ReferentialAction {
    Cascade
    Restrict
    NoAction
    SetNull
    SetDefault
}

enum AttributeTargetField {
    StringField
    IntField
    BigIntField
    FloatField
    DecimalField
    BooleanField
    DateTimeField
    JsonField
    BytesField
    EnumField
    ModelField
}

function env(name: String): String {}
function auth(): Any {}
function future(): Any {}
function now(): DateTime {}
function uuid(version: Int?): String {}
function cuid(): String {}
function autoincrement(): Int {}
function dbgenerated(expr: String?): Any {}
function contains(field: String, search: String, caseInSensitive: Boolean?): Boolean {}
function startsWith(field: String, search: String): Boolean {}
function endsWith(field: String, search: String): Boolean {}
function has(field: Any[], search: Any): Boolean {}
function hasSome(field: Any[], search: Any[]): Boolean {}
function hasEvery(field: Any[], search: Any[]): Boolean {}
function isEmpty(field: Any[]): Boolean {}

attribute @@@targetField(_ targetField: AttributeTargetField[])

attribute @id(map: String?)
attribute @default(_ value: ContextType, map: String?)
attribute @unique(map: String?) @@@targetField([StringField, IntField, BigIntField, FloatField, DecimalField, BooleanField, DateTimeField, BytesField, EnumField])
attribute @map(_ name: String)
attribute @updatedAt() @@@targetField([DateTimeField])
attribute @relation(_ name: String?, fields: FieldReference[]?, references: TransitiveFieldReference[]?, onDelete: ReferentialAction?, onUpdate: ReferentialAction?, map: String?) @@@targetField([ModelField])
attribute @ignore()
attribute @omit()
attribute @allow(_ operation: String, _ condition: Boolean)
attribute @deny(_ operation: String, _ condition: Boolean)

attribute @@id(_ fields: FieldReference[], name: String?, map: String?)
attribute @@unique(_ fields: FieldReference[], name: String?, map: String?)
attribute @@index(_ fields: FieldReference[], name: String?, map: String?)
attribute @@map(_ name: String)
attribute @@ignore()
attribute @@allow(_ operation: String, _ condition: Boolean)
attribute @@deny(_ operation: String, _ condition: Boolean)
attribute @@delegate(_ discriminator: FieldReference)
"#;

static STDLIB: OnceLock<Document> = OnceLock::new();

/// The parsed standard library.
pub fn stdlib() -> &'static Document {
    STDLIB.get_or_init(|| {
        tracing::debug!("parsing bundled standard library");
        parse_document(STDLIB_SOURCE).expect("bundled standard library must parse")
    })
}
