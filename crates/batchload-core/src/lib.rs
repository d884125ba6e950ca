//! Entity definitions, typed values and primary-key tuples for batchload.

pub mod entity;
pub mod record;
pub mod value;

pub use entity::{is_identifier, EntityDef, EntityError, EntityRegistry, FieldDef};
pub use record::{KeyError, PrimaryKey, RawRow, Record, RowError};
pub use value::{parse_timestamp, CoercionError, FieldKind, KeyValue, Value};

pub const CRATE_NAME: &str = "batchload-core";
