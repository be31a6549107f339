//! Disk-touching, TTL/retention-driven subsystems: the audit log (C2) and
//! the schema cache (C5).

mod audit;
mod schema_cache;

pub use audit::{hash_args, AuditEvent, AuditEventKind, AuditLog, AuditOutcome};
pub use schema_cache::{SchemaCache, ToolDescriptor};
