//! redb table definitions for the fleetgrid state store.
//!
//! Every table uses `&str` keys and `&[u8]` values (JSON-serialized records).
//! Hierarchical keys use `/` so a deployment's rows share a scan prefix.

use redb::TableDefinition;

/// Shape shared by all tables.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Deployment records keyed by `{name}`.
pub const DEPLOYMENTS: JsonTable = TableDefinition::new("deployments");

/// Instance records keyed by `{deployment}/{group}/{index}`.
pub const INSTANCES: JsonTable = TableDefinition::new("instances");

/// Address reservations keyed by `{network}/{address}`.
pub const RESERVATIONS: JsonTable = TableDefinition::new("reservations");

/// Orphaned persistent disks keyed by `{disk_cid}`.
pub const ORPHANED_DISKS: JsonTable = TableDefinition::new("orphaned_disks");

/// Advisory locks keyed by resource key (`deployment/{name}`, `network/{name}`).
pub const LOCKS: JsonTable = TableDefinition::new("locks");
