//! redb table definitions for the convoy state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Pipeline runs keyed by run id.
pub const PIPELINE_RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("pipeline_runs");

/// Scan reports keyed by artifact digest.
pub const SCAN_REPORTS: TableDefinition<&str, &[u8]> = TableDefinition::new("scan_reports");

/// Published references keyed by artifact digest.
pub const PUBLISHED: TableDefinition<&str, &[u8]> = TableDefinition::new("published");

/// Desired service specs keyed by service id.
pub const SERVICE_SPECS: TableDefinition<&str, &[u8]> = TableDefinition::new("service_specs");

/// Observed service state keyed by service id.
pub const SERVICE_STATES: TableDefinition<&str, &[u8]> = TableDefinition::new("service_states");

/// Scaling policies keyed by service id.
pub const SCALING_POLICIES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("scaling_policies");

/// Active security rule sets keyed by service id.
pub const SECURITY_RULES: TableDefinition<&str, &[u8]> = TableDefinition::new("security_rules");

/// Newest metric sample keyed by service id.
pub const METRICS: TableDefinition<&str, &[u8]> = TableDefinition::new("metrics");
