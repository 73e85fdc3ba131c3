pub mod pending_promotions;
pub mod plugin_records;
