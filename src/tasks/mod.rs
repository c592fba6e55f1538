//! Background tasks.

mod orphan_monitor;

pub use orphan_monitor::{handle_report, OrphanMonitorTask};
