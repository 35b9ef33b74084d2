//! Background periodic workers, grounded on the reference server's
//! `jobs::key_package_cleanup`/`mark_inactive_devices` `interval`-loop idiom.

pub mod entry_key_gc;
pub mod integration_reconciler;
pub mod subscription_sweeper;

pub use entry_key_gc::run_entry_key_gc_worker;
pub use integration_reconciler::run_integration_reconciler_worker;
pub use subscription_sweeper::run_subscription_sweeper_worker;
