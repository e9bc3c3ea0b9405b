// ============================================================================
// src/cmd/mod.rs – command subsystem root
// ============================================================================
pub mod base; // allowlisted external command runner
pub mod client; // bootnext version | scan | install | mount | stop | watch
pub mod worker; // bootnext worker
