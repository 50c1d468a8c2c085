//! Capability snapshots and the external telemetry seam.
//!
//! The fabric never measures hardware itself. An embedder supplies a [`TelemetrySource`]
//! that produces [`CapabilitySnapshot`]s from the device's own monitoring; the snapshot is
//! immutable once taken and refreshed whenever the node advertises itself. When the source
//! is not ready, operations needing local capabilities fail with `TelemetryUnavailable`.

use serde::{Deserialize, Serialize};

/// Broad compute class of a node, used for quick capability triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ComputeTier {
    Low,
    Medium,
    High,
    Premium,
}

/// Thermal pressure reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThermalState {
    Nominal,
    Fair,
    Serious,
    Critical,
}

/// Point-in-time capability snapshot advertised to the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySnapshot {
    pub tier: ComputeTier,
    pub cpu_cores: u32,
    pub ram_gb: f64,
    pub gpu_available: bool,
    pub bandwidth_mbps: f64,
    pub battery_percent: Option<f32>,
    pub thermal: ThermalState,
}

impl CapabilitySnapshot {
    /// Whether this snapshot can take on a task needing the given resources.
    pub fn satisfies(&self, cpu_cores: u32, ram_gb: f64, gpu_required: bool) -> bool {
        self.cpu_cores >= cpu_cores
            && self.ram_gb >= ram_gb
            && (!gpu_required || self.gpu_available)
    }
}

/// External telemetry seam. Returns `None` while the source is warming up.
pub trait TelemetrySource: Send + Sync + 'static {
    fn capabilities(&self) -> Option<CapabilitySnapshot>;
}

/// Telemetry source with a fixed snapshot, for tests and embedders with static hardware.
pub struct StaticTelemetry {
    snapshot: CapabilitySnapshot,
}

impl StaticTelemetry {
    pub fn new(snapshot: CapabilitySnapshot) -> Self {
        StaticTelemetry { snapshot }
    }
}

impl TelemetrySource for StaticTelemetry {
    fn capabilities(&self) -> Option<CapabilitySnapshot> {
        Some(self.snapshot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> CapabilitySnapshot {
        CapabilitySnapshot {
            tier: ComputeTier::Medium,
            cpu_cores: 4,
            ram_gb: 8.0,
            gpu_available: false,
            bandwidth_mbps: 100.0,
            battery_percent: None,
            thermal: ThermalState::Nominal,
        }
    }

    #[test]
    fn satisfies_checks_every_axis() {
        let snap = snapshot();
        assert!(snap.satisfies(4, 8.0, false));
        assert!(!snap.satisfies(8, 8.0, false));
        assert!(!snap.satisfies(4, 16.0, false));
        assert!(!snap.satisfies(4, 8.0, true));
    }

    #[test]
    fn static_source_always_ready() {
        let source = StaticTelemetry::new(snapshot());
        assert!(source.capabilities().is_some());
    }
}
