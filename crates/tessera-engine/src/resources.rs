//! Compute-unit estimation and shared-resource claims.
//!
//! Before a step may execute, the outer dispatcher reserves capacity on the
//! shared resources it will load. The engine expresses that demand as
//! [`Load`] claims: a number of abstract compute units (ACUs) against the
//! database reader pool and the estimated upload volume against the I/O
//! path.

use serde::{Deserialize, Serialize};

use crate::hub::SpaceStatistics;

/// Bytes of stored layer data per claimed compute unit.
const EXPORT_BYTES_PER_ACU: f64 = 1024.0 * 1024.0 * 1024.0;

/// Minimum compute-unit claim for any export.
const MIN_EXPORT_ACUS: f64 = 0.5;

/// A shared resource claims are made against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resource {
    /// The database read replica pool.
    DbReader,
    /// The outbound I/O path.
    IoOut,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DbReader => write!(f, "db_reader"),
            Self::IoOut => write!(f, "io_out"),
        }
    }
}

/// A claim of virtual units against one shared resource.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Load {
    /// The resource claimed.
    pub resource: Resource,
    /// The claimed number of virtual units.
    pub estimated_virtual_units: f64,
}

impl Load {
    /// Creates a claim.
    #[must_use]
    pub const fn new(resource: Resource, estimated_virtual_units: f64) -> Self {
        Self {
            resource,
            estimated_virtual_units,
        }
    }
}

/// Sizes a step's compute-unit budget from dataset statistics.
///
/// The ACU figure is computed once per run and memoized; repeated
/// resource queries return the cached value, and a resumed step restores
/// it through [`ResourceEstimator::restore`] rather than recomputing.
#[derive(Debug, Clone, Default)]
pub struct ResourceEstimator {
    overall_needed_acus: Option<f64>,
}

impl ResourceEstimator {
    /// Creates an estimator with no cached value.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores a previously computed ACU figure (crash-resume path).
    #[must_use]
    pub const fn restore(overall_needed_acus: f64) -> Self {
        Self {
            overall_needed_acus: Some(overall_needed_acus),
        }
    }

    /// Returns the cached ACU figure, if computed.
    #[must_use]
    pub const fn overall_needed_acus(&self) -> Option<f64> {
        self.overall_needed_acus
    }

    /// Computes (or returns the cached) compute-unit claim for a layer of
    /// the given byte size.
    pub fn needed_export_acus(&mut self, byte_size: i64) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let computed = (byte_size.max(0) as f64 / EXPORT_BYTES_PER_ACU).max(MIN_EXPORT_ACUS);
        *self.overall_needed_acus.get_or_insert(computed)
    }

    /// Produces the step's resource claims from a statistics snapshot.
    ///
    /// One claim against the database reader pool sized in ACUs, one
    /// against the I/O path sized by the uncompressed upload estimate.
    #[allow(clippy::cast_precision_loss)]
    pub fn loads(&mut self, statistics: &SpaceStatistics) -> Vec<Load> {
        let acus = self.needed_export_acus(statistics.byte_size);
        tracing::info!(
            byte_size = statistics.byte_size,
            needed_acus = acus,
            "calculated compute-unit claim"
        );
        vec![
            Load::new(Resource::DbReader, acus),
            Load::new(Resource::IoOut, statistics.byte_size.max(0) as f64),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(byte_size: i64) -> SpaceStatistics {
        SpaceStatistics {
            byte_size,
            estimated_feature_count: 1_000_000,
            max_version: 9,
        }
    }

    #[test]
    fn acus_scale_with_byte_size() {
        let mut estimator = ResourceEstimator::new();
        let four_gib = 4 * 1024 * 1024 * 1024_i64;
        assert!((estimator.needed_export_acus(four_gib) - 4.0).abs() < 1e-9);
    }

    #[test]
    fn small_layers_hit_the_floor() {
        let mut estimator = ResourceEstimator::new();
        assert!((estimator.needed_export_acus(1024) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn first_computation_wins() {
        let mut estimator = ResourceEstimator::new();
        let first = estimator.needed_export_acus(8 * 1024 * 1024 * 1024);
        let second = estimator.needed_export_acus(1024);
        assert!((first - second).abs() < f64::EPSILON);
    }

    #[test]
    fn restore_skips_recomputation() {
        let mut estimator = ResourceEstimator::restore(12.5);
        assert!((estimator.needed_export_acus(1024) - 12.5).abs() < f64::EPSILON);
    }

    #[test]
    fn loads_claim_both_resources() {
        let mut estimator = ResourceEstimator::new();
        let loads = estimator.loads(&stats(2 * 1024 * 1024 * 1024));
        assert_eq!(loads.len(), 2);
        assert_eq!(loads[0].resource, Resource::DbReader);
        assert!((loads[0].estimated_virtual_units - 2.0).abs() < 1e-9);
        assert_eq!(loads[1].resource, Resource::IoOut);
    }
}
