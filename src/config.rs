//! Sweep configuration.

use crate::sweep_error::SweepError;
use serde::{Deserialize, Serialize};

/// Policy deciding which ready angle set executes next.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulingAlgorithm {
    /// Advance angle-set groups in fixed order until all are finished.
    FirstInFirstOut,
    /// Priority order by depth in the task dependency graph, then octant.
    #[default]
    DepthOfGraph,
}

/// How quadrature angles are grouped into angle sets.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AngleAggregationType {
    /// One angle per angle set.
    #[default]
    Single,
    /// Angles sharing an (x, y) projection share an angle set; requires
    /// faces with no z-component in their normals.
    Polar,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub scheduling_algorithm: SchedulingAlgorithm,
    pub angle_aggregation: AngleAggregationType,
    /// Break cycles in the dependency graphs instead of failing.
    pub allow_cycles: bool,
    /// Largest sweep message, in bytes, before data is split.
    pub eager_limit_bytes: usize,
    pub num_group_subsets: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            scheduling_algorithm: SchedulingAlgorithm::DepthOfGraph,
            angle_aggregation: AngleAggregationType::Single,
            allow_cycles: true,
            eager_limit_bytes: 32000,
            num_group_subsets: 1,
        }
    }
}

impl SweepConfig {
    pub fn validate(&self) -> Result<(), SweepError> {
        if self.eager_limit_bytes < std::mem::size_of::<f64>() {
            return Err(SweepError::Config(format!(
                "eager limit of {} bytes cannot hold one value",
                self.eager_limit_bytes
            )));
        }
        if self.num_group_subsets == 0 {
            return Err(SweepError::Config("at least one group subset is required".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(SweepConfig::default().validate().is_ok());
        let bad = SweepConfig {
            num_group_subsets: 0,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(SweepError::Config(_))));
    }
}
