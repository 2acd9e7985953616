//! The selectable balancing strategies and the performance-based scoring
//! coefficients.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalancerStrategy {
    RoundRobin,
    LeastConnections,
    Weighted,
    PerformanceBased,
}

impl Default for BalancerStrategy {
    fn default() -> Self {
        BalancerStrategy::PerformanceBased
    }
}

/// Weights for the performance-based score:
/// `w_lat*(1 - norm(avgResponseTime)) + w_err*(1 - errorRate) + w_health*healthyBit`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceCoefficients {
    pub latency: f64,
    pub error: f64,
    pub health: f64,
}

impl Default for PerformanceCoefficients {
    fn default() -> Self {
        Self {
            latency: 0.5,
            error: 0.3,
            health: 0.2,
        }
    }
}
