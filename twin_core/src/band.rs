use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::BandThresholds;

/// Congestion level of a predicted vehicle count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CongestionBand {
    FreeFlow,
    Moderate,
    Severe,
}

impl CongestionBand {
    /// `count <= moderate_above` is free flow, `<= severe_above` moderate,
    /// above that severe.
    pub fn classify(count: u32, thresholds: &BandThresholds) -> Self {
        if count <= thresholds.moderate_above {
            CongestionBand::FreeFlow
        } else if count <= thresholds.severe_above {
            CongestionBand::Moderate
        } else {
            CongestionBand::Severe
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CongestionBand::FreeFlow => "Free Flow",
            CongestionBand::Moderate => "Moderate",
            CongestionBand::Severe => "Severe",
        }
    }
}

impl fmt::Display for CongestionBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundaries() {
        let t = BandThresholds::default();
        assert_eq!(CongestionBand::classify(0, &t), CongestionBand::FreeFlow);
        assert_eq!(CongestionBand::classify(100, &t), CongestionBand::FreeFlow);
        assert_eq!(CongestionBand::classify(101, &t), CongestionBand::Moderate);
        assert_eq!(CongestionBand::classify(200, &t), CongestionBand::Moderate);
        assert_eq!(CongestionBand::classify(201, &t), CongestionBand::Severe);
        assert_eq!(CongestionBand::classify(u32::MAX, &t), CongestionBand::Severe);
    }

    #[test]
    fn test_bands_are_monotonic() {
        let t = BandThresholds {
            moderate_above: 7,
            severe_above: 13,
        };
        let bands: Vec<_> = (0..50).map(|c| CongestionBand::classify(c, &t)).collect();
        assert!(bands.windows(2).all(|w| w[0] <= w[1]));
        assert!(bands.contains(&CongestionBand::FreeFlow));
        assert!(bands.contains(&CongestionBand::Moderate));
        assert!(bands.contains(&CongestionBand::Severe));
    }

    #[test]
    fn test_labels() {
        assert_eq!(CongestionBand::FreeFlow.to_string(), "Free Flow");
        assert_eq!(
            serde_json::to_string(&CongestionBand::Severe).unwrap(),
            "\"Severe\""
        );
    }
}
