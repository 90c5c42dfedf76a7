use std::{
    fmt::{self, Display},
    str::FromStr,
};

use serde::Deserialize;

use crate::error::QuakeErr;

/// The scalar quantity a model predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum Target {
    Mag,
    Dep,
    Lon,
    Lat,
}

impl Target {
    pub const ALL: [Target; 4] = [Target::Mag, Target::Dep, Target::Lon, Target::Lat];

    /// The column holding this target in the reference table.
    pub fn reference_column(self) -> &'static str {
        match self {
            Self::Mag => "Mag",
            Self::Dep => "Depth",
            Self::Lon => "Lon",
            Self::Lat => "Lat",
        }
    }

    /// The column holding the ground truth in the exported predictions.
    pub fn output_field(self) -> &'static str {
        match self {
            Self::Mag => "Mag",
            Self::Dep => "Dep",
            Self::Lon => "Lon",
            Self::Lat => "Lat",
        }
    }

    /// Decimals kept for the exported prediction.
    pub fn record_decimals(self) -> u32 {
        match self {
            Self::Mag | Self::Dep => 1,
            Self::Lon | Self::Lat => 3,
        }
    }

    /// Decimals kept for the prediction when computing the test error.
    ///
    /// Coordinates are recorded with 3 decimals but scored with 2.
    pub fn metric_decimals(self) -> u32 {
        match self {
            Self::Mag | Self::Dep => 1,
            Self::Lon | Self::Lat => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Mag => "mag",
            Self::Dep => "dep",
            Self::Lon => "lon",
            Self::Lat => "lat",
        }
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Target {
    type Err = QuakeErr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|target| target.name() == s)
            .ok_or_else(|| QuakeErr::UnsupportedTarget(s.to_string()))
    }
}

impl TryFrom<String> for Target {
    type Error = QuakeErr;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_names() {
        for target in Target::ALL {
            assert_eq!(target.to_string().parse::<Target>().unwrap(), target);
        }

        assert!(matches!(
            "magnitude".parse::<Target>(),
            Err(QuakeErr::UnsupportedTarget(_))
        ));
    }

    #[test]
    fn depth_reads_depth_column_but_writes_dep() {
        assert_eq!(Target::Dep.reference_column(), "Depth");
        assert_eq!(Target::Dep.output_field(), "Dep");
    }

    #[test]
    fn coordinates_are_scored_coarser_than_recorded() {
        assert_eq!(Target::Lon.record_decimals(), 3);
        assert_eq!(Target::Lon.metric_decimals(), 2);
        assert_eq!(Target::Mag.record_decimals(), Target::Mag.metric_decimals());
    }
}
