//! Query classification and weight profiles.
//!
//! A query supplies text (or vectors) for some facets. The classifier names a
//! profile from which facet groups are present, and the profile resolves to
//! per-facet fusion weights.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{KbError, KbResult};
use crate::types::{Facet, FacetGroup, FacetWeights};

/// Named weight profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileName {
    SummaryOnly,
    CodeOnly,
    TestInfoOnly,
    LogInfoOnly,
    EnvironmentOnly,
    Mixed,
    /// Caller supplied explicit weights.
    Custom,
}

impl ProfileName {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ProfileName::SummaryOnly => "summary_only",
            ProfileName::CodeOnly => "code_only",
            ProfileName::TestInfoOnly => "test_info_only",
            ProfileName::LogInfoOnly => "log_info_only",
            ProfileName::EnvironmentOnly => "environment_only",
            ProfileName::Mixed => "mixed",
            ProfileName::Custom => "custom",
        }
    }

    /// The `<group>_only` profile of a single group.
    pub const fn only(group: FacetGroup) -> Self {
        match group {
            FacetGroup::Summary => ProfileName::SummaryOnly,
            FacetGroup::Code => ProfileName::CodeOnly,
            FacetGroup::TestInfo => ProfileName::TestInfoOnly,
            FacetGroup::LogInfo => ProfileName::LogInfoOnly,
            FacetGroup::Environment => ProfileName::EnvironmentOnly,
        }
    }
}

impl fmt::Display for ProfileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfileName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "summary_only" => Ok(ProfileName::SummaryOnly),
            "code_only" => Ok(ProfileName::CodeOnly),
            "test_info_only" | "test_only" => Ok(ProfileName::TestInfoOnly),
            "log_info_only" | "log_only" => Ok(ProfileName::LogInfoOnly),
            "environment_only" | "env_only" => Ok(ProfileName::EnvironmentOnly),
            "mixed" => Ok(ProfileName::Mixed),
            other => Err(format!(
                "unknown profile '{other}'. Expected one of: summary_only, code_only, test_info_only, log_info_only, environment_only, mixed"
            )),
        }
    }
}

/// One weight per facet group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroupWeights {
    #[serde(default)]
    pub summary: f32,
    #[serde(default)]
    pub code: f32,
    #[serde(default)]
    pub test_info: f32,
    #[serde(default)]
    pub log_info: f32,
    #[serde(default)]
    pub environment: f32,
}

impl Default for GroupWeights {
    fn default() -> Self {
        Self::mixed_default()
    }
}

impl GroupWeights {
    /// Defaults for multi-facet queries, skewed toward summary and log text.
    pub const fn mixed_default() -> Self {
        Self {
            summary: 0.2,
            code: 0.25,
            test_info: 0.15,
            log_info: 0.3,
            environment: 0.1,
        }
    }

    pub const fn zero() -> Self {
        Self {
            summary: 0.0,
            code: 0.0,
            test_info: 0.0,
            log_info: 0.0,
            environment: 0.0,
        }
    }

    /// Weight 1.0 on `group`, 0.0 elsewhere.
    pub fn only(group: FacetGroup) -> Self {
        let mut weights = Self::zero();
        weights.set(group, 1.0);
        weights
    }

    pub const fn get(&self, group: FacetGroup) -> f32 {
        match group {
            FacetGroup::Summary => self.summary,
            FacetGroup::Code => self.code,
            FacetGroup::TestInfo => self.test_info,
            FacetGroup::LogInfo => self.log_info,
            FacetGroup::Environment => self.environment,
        }
    }

    pub fn set(&mut self, group: FacetGroup, weight: f32) {
        match group {
            FacetGroup::Summary => self.summary = weight,
            FacetGroup::Code => self.code = weight,
            FacetGroup::TestInfo => self.test_info = weight,
            FacetGroup::LogInfo => self.log_info = weight,
            FacetGroup::Environment => self.environment = weight,
        }
    }

    pub fn sum(&self) -> f32 {
        FacetGroup::ALL.iter().map(|g| self.get(*g)).sum()
    }

    /// Rejects negative or non-finite weights.
    pub fn validate(&self) -> KbResult<()> {
        for group in FacetGroup::ALL {
            validate_weight(group.as_str(), self.get(group))?;
        }
        Ok(())
    }
}

pub(crate) fn validate_weight(target: &str, value: f32) -> KbResult<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(KbError::InvalidWeight {
            target: target.to_string(),
            value,
        });
    }
    Ok(())
}

/// How the caller wants the weights of a search chosen.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum WeightOverride {
    /// Let the classifier pick from the supplied facets.
    #[default]
    Auto,
    Profile(ProfileName),
    Groups(GroupWeights),
    Facets(FacetWeights),
}

/// A profile resolved against a concrete query.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedWeights {
    pub profile: ProfileName,
    pub weights: FacetWeights,
}

/// Maps group weights onto the facets a query supplies.
///
/// A group weight is divided evenly among the group's supplied facets, so a
/// query with all three test narrative fields weighs `test_info / 3` on each.
pub fn distribute(weights: &GroupWeights, supplied: &[Facet]) -> FacetWeights {
    let unique: BTreeSet<Facet> = supplied.iter().copied().collect();
    let mut resolved = FacetWeights::new();
    for facet in &unique {
        let group = facet.group();
        let members = unique.iter().filter(|f| f.group() == group).count();
        resolved.insert(*facet, weights.get(group) / members as f32);
    }
    resolved
}

#[derive(Debug, Clone)]
pub struct QueryClassifier {
    mixed: GroupWeights,
}

impl Default for QueryClassifier {
    fn default() -> Self {
        Self::new(GroupWeights::mixed_default())
    }
}

impl QueryClassifier {
    pub fn new(mixed: GroupWeights) -> Self {
        Self { mixed }
    }

    /// Names the profile for a set of supplied facets.
    ///
    /// Returns `None` when nothing is supplied. A query whose facets all fall
    /// in one group gets that group's `_only` profile; the three test
    /// narrative facets count as the single `test_info` group.
    pub fn classify(&self, supplied: &[Facet]) -> Option<ProfileName> {
        let groups: BTreeSet<FacetGroup> = supplied.iter().map(Facet::group).collect();
        match groups.len() {
            0 => None,
            1 => groups.into_iter().next().map(ProfileName::only),
            _ => Some(ProfileName::Mixed),
        }
    }

    /// Group weights behind a named profile.
    pub fn group_weights(&self, profile: ProfileName) -> GroupWeights {
        match profile {
            ProfileName::SummaryOnly => GroupWeights::only(FacetGroup::Summary),
            ProfileName::CodeOnly => GroupWeights::only(FacetGroup::Code),
            ProfileName::TestInfoOnly => GroupWeights::only(FacetGroup::TestInfo),
            ProfileName::LogInfoOnly => GroupWeights::only(FacetGroup::LogInfo),
            ProfileName::EnvironmentOnly => GroupWeights::only(FacetGroup::Environment),
            ProfileName::Mixed | ProfileName::Custom => self.mixed,
        }
    }

    /// Resolves the active weights for a query. `None` means the query has
    /// no facets and therefore no results.
    pub fn resolve(
        &self,
        supplied: &[Facet],
        weight_override: &WeightOverride,
    ) -> KbResult<Option<ResolvedWeights>> {
        if supplied.is_empty() {
            return Ok(None);
        }

        let resolved = match weight_override {
            WeightOverride::Auto => {
                let Some(profile) = self.classify(supplied) else {
                    return Ok(None);
                };
                ResolvedWeights {
                    profile,
                    weights: distribute(&self.group_weights(profile), supplied),
                }
            }
            WeightOverride::Profile(profile) => ResolvedWeights {
                profile: *profile,
                weights: distribute(&self.group_weights(*profile), supplied),
            },
            WeightOverride::Groups(groups) => {
                groups.validate()?;
                ResolvedWeights {
                    profile: ProfileName::Custom,
                    weights: distribute(groups, supplied),
                }
            }
            WeightOverride::Facets(facets) => {
                for (facet, weight) in facets.iter() {
                    validate_weight(facet.as_str(), *weight)?;
                }
                ResolvedWeights {
                    profile: ProfileName::Custom,
                    weights: supplied
                        .iter()
                        .filter_map(|f| facets.get(*f).map(|w| (*f, *w)))
                        .collect(),
                }
            }
        };
        Ok(Some(resolved))
    }
}
