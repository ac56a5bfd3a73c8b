//! Core identifiers shared by every layer: row ids, facets and facet-keyed maps.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of independently indexed facets.
pub const FACET_COUNT: usize = 7;

/// Dense record identifier allocated by the metadata store.
///
/// Row ids start at zero, grow strictly and are never reused, even after a
/// record has been retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(pub u32);

impl RowId {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u32 {
        self.0
    }

    /// Slot index inside dense per-facet storage.
    pub const fn as_index(&self) -> usize {
        self.0 as usize
    }

    /// The key under which the metadata file stores this row.
    pub fn to_key(&self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RowId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u32>().map(Self)
    }
}

/// A searchable facet of a defect report. Each facet owns one ANN index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Facet {
    Summary,
    Code,
    TestSteps,
    ExpectedResult,
    ActualResult,
    LogInfo,
    Environment,
}

impl Facet {
    /// All facets in index order.
    pub const ALL: [Facet; FACET_COUNT] = [
        Facet::Summary,
        Facet::Code,
        Facet::TestSteps,
        Facet::ExpectedResult,
        Facet::ActualResult,
        Facet::LogInfo,
        Facet::Environment,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Facet::Summary => "summary",
            Facet::Code => "code",
            Facet::TestSteps => "test_steps",
            Facet::ExpectedResult => "expected_result",
            Facet::ActualResult => "actual_result",
            Facet::LogInfo => "log_info",
            Facet::Environment => "environment",
        }
    }

    /// Position of this facet in [`Facet::ALL`].
    pub const fn index(&self) -> usize {
        match self {
            Facet::Summary => 0,
            Facet::Code => 1,
            Facet::TestSteps => 2,
            Facet::ExpectedResult => 3,
            Facet::ActualResult => 4,
            Facet::LogInfo => 5,
            Facet::Environment => 6,
        }
    }

    /// Weight group this facet belongs to.
    pub const fn group(&self) -> FacetGroup {
        match self {
            Facet::Summary => FacetGroup::Summary,
            Facet::Code => FacetGroup::Code,
            Facet::TestSteps | Facet::ExpectedResult | Facet::ActualResult => FacetGroup::TestInfo,
            Facet::LogInfo => FacetGroup::LogInfo,
            Facet::Environment => FacetGroup::Environment,
        }
    }

    /// File name of this facet's canonical index snapshot.
    pub fn index_file_name(&self) -> String {
        format!("{}.forest", self.as_str())
    }
}

impl fmt::Display for Facet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Facet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Facet::ALL
            .into_iter()
            .find(|facet| facet.as_str() == normalized)
            .ok_or_else(|| {
                format!(
                    "unknown facet '{s}'. Expected one of: {}",
                    Facet::ALL.map(|f| f.as_str()).join(", ")
                )
            })
    }
}

/// Weight key of a profile. The three test narrative facets share one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacetGroup {
    Summary,
    Code,
    TestInfo,
    LogInfo,
    Environment,
}

impl FacetGroup {
    pub const ALL: [FacetGroup; 5] = [
        FacetGroup::Summary,
        FacetGroup::Code,
        FacetGroup::TestInfo,
        FacetGroup::LogInfo,
        FacetGroup::Environment,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            FacetGroup::Summary => "summary",
            FacetGroup::Code => "code",
            FacetGroup::TestInfo => "test_info",
            FacetGroup::LogInfo => "log_info",
            FacetGroup::Environment => "environment",
        }
    }

    /// Facets whose weight comes from this group.
    pub fn facets(&self) -> impl Iterator<Item = Facet> + '_ {
        Facet::ALL.into_iter().filter(move |f| f.group() == *self)
    }
}

impl fmt::Display for FacetGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-size map keyed by [`Facet`].
#[derive(Debug, Clone, PartialEq)]
pub struct FacetMap<T> {
    slots: [Option<T>; FACET_COUNT],
}

impl<T> Default for FacetMap<T> {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }
}

impl<T> FacetMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, facet: Facet) -> Option<&T> {
        self.slots[facet.index()].as_ref()
    }

    pub fn insert(&mut self, facet: Facet, value: T) -> Option<T> {
        self.slots[facet.index()].replace(value)
    }

    pub fn remove(&mut self, facet: Facet) -> Option<T> {
        self.slots[facet.index()].take()
    }

    pub fn with(mut self, facet: Facet, value: T) -> Self {
        self.insert(facet, value);
        self
    }

    pub fn contains(&self, facet: Facet) -> bool {
        self.slots[facet.index()].is_some()
    }

    /// Populated entries in facet order.
    pub fn iter(&self) -> impl Iterator<Item = (Facet, &T)> {
        Facet::ALL
            .into_iter()
            .filter_map(|facet| self.get(facet).map(|value| (facet, value)))
    }

    pub fn facets(&self) -> impl Iterator<Item = Facet> + '_ {
        self.iter().map(|(facet, _)| facet)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> FromIterator<(Facet, T)> for FacetMap<T> {
    fn from_iter<I: IntoIterator<Item = (Facet, T)>>(iter: I) -> Self {
        let mut map = Self::default();
        for (facet, value) in iter {
            map.insert(facet, value);
        }
        map
    }
}

/// One embedding per populated facet of a record or query.
pub type FacetVectors = FacetMap<Vec<f32>>;

/// Per-facet fusion weights. Absent facets weigh zero.
pub type FacetWeights = FacetMap<f32>;

impl FacetMap<f32> {
    pub fn weight(&self, facet: Facet) -> f32 {
        self.get(facet).copied().unwrap_or(0.0)
    }
}
