use serde::{Deserialize, Serialize};

use crate::types::{Facet, FacetMap};

/// Free-text search input, at most one string per facet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextQuery {
    pub summary: Option<String>,
    pub code: Option<String>,
    pub test_steps: Option<String>,
    pub expected_result: Option<String>,
    pub actual_result: Option<String>,
    pub log_info: Option<String>,
    pub environment: Option<String>,
}

impl TextQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, facet: Facet, text: impl Into<String>) -> Self {
        *self.slot_mut(facet) = Some(text.into());
        self
    }

    pub fn summary(self, text: impl Into<String>) -> Self {
        self.with(Facet::Summary, text)
    }

    pub fn code(self, text: impl Into<String>) -> Self {
        self.with(Facet::Code, text)
    }

    pub fn log_info(self, text: impl Into<String>) -> Self {
        self.with(Facet::LogInfo, text)
    }

    pub fn environment(self, text: impl Into<String>) -> Self {
        self.with(Facet::Environment, text)
    }

    pub fn get(&self, facet: Facet) -> Option<&str> {
        let slot = match facet {
            Facet::Summary => &self.summary,
            Facet::Code => &self.code,
            Facet::TestSteps => &self.test_steps,
            Facet::ExpectedResult => &self.expected_result,
            Facet::ActualResult => &self.actual_result,
            Facet::LogInfo => &self.log_info,
            Facet::Environment => &self.environment,
        };
        slot.as_deref()
    }

    fn slot_mut(&mut self, facet: Facet) -> &mut Option<String> {
        match facet {
            Facet::Summary => &mut self.summary,
            Facet::Code => &mut self.code,
            Facet::TestSteps => &mut self.test_steps,
            Facet::ExpectedResult => &mut self.expected_result,
            Facet::ActualResult => &mut self.actual_result,
            Facet::LogInfo => &mut self.log_info,
            Facet::Environment => &mut self.environment,
        }
    }

    /// Facets with non-blank text, in facet order.
    pub fn supplied(&self) -> Vec<Facet> {
        Facet::ALL
            .into_iter()
            .filter(|facet| self.get(*facet).is_some_and(|t| !t.trim().is_empty()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.supplied().is_empty()
    }

    pub fn to_facet_texts(&self) -> FacetMap<String> {
        self.supplied()
            .into_iter()
            .filter_map(|facet| self.get(facet).map(|t| (facet, t.trim().to_string())))
            .collect()
    }
}
