//! Parameter spaces and the sampling strategies that search them.

use hd_types::{invalid_argument, HdError, HdResult};
use rand::Rng;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use crate::distribution::{Distribution, DistributionKind};

/// One concrete hyperparameter assignment for a child run.
pub type ParameterAssignment = HashMap<String, Value>;

/// Named distributions, kept in declaration order.
///
/// Names are unique: inserting an existing name replaces its distribution in
/// place.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParameterSpace {
    entries: Vec<(String, Distribution)>,
}

impl ParameterSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, distribution: Distribution) -> Self {
        self.insert(name, distribution);
        self
    }

    /// Insert or replace, returning the previous distribution for `name`.
    pub fn insert(&mut self, name: impl Into<String>, distribution: Distribution) -> Option<Distribution> {
        let name = name.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => Some(std::mem::replace(slot, distribution)),
            None => {
                self.entries.push((name, distribution));
                None
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Distribution> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, d)| d)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Distribution)> {
        self.entries.iter().map(|(name, d)| (name.as_str(), d))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, Distribution)> for ParameterSpace {
    fn from_iter<I: IntoIterator<Item = (S, Distribution)>>(iter: I) -> Self {
        let mut space = ParameterSpace::new();
        for (name, distribution) in iter {
            space.insert(name, distribution);
        }
        space
    }
}

impl Serialize for ParameterSpace {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, distribution) in &self.entries {
            map.serialize_entry(name, distribution)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ParameterSpace {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SpaceVisitor;

        impl<'de> Visitor<'de> for SpaceVisitor {
            type Value = ParameterSpace;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map from parameter name to distribution")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut space = ParameterSpace::new();
                while let Some((name, distribution)) = access.next_entry::<String, Distribution>()? {
                    if space.get(&name).is_some() {
                        return Err(serde::de::Error::custom(format!(
                            "duplicate parameter '{name}'"
                        )));
                    }
                    space.insert(name, distribution);
                }
                Ok(space)
            }
        }

        deserializer.deserialize_map(SpaceVisitor)
    }
}

// ---------------------------------------------------------------------------
// Sampling strategies
// ---------------------------------------------------------------------------

/// How the service picks assignments across child runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SamplingMethod {
    #[serde(rename = "RANDOM")]
    Random,
    #[serde(rename = "GRID")]
    Grid,
    #[serde(rename = "BAYESIANOPTIMIZATION")]
    Bayesian,
}

impl SamplingMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            SamplingMethod::Random => "RANDOM",
            SamplingMethod::Grid => "GRID",
            SamplingMethod::Bayesian => "BAYESIANOPTIMIZATION",
        }
    }

    /// Whether this method can search a parameter drawn from `distribution`.
    ///
    /// Grid needs a finite space, so only `choice`. Bayesian takes `choice`
    /// and the continuous families except `qlognormal`.
    pub fn accepts(self, distribution: &Distribution) -> bool {
        match self {
            SamplingMethod::Random => true,
            SamplingMethod::Grid => matches!(distribution.kind(), DistributionKind::Choice { .. }),
            SamplingMethod::Bayesian => !matches!(
                distribution.kind(),
                DistributionKind::RandInt { .. } | DistributionKind::QLogNormal { .. }
            ),
        }
    }
}

impl fmt::Display for SamplingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sampling method bound to a parameter space it is able to search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SearchSpaceDescriptor", into = "SearchSpaceDescriptor")]
pub struct SamplingStrategy {
    method: SamplingMethod,
    space: ParameterSpace,
}

impl SamplingStrategy {
    /// Check every entry of `space` against `method` and bind them together.
    pub fn build(method: SamplingMethod, space: ParameterSpace) -> HdResult<Self> {
        if space.is_empty() {
            return Err(invalid_argument!("parameter space must define at least one parameter"));
        }
        if let Some((name, distribution)) = space.iter().find(|(_, d)| !method.accepts(d)) {
            return Err(HdError::UnsupportedDistributionForStrategy {
                parameter: name.to_string(),
                distribution: distribution.tag().to_string(),
                strategy: method.as_str().to_string(),
            });
        }
        Ok(Self { method, space })
    }

    pub fn random(space: ParameterSpace) -> HdResult<Self> {
        Self::build(SamplingMethod::Random, space)
    }

    pub fn grid(space: ParameterSpace) -> HdResult<Self> {
        Self::build(SamplingMethod::Grid, space)
    }

    pub fn bayesian(space: ParameterSpace) -> HdResult<Self> {
        Self::build(SamplingMethod::Bayesian, space)
    }

    pub fn method(&self) -> SamplingMethod {
        self.method
    }

    pub fn space(&self) -> &ParameterSpace {
        &self.space
    }

    /// Number of grid points, or `None` if any parameter is not a `choice`.
    pub fn grid_size(&self) -> Option<usize> {
        let mut total: usize = 1;
        for (_, distribution) in self.space.iter() {
            total = total.checked_mul(distribution.choices()?.len())?;
        }
        Some(total)
    }

    /// Every grid point, first-declared parameter varying slowest.
    pub fn grid_points(&self) -> HdResult<Vec<ParameterAssignment>> {
        let mut result: Vec<ParameterAssignment> = vec![HashMap::new()];
        for (name, distribution) in self.space.iter() {
            let values = distribution.choices().ok_or_else(|| {
                invalid_argument!("parameter '{name}' is not a choice; the space has no finite grid")
            })?;
            let mut next = Vec::with_capacity(result.len() * values.len());
            for existing in &result {
                for value in values {
                    let mut combo = existing.clone();
                    combo.insert(name.to_string(), value.clone());
                    next.push(combo);
                }
            }
            result = next;
        }
        Ok(result)
    }

    /// Draw one independent assignment from the space.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParameterAssignment {
        self.space
            .iter()
            .map(|(name, distribution)| (name.to_string(), distribution.sample(rng)))
            .collect()
    }
}

/// Wire form: `{"parameter_space": {...}, "sampling_method": "RANDOM"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SearchSpaceDescriptor {
    parameter_space: ParameterSpace,
    sampling_method: SamplingMethod,
}

impl From<SamplingStrategy> for SearchSpaceDescriptor {
    fn from(strategy: SamplingStrategy) -> Self {
        Self {
            parameter_space: strategy.space,
            sampling_method: strategy.method,
        }
    }
}

impl TryFrom<SearchSpaceDescriptor> for SamplingStrategy {
    type Error = HdError;

    fn try_from(descriptor: SearchSpaceDescriptor) -> HdResult<Self> {
        SamplingStrategy::build(descriptor.sampling_method, descriptor.parameter_space)
    }
}
