//! Distribution descriptors for a single hyperparameter.
//!
//! A descriptor is a validated value: every constructor checks its arguments
//! and nothing is clamped. On the wire a descriptor is the two-element array
//! `[tag, [args...]]`, e.g. `["uniform", [0.0, 1.0]]`.

use hd_types::{invalid_argument, HdError, HdResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The sampling distribution of one hyperparameter.
#[derive(Debug, Clone, PartialEq)]
pub enum DistributionKind {
    /// Discrete choice among literal values.
    Choice { values: Vec<Value> },
    /// Integer uniform over `[0, upper)`. Nearby values carry no correlation.
    RandInt { upper: i64 },
    /// Continuous uniform over `[low, high)`.
    Uniform { low: f64, high: f64 },
    /// `round(uniform(low, high) / q) * q`.
    QUniform { low: f64, high: f64, q: f64 },
    /// `exp(uniform(low, high))`; the bounds are exponents.
    LogUniform { low: f64, high: f64 },
    /// `round(exp(uniform(low, high)) / q) * q`.
    QLogUniform { low: f64, high: f64, q: f64 },
    /// Normal with mean `mu` and standard deviation `sigma`.
    Normal { mu: f64, sigma: f64 },
    /// `round(normal(mu, sigma) / q) * q`.
    QNormal { mu: f64, sigma: f64, q: f64 },
    /// `exp(normal(mu, sigma))`.
    LogNormal { mu: f64, sigma: f64 },
    /// `round(exp(normal(mu, sigma)) / q) * q`.
    QLogNormal { mu: f64, sigma: f64, q: f64 },
}

impl DistributionKind {
    /// Wire tag of this distribution.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Choice { .. } => "choice",
            Self::RandInt { .. } => "randint",
            Self::Uniform { .. } => "uniform",
            Self::QUniform { .. } => "quniform",
            Self::LogUniform { .. } => "loguniform",
            Self::QLogUniform { .. } => "qloguniform",
            Self::Normal { .. } => "normal",
            Self::QNormal { .. } => "qnormal",
            Self::LogNormal { .. } => "lognormal",
            Self::QLogNormal { .. } => "qlognormal",
        }
    }
}

/// A validated distribution descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDistribution", into = "RawDistribution")]
pub struct Distribution {
    kind: DistributionKind,
}

impl Distribution {
    /// Validate `kind` and wrap it.
    pub fn new(kind: DistributionKind) -> HdResult<Self> {
        validate(&kind)?;
        Ok(Self { kind })
    }

    pub fn choice<I, V>(values: I) -> HdResult<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::new(DistributionKind::Choice {
            values: values.into_iter().map(Into::into).collect(),
        })
    }

    pub fn randint(upper: i64) -> HdResult<Self> {
        Self::new(DistributionKind::RandInt { upper })
    }

    pub fn uniform(low: f64, high: f64) -> HdResult<Self> {
        Self::new(DistributionKind::Uniform { low, high })
    }

    pub fn quniform(low: f64, high: f64, q: f64) -> HdResult<Self> {
        Self::new(DistributionKind::QUniform { low, high, q })
    }

    pub fn loguniform(low: f64, high: f64) -> HdResult<Self> {
        Self::new(DistributionKind::LogUniform { low, high })
    }

    pub fn qloguniform(low: f64, high: f64, q: f64) -> HdResult<Self> {
        Self::new(DistributionKind::QLogUniform { low, high, q })
    }

    pub fn normal(mu: f64, sigma: f64) -> HdResult<Self> {
        Self::new(DistributionKind::Normal { mu, sigma })
    }

    pub fn qnormal(mu: f64, sigma: f64, q: f64) -> HdResult<Self> {
        Self::new(DistributionKind::QNormal { mu, sigma, q })
    }

    pub fn lognormal(mu: f64, sigma: f64) -> HdResult<Self> {
        Self::new(DistributionKind::LogNormal { mu, sigma })
    }

    pub fn qlognormal(mu: f64, sigma: f64, q: f64) -> HdResult<Self> {
        Self::new(DistributionKind::QLogNormal { mu, sigma, q })
    }

    pub fn kind(&self) -> &DistributionKind {
        &self.kind
    }

    pub fn tag(&self) -> &'static str {
        self.kind.tag()
    }

    /// The literal values of a `Choice`, `None` for every other distribution.
    pub fn choices(&self) -> Option<&[Value]> {
        match &self.kind {
            DistributionKind::Choice { values } => Some(values),
            _ => None,
        }
    }

    /// Draw one value the way the service would.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Value {
        match &self.kind {
            DistributionKind::Choice { values } => values[rng.random_range(0..values.len())].clone(),
            DistributionKind::RandInt { upper } => Value::from(rng.random_range(0..*upper)),
            DistributionKind::Uniform { low, high } => Value::from(rng.random_range(*low..*high)),
            DistributionKind::QUniform { low, high, q } => {
                Value::from(quantize(rng.random_range(*low..*high), *q))
            }
            DistributionKind::LogUniform { low, high } => {
                Value::from(rng.random_range(*low..*high).exp())
            }
            DistributionKind::QLogUniform { low, high, q } => {
                Value::from(quantize(rng.random_range(*low..*high).exp(), *q))
            }
            DistributionKind::Normal { mu, sigma } => Value::from(gaussian(rng, *mu, *sigma)),
            DistributionKind::QNormal { mu, sigma, q } => {
                Value::from(quantize(gaussian(rng, *mu, *sigma), *q))
            }
            DistributionKind::LogNormal { mu, sigma } => {
                Value::from(gaussian(rng, *mu, *sigma).exp())
            }
            DistributionKind::QLogNormal { mu, sigma, q } => {
                Value::from(quantize(gaussian(rng, *mu, *sigma).exp(), *q))
            }
        }
    }
}

fn quantize(x: f64, q: f64) -> f64 {
    (x / q).round() * q
}

/// Box-Muller transform.
fn gaussian<R: Rng + ?Sized>(rng: &mut R, mu: f64, sigma: f64) -> f64 {
    let u1: f64 = 1.0 - rng.random::<f64>();
    let u2: f64 = rng.random::<f64>();
    let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
    mu + sigma * z
}

fn validate(kind: &DistributionKind) -> HdResult<()> {
    let tag = kind.tag();
    match kind {
        DistributionKind::Choice { values } => {
            if values.is_empty() {
                return Err(invalid_argument!("choice needs at least one value"));
            }
        }
        DistributionKind::RandInt { upper } => {
            if *upper <= 0 {
                return Err(invalid_argument!("randint upper must be positive, got {upper}"));
            }
        }
        DistributionKind::Uniform { low, high } => {
            check_range(tag, *low, *high)?;
        }
        DistributionKind::LogUniform { low, high } => {
            check_range(tag, *low, *high)?;
            check_log_upper(tag, *high)?;
        }
        DistributionKind::QUniform { low, high, q } => {
            check_range(tag, *low, *high)?;
            check_q(tag, *q)?;
        }
        DistributionKind::QLogUniform { low, high, q } => {
            check_range(tag, *low, *high)?;
            check_log_upper(tag, *high)?;
            check_q(tag, *q)?;
        }
        DistributionKind::Normal { mu, sigma } | DistributionKind::LogNormal { mu, sigma } => {
            check_gaussian(tag, *mu, *sigma)?;
        }
        DistributionKind::QNormal { mu, sigma, q }
        | DistributionKind::QLogNormal { mu, sigma, q } => {
            check_gaussian(tag, *mu, *sigma)?;
            check_q(tag, *q)?;
        }
    }
    Ok(())
}

fn check_finite(tag: &str, name: &str, value: f64) -> HdResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(invalid_argument!("{tag} {name} must be finite, got {value}"))
    }
}

fn check_range(tag: &str, low: f64, high: f64) -> HdResult<()> {
    check_finite(tag, "low", low)?;
    check_finite(tag, "high", high)?;
    if low >= high {
        return Err(invalid_argument!(
            "{tag} low ({low}) must be less than high ({high})"
        ));
    }
    if !(high - low).is_finite() {
        return Err(invalid_argument!(
            "{tag} range [{low}, {high}] is too wide to sample"
        ));
    }
    Ok(())
}

/// Log-scale bounds are exponents; `exp(high)` must stay finite.
fn check_log_upper(tag: &str, high: f64) -> HdResult<()> {
    if high > f64::MAX.ln() {
        return Err(invalid_argument!(
            "{tag} high ({high}) overflows once exponentiated"
        ));
    }
    Ok(())
}

fn check_q(tag: &str, q: f64) -> HdResult<()> {
    check_finite(tag, "q", q)?;
    if q <= 0.0 {
        return Err(invalid_argument!("{tag} q must be positive, got {q}"));
    }
    Ok(())
}

fn check_gaussian(tag: &str, mu: f64, sigma: f64) -> HdResult<()> {
    check_finite(tag, "mu", mu)?;
    check_finite(tag, "sigma", sigma)?;
    if sigma <= 0.0 {
        return Err(invalid_argument!("{tag} sigma must be positive, got {sigma}"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Wire form
// ---------------------------------------------------------------------------

/// `[tag, [args...]]`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawDistribution(String, Vec<Value>);

impl From<Distribution> for RawDistribution {
    fn from(distribution: Distribution) -> Self {
        let tag = distribution.tag().to_string();
        let args = match distribution.kind {
            DistributionKind::Choice { values } => vec![Value::Array(values)],
            DistributionKind::RandInt { upper } => vec![Value::from(upper)],
            DistributionKind::Uniform { low, high } | DistributionKind::LogUniform { low, high } => {
                vec![Value::from(low), Value::from(high)]
            }
            DistributionKind::QUniform { low, high, q }
            | DistributionKind::QLogUniform { low, high, q } => {
                vec![Value::from(low), Value::from(high), Value::from(q)]
            }
            DistributionKind::Normal { mu, sigma } | DistributionKind::LogNormal { mu, sigma } => {
                vec![Value::from(mu), Value::from(sigma)]
            }
            DistributionKind::QNormal { mu, sigma, q }
            | DistributionKind::QLogNormal { mu, sigma, q } => {
                vec![Value::from(mu), Value::from(sigma), Value::from(q)]
            }
        };
        RawDistribution(tag, args)
    }
}

impl TryFrom<RawDistribution> for Distribution {
    type Error = HdError;

    fn try_from(RawDistribution(tag, mut args): RawDistribution) -> HdResult<Self> {
        let kind = match tag.as_str() {
            "choice" => match (args.len(), args.pop()) {
                (1, Some(Value::Array(values))) => DistributionKind::Choice { values },
                _ => return Err(invalid_argument!("choice expects a single list of values")),
            },
            "randint" => {
                let upper = match args.as_slice() {
                    [upper] => upper
                        .as_i64()
                        .ok_or_else(|| invalid_argument!("randint upper must be an integer"))?,
                    _ => return Err(invalid_argument!("randint expects 1 argument")),
                };
                DistributionKind::RandInt { upper }
            }
            "uniform" => {
                let [low, high] = floats::<2>(&tag, &args)?;
                DistributionKind::Uniform { low, high }
            }
            "quniform" => {
                let [low, high, q] = floats::<3>(&tag, &args)?;
                DistributionKind::QUniform { low, high, q }
            }
            "loguniform" => {
                let [low, high] = floats::<2>(&tag, &args)?;
                DistributionKind::LogUniform { low, high }
            }
            "qloguniform" => {
                let [low, high, q] = floats::<3>(&tag, &args)?;
                DistributionKind::QLogUniform { low, high, q }
            }
            "normal" => {
                let [mu, sigma] = floats::<2>(&tag, &args)?;
                DistributionKind::Normal { mu, sigma }
            }
            "qnormal" => {
                let [mu, sigma, q] = floats::<3>(&tag, &args)?;
                DistributionKind::QNormal { mu, sigma, q }
            }
            "lognormal" => {
                let [mu, sigma] = floats::<2>(&tag, &args)?;
                DistributionKind::LogNormal { mu, sigma }
            }
            "qlognormal" => {
                let [mu, sigma, q] = floats::<3>(&tag, &args)?;
                DistributionKind::QLogNormal { mu, sigma, q }
            }
            other => return Err(invalid_argument!("unknown distribution tag '{other}'")),
        };
        Distribution::new(kind)
    }
}

fn floats<const N: usize>(tag: &str, args: &[Value]) -> HdResult<[f64; N]> {
    if args.len() != N {
        return Err(invalid_argument!(
            "{tag} expects {N} arguments, got {}",
            args.len()
        ));
    }
    let mut out = [0.0; N];
    for (slot, arg) in out.iter_mut().zip(args) {
        *slot = arg
            .as_f64()
            .ok_or_else(|| invalid_argument!("{tag} arguments must be numbers, got {arg}"))?;
    }
    Ok(out)
}
