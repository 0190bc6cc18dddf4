use serde::{Deserialize, Serialize};

use crate::error::MetricError;

/// The two metric kinds understood end to end.
///
/// # Examples
///
/// ```
/// use telemon_common::types::MetricKind;
///
/// let kind: MetricKind = "counter".parse().unwrap();
/// assert_eq!(kind, MetricKind::Counter);
/// assert_eq!(kind.to_string(), "counter");
/// assert!("Counter".parse::<MetricKind>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MetricKind {
    type Err = MetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauge" => Ok(MetricKind::Gauge),
            "counter" => Ok(MetricKind::Counter),
            _ => Err(MetricError::UnknownKind(s.to_string())),
        }
    }
}

/// A single named measurement as it travels over the wire and sits in
/// storage.
///
/// Gauges carry `value` and are overwritten on every write. Counters carry
/// `delta` and accumulate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub id: String,
    #[serde(rename = "type", alias = "kind")]
    pub kind: MetricKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl Metric {
    pub fn gauge(id: impl Into<String>, value: f64) -> Self {
        Self {
            id: id.into(),
            kind: MetricKind::Gauge,
            delta: None,
            value: Some(value),
        }
    }

    pub fn counter(id: impl Into<String>, delta: i64) -> Self {
        Self {
            id: id.into(),
            kind: MetricKind::Counter,
            delta: Some(delta),
            value: None,
        }
    }

    /// Builds a metric from the textual form used by the path-parameter
    /// update route (`/update/{kind}/{id}/{value}`).
    ///
    /// # Errors
    ///
    /// Returns [`MetricError`] when the kind is unknown, the value does not
    /// parse as the kind's number type, or the result fails [`validate`].
    ///
    /// [`validate`]: Metric::validate
    pub fn parse(kind: &str, id: &str, raw: &str) -> Result<Self, MetricError> {
        let kind: MetricKind = kind.parse()?;
        let invalid = || MetricError::InvalidValue {
            kind,
            raw: raw.to_string(),
        };
        let metric = match kind {
            MetricKind::Gauge => {
                let value: f64 = raw.parse().map_err(|_| invalid())?;
                Metric::gauge(id, value)
            }
            MetricKind::Counter => Metric::counter(id, raw.parse().map_err(|_| invalid())?),
        };
        metric.validate()?;
        Ok(metric)
    }

    /// Checks that the id is present and that exactly the field matching
    /// `kind` is populated. Gauge values must be finite, since JSON has no
    /// encoding for NaN or infinities.
    pub fn validate(&self) -> Result<(), MetricError> {
        if self.id.is_empty() {
            return Err(MetricError::EmptyId);
        }
        match self.kind {
            MetricKind::Gauge => {
                if self.delta.is_some() {
                    return Err(self.unexpected("delta"));
                }
                match self.value {
                    None => return Err(MetricError::MissingValue(self.id.clone())),
                    Some(v) if !v.is_finite() => {
                        return Err(MetricError::InvalidValue {
                            kind: self.kind,
                            raw: v.to_string(),
                        })
                    }
                    Some(_) => {}
                }
            }
            MetricKind::Counter => {
                if self.value.is_some() {
                    return Err(self.unexpected("value"));
                }
                if self.delta.is_none() {
                    return Err(MetricError::MissingDelta(self.id.clone()));
                }
            }
        }
        Ok(())
    }

    fn unexpected(&self, field: &'static str) -> MetricError {
        MetricError::UnexpectedField {
            id: self.id.clone(),
            kind: self.kind,
            field,
        }
    }

    /// Plain-text rendering of the stored number: the shortest decimal that
    /// round-trips for gauges, a base-10 integer for counters. Empty when the
    /// matching field is absent.
    pub fn display_value(&self) -> String {
        match self.kind {
            MetricKind::Gauge => self.value.map(|v| v.to_string()).unwrap_or_default(),
            MetricKind::Counter => self.delta.map(|d| d.to_string()).unwrap_or_default(),
        }
    }
}
