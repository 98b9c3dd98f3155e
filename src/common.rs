//! Domain types shared by the coordinator components.

use derive_more::{AsRef, Display, From, Into};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The id of a round. Round ids increase monotonically, also across restarts.
pub type RoundId = u64;

/// An opaque client identifier.
///
/// The id is chosen by the client and vetted by the admission policy before the client is
/// registered. It is the key for all per-client accounting (reputation, privacy spend).
#[derive(
    AsRef, Clone, Debug, Display, Eq, From, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identifies a single registration of a client. A client that reconnects gets a new session.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

/// The version of the global state schema. Contributions are only valid against the schema
/// version they were computed for.
#[derive(
    Clone, Copy, Debug, Display, Eq, From, Hash, Into, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SchemaVersion(u32);

impl SchemaVersion {
    pub const INITIAL: SchemaVersion = SchemaVersion(1);

    /// Returns the version following this one.
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

/// The declared compute class of a client.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeClass {
    #[display(fmt = "low")]
    Low,
    #[display(fmt = "medium")]
    Medium,
    #[display(fmt = "high")]
    High,
}

impl Default for ComputeClass {
    fn default() -> Self {
        ComputeClass::Medium
    }
}

/// The capabilities a client declares when it registers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Number of samples in the client's local dataset.
    pub dataset_size: u64,
    #[serde(default)]
    pub compute_class: ComputeClass,
}

/// An element-wise update a client proposes to apply to the global state.
#[derive(AsRef, Clone, Debug, Default, From, Into, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelDelta(Vec<f64>);

impl ModelDelta {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.0
    }

    /// Checks that every element is a finite number.
    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|x| x.is_finite())
    }

    /// Euclidean norm of the delta.
    pub fn l2_norm(&self) -> f64 {
        l2_norm(&self.0)
    }
}

/// The model state shared by all clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GlobalState {
    /// Schema version the weights conform to.
    pub version: SchemaVersion,
    /// The round that produced this state, `0` for the initial state.
    pub round_id: RoundId,
    pub weights: Vec<f64>,
}

impl GlobalState {
    /// Creates an all-zero state of the given length.
    pub fn zeroed(version: SchemaVersion, length: usize) -> Self {
        Self {
            version,
            round_id: 0,
            weights: vec![0.0; length],
        }
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Euclidean distance to another state of the same length.
    pub fn distance(&self, other: &GlobalState) -> f64 {
        euclidean_distance(&self.weights, &other.weights)
    }
}

/// Euclidean norm of a vector.
pub fn l2_norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Euclidean distance between two vectors. Extra elements of the longer vector are ignored.
pub fn euclidean_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// Cosine similarity in `[-1, 1]`, or `0` if either vector is zero.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    let norm = l2_norm(a) * l2_norm(b);
    if norm == 0.0 || !norm.is_finite() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    (dot / norm).max(-1.0).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_norm_and_distance() {
        assert_eq!(l2_norm(&[3.0, 4.0]), 5.0);
        assert_eq!(euclidean_distance(&[1.0, 1.0], &[4.0, 5.0]), 5.0);

        let a = GlobalState::zeroed(SchemaVersion::INITIAL, 2);
        let mut b = a.clone();
        b.weights = vec![0.0, 2.0];
        assert_eq!(a.distance(&b), 2.0);
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-12);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-12);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_schema_version_next() {
        assert_eq!(SchemaVersion::INITIAL.next(), SchemaVersion::from(2));
    }

    #[test]
    fn test_capabilities_default_compute_class() {
        let caps: Capabilities = serde_json::from_str(r#"{"dataset_size": 12}"#).unwrap();
        assert_eq!(caps.compute_class, ComputeClass::Medium);
        assert_eq!(caps.dataset_size, 12);
    }
}
