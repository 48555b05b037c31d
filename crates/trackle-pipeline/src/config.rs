//! Pipeline configuration: stage identifiers, lock levels, method keys,
//! and the nested configuration document.
//!
//! The document is a mapping keyed by stage name. Each stage holds a
//! `<stage>_method` ordered list of active step identifiers plus one
//! sub-mapping per distinct step identifier holding that step's
//! parameters:
//!
//! ```json
//! {
//!   "track": {
//!     "track_method": ["centroid"],
//!     "centroid": {}
//!   },
//!   "postprocess": {
//!     "postprocess_method": ["rolling_mean", "rolling_mean*1"],
//!     "rolling_mean": { "column": "x", "span": 5, "output": "x_mean" },
//!     "rolling_mean*1": { "column": "y", "span": 5, "output": "y_mean" }
//!   }
//! }
//! ```
//!
//! A step may appear several times in one chain; repeats are addressed as
//! `name*1`, `name*2`, … The un-suffixed block seeds any repeat that has
//! no block of its own. Documents round-trip: load → save → load yields an
//! equal document (order preserved via `IndexMap`).

use std::fmt;

use indexmap::IndexMap;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Free-form parameter block for one configured step.
pub type Params = IndexMap<String, serde_json::Value>;

/// Errors raised while reading a configuration document.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The document is not valid JSON.
    #[error("failed to parse configuration document: {0}")]
    Parse(#[from] serde_json::Error),

    /// The document names a stage this pipeline does not have.
    #[error("unknown stage '{name}' in configuration document")]
    UnknownStage {
        /// The offending stage key.
        name: String,
    },

    /// A method-list entry is not a valid `name` / `name*N` identifier.
    #[error("invalid method identifier '{entry}': {detail}")]
    BadMethodEntry {
        /// The offending entry.
        entry: String,
        /// What was wrong with it.
        detail: String,
    },

    /// A step parameter block is not a mapping.
    #[error("step block '{key}' in stage '{stage}' is not a mapping")]
    NotAMapping {
        /// Stage holding the block.
        stage: String,
        /// The offending key.
        key: String,
    },
}

// ─────────────────────────── Stage identifiers ───────────────────────────

/// One phase of the pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageKind {
    /// Region-of-interest and mask selection on raw frames.
    Crop,
    /// Image preparation ahead of detection.
    Preprocess,
    /// Per-frame particle detection (frames -> detection rows).
    Track,
    /// Trajectory linking (detections -> stable particle identities).
    Link,
    /// Derived columns: windowed and spatial quantities.
    Postprocess,
    /// Overlay rendering for display.
    Annotate,
}

impl StageKind {
    /// All stages in pipeline order.
    pub const ALL: [Self; 6] = [
        Self::Crop,
        Self::Preprocess,
        Self::Track,
        Self::Link,
        Self::Postprocess,
        Self::Annotate,
    ];

    /// Lower-case stage name, used as the document key and store suffix.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Crop => "crop",
            Self::Preprocess => "preprocess",
            Self::Track => "track",
            Self::Link => "link",
            Self::Postprocess => "postprocess",
            Self::Annotate => "annotate",
        }
    }

    /// Zero-based position in pipeline order.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Crop => 0,
            Self::Preprocess => 1,
            Self::Track => 2,
            Self::Link => 3,
            Self::Postprocess => 4,
            Self::Annotate => 5,
        }
    }

    /// The document key of this stage's ordered method list.
    #[must_use]
    pub fn method_list_key(self) -> String {
        format!("{}_method", self.name())
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|stage| stage.name() == name)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ───────────────────────────── Lock levels ───────────────────────────────

/// The highest stage whose committed output is frozen during preview.
///
/// Stages covered by the lock are skipped on single-frame re-evaluation
/// and their committed store is read as-is; stages above it run against a
/// temporary store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
    /// Nothing is frozen; every enabled stage recomputes.
    #[default]
    Unlocked,
    /// Crop, Preprocess and Track are frozen; the committed track store
    /// is authoritative.
    TrackLocked,
    /// Everything through Link is frozen; the committed link store is
    /// authoritative.
    LinkLocked,
}

impl LockLevel {
    /// Whether `stage` is at or below this lock level (frozen).
    #[must_use]
    pub fn covers(self, stage: StageKind) -> bool {
        let highest = match self {
            Self::Unlocked => return false,
            Self::TrackLocked => StageKind::Track,
            Self::LinkLocked => StageKind::Link,
        };
        stage.index() <= highest.index()
    }
}

/// Which part of the sequence an invocation operates on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FrameSelector {
    /// Whole-sequence batch execution.
    #[default]
    Whole,
    /// Single-frame interactive re-evaluation of the given focus frame.
    Single(u64),
}

// ───────────────────────────── Method keys ───────────────────────────────

/// A configured step identifier: a base method name plus a call index.
///
/// The first occurrence of a method in a chain is addressed by its bare
/// name (`call == 0`); repeats are `name*1`, `name*2`, … Registry lookup
/// uses the base name; configuration lookup uses the full string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodKey {
    base: String,
    call: usize,
}

impl MethodKey {
    /// Key for the first occurrence of `base`.
    #[must_use]
    pub fn new(base: &str) -> Self {
        Self {
            base: base.to_owned(),
            call: 0,
        }
    }

    /// Key for a repeated occurrence (`call` >= 1 renders as `base*call`).
    #[must_use]
    pub fn repeat(base: &str, call: usize) -> Self {
        Self {
            base: base.to_owned(),
            call,
        }
    }

    /// Parse `name` or `name*N` (N a positive integer).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BadMethodEntry`] for an empty base name or a
    /// malformed call index.
    pub fn parse(entry: &str) -> Result<Self, ConfigError> {
        let (base, call) = match entry.split_once('*') {
            None => (entry, 0),
            Some((base, suffix)) => {
                let call: usize = suffix.parse().map_err(|_| ConfigError::BadMethodEntry {
                    entry: entry.to_owned(),
                    detail: format!("call index '{suffix}' is not an integer"),
                })?;
                if call == 0 {
                    return Err(ConfigError::BadMethodEntry {
                        entry: entry.to_owned(),
                        detail: "call index must be a positive integer".to_owned(),
                    });
                }
                (base, call)
            }
        };
        if base.is_empty() {
            return Err(ConfigError::BadMethodEntry {
                entry: entry.to_owned(),
                detail: "empty method name".to_owned(),
            });
        }
        Ok(Self {
            base: base.to_owned(),
            call,
        })
    }

    /// Base method name, used for registry lookup.
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Call index: 0 for the first occurrence, N for `base*N`.
    #[must_use]
    pub const fn call(&self) -> usize {
        self.call
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.call == 0 {
            f.write_str(&self.base)
        } else {
            write!(f, "{}*{}", self.base, self.call)
        }
    }
}

// ──────────────────────── Configuration document ─────────────────────────

/// Configuration for one stage: the ordered method chain plus parameter
/// blocks keyed by full step identifier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageConfig {
    /// Active steps, in invocation order.
    pub methods: Vec<MethodKey>,
    /// Parameter blocks, keyed by full step identifier (`name` or
    /// `name*N`).
    pub params: IndexMap<String, Params>,
}

/// The whole configuration document, keyed by stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineConfig {
    stages: IndexMap<StageKind, StageConfig>,
}

impl PipelineConfig {
    /// An empty document: every chain is empty.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The configuration block for `stage`, if the document has one.
    #[must_use]
    pub fn stage(&self, stage: StageKind) -> Option<&StageConfig> {
        self.stages.get(&stage)
    }

    /// The ordered method chain for `stage` (empty when unconfigured).
    #[must_use]
    pub fn chain(&self, stage: StageKind) -> &[MethodKey] {
        self.stages
            .get(&stage)
            .map_or(&[], |config| config.methods.as_slice())
    }

    /// Resolve the parameter block for one step of one stage.
    ///
    /// Lookup tries the full identifier first (`name*N`), then falls back
    /// to the un-suffixed base block — the base configuration seeds
    /// repeats that have no block of their own. Returns a copy: steps
    /// never see (or mutate) the shared document.
    #[must_use]
    pub fn resolved_params(&self, stage: StageKind, key: &MethodKey) -> Params {
        let Some(config) = self.stages.get(&stage) else {
            return Params::new();
        };
        config
            .params
            .get(&key.to_string())
            .or_else(|| config.params.get(key.base()))
            .cloned()
            .unwrap_or_default()
    }

    /// Largest `span` parameter across the active steps of `stage`.
    ///
    /// Used to size the context window loaded for single-frame preview;
    /// 0 when no active step declares a span.
    #[must_use]
    pub fn max_span(&self, stage: StageKind) -> u64 {
        self.chain(stage)
            .iter()
            .filter_map(|key| {
                self.resolved_params(stage, key)
                    .get("span")
                    .and_then(serde_json::Value::as_u64)
            })
            .max()
            .unwrap_or(0)
    }

    /// Append a step (with parameters) to a stage's chain.
    ///
    /// Repeated base names receive the next free call index, matching how
    /// a front-end appends duplicate steps.
    pub fn push_step(&mut self, stage: StageKind, base: &str, params: Params) {
        let config = self.stages.entry(stage).or_default();
        let repeats = config
            .methods
            .iter()
            .filter(|key| key.base() == base)
            .count();
        let key = if repeats == 0 {
            MethodKey::new(base)
        } else {
            MethodKey::repeat(base, repeats)
        };
        // An empty block is omitted so repeats keep seeding from the
        // un-suffixed base block.
        if !params.is_empty() {
            config.params.insert(key.to_string(), params);
        }
        config.methods.push(key);
    }

    /// Replace a stage's configuration wholesale.
    pub fn set_stage(&mut self, stage: StageKind, config: StageConfig) {
        self.stages.insert(stage, config);
    }

    /// Parse a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for malformed JSON, unknown stage names,
    /// invalid method identifiers, or non-mapping step blocks.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let raw: IndexMap<String, IndexMap<String, serde_json::Value>> =
            serde_json::from_str(text)?;
        Self::from_raw(raw)
    }

    /// Serialize to a pretty-printed JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if serialization fails (it cannot
    /// for well-formed documents; the variant exists for the signature).
    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(&self.to_raw())?)
    }

    fn from_raw(
        raw: IndexMap<String, IndexMap<String, serde_json::Value>>,
    ) -> Result<Self, ConfigError> {
        let mut stages = IndexMap::new();
        for (stage_name, mut block) in raw {
            let Some(stage) = StageKind::from_name(&stage_name) else {
                return Err(ConfigError::UnknownStage { name: stage_name });
            };
            let methods = match block.shift_remove(&stage.method_list_key()) {
                None => Vec::new(),
                Some(serde_json::Value::Array(entries)) => entries
                    .into_iter()
                    .map(|entry| match entry {
                        serde_json::Value::String(s) => MethodKey::parse(&s),
                        other => Err(ConfigError::BadMethodEntry {
                            entry: other.to_string(),
                            detail: "method list entries must be strings".to_owned(),
                        }),
                    })
                    .collect::<Result<_, _>>()?,
                Some(other) => {
                    return Err(ConfigError::BadMethodEntry {
                        entry: other.to_string(),
                        detail: format!("'{}' must be a list", stage.method_list_key()),
                    });
                }
            };
            let mut params = IndexMap::new();
            for (key, value) in block {
                match value {
                    serde_json::Value::Object(map) => {
                        params.insert(key, map.into_iter().collect());
                    }
                    _ => {
                        return Err(ConfigError::NotAMapping {
                            stage: stage_name,
                            key,
                        });
                    }
                }
            }
            stages.insert(stage, StageConfig { methods, params });
        }
        Ok(Self { stages })
    }

    fn to_raw(&self) -> IndexMap<String, IndexMap<String, serde_json::Value>> {
        let mut raw = IndexMap::new();
        for (stage, config) in &self.stages {
            let mut block = IndexMap::new();
            block.insert(
                stage.method_list_key(),
                serde_json::Value::Array(
                    config
                        .methods
                        .iter()
                        .map(|key| serde_json::Value::String(key.to_string()))
                        .collect(),
                ),
            );
            for (key, params) in &config.params {
                block.insert(
                    key.clone(),
                    serde_json::Value::Object(params.clone().into_iter().collect()),
                );
            }
            raw.insert(stage.name().to_owned(), block);
        }
        raw
    }
}

impl Serialize for PipelineConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_raw().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PipelineConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = IndexMap::deserialize(deserializer)?;
        Self::from_raw(raw).map_err(D::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, serde_json::Value)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn method_key_parse_bare() {
        let key = MethodKey::parse("rolling_mean").unwrap();
        assert_eq!(key.base(), "rolling_mean");
        assert_eq!(key.call(), 0);
        assert_eq!(key.to_string(), "rolling_mean");
    }

    #[test]
    fn method_key_parse_repeat() {
        let key = MethodKey::parse("rolling_mean*2").unwrap();
        assert_eq!(key.base(), "rolling_mean");
        assert_eq!(key.call(), 2);
        assert_eq!(key.to_string(), "rolling_mean*2");
    }

    #[test]
    fn method_key_rejects_zero_and_garbage() {
        assert!(MethodKey::parse("x*0").is_err());
        assert!(MethodKey::parse("x*two").is_err());
        assert!(MethodKey::parse("*1").is_err());
        assert!(MethodKey::parse("").is_err());
    }

    #[test]
    fn lock_level_coverage() {
        assert!(!LockLevel::Unlocked.covers(StageKind::Crop));
        assert!(LockLevel::TrackLocked.covers(StageKind::Track));
        assert!(!LockLevel::TrackLocked.covers(StageKind::Link));
        assert!(LockLevel::LinkLocked.covers(StageKind::Link));
        assert!(!LockLevel::LinkLocked.covers(StageKind::Postprocess));
    }

    #[test]
    fn resolved_params_falls_back_to_base_block() {
        let mut config = PipelineConfig::new();
        config.push_step(
            StageKind::Postprocess,
            "rolling_mean",
            params(&[("span", serde_json::json!(5))]),
        );
        // Second occurrence with no block of its own.
        let mut stage = config.stage(StageKind::Postprocess).unwrap().clone();
        stage.methods.push(MethodKey::repeat("rolling_mean", 1));
        config.set_stage(StageKind::Postprocess, stage);

        let seeded =
            config.resolved_params(StageKind::Postprocess, &MethodKey::repeat("rolling_mean", 1));
        assert_eq!(seeded.get("span"), Some(&serde_json::json!(5)));
    }

    #[test]
    fn resolved_params_prefers_full_key() {
        let mut config = PipelineConfig::new();
        config.push_step(
            StageKind::Postprocess,
            "rolling_mean",
            params(&[("span", serde_json::json!(5))]),
        );
        config.push_step(
            StageKind::Postprocess,
            "rolling_mean",
            params(&[("span", serde_json::json!(9))]),
        );
        let own =
            config.resolved_params(StageKind::Postprocess, &MethodKey::repeat("rolling_mean", 1));
        assert_eq!(own.get("span"), Some(&serde_json::json!(9)));
    }

    #[test]
    fn max_span_across_active_steps() {
        let mut config = PipelineConfig::new();
        config.push_step(
            StageKind::Postprocess,
            "rolling_mean",
            params(&[("span", serde_json::json!(3))]),
        );
        config.push_step(
            StageKind::Postprocess,
            "rolling_median",
            params(&[("span", serde_json::json!(11))]),
        );
        config.push_step(StageKind::Postprocess, "tessellation", Params::new());
        assert_eq!(config.max_span(StageKind::Postprocess), 11);
        assert_eq!(config.max_span(StageKind::Link), 0);
    }

    #[test]
    fn document_round_trip_is_equal() {
        let text = r#"{
            "track": {
                "track_method": ["centroid"],
                "centroid": { "threshold": 0.5 }
            },
            "postprocess": {
                "postprocess_method": ["rolling_mean", "rolling_mean*1"],
                "rolling_mean": { "column": "x", "span": 5 },
                "rolling_mean*1": { "column": "y", "span": 5 }
            }
        }"#;
        let first = PipelineConfig::from_json(text).unwrap();
        let saved = first.to_json().unwrap();
        let second = PipelineConfig::from_json(&saved).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn document_rejects_unknown_stage() {
        let result = PipelineConfig::from_json(r#"{ "transmogrify": {} }"#);
        assert!(matches!(result, Err(ConfigError::UnknownStage { .. })));
    }

    #[test]
    fn document_rejects_scalar_step_block() {
        let result = PipelineConfig::from_json(r#"{ "track": { "centroid": 3 } }"#);
        assert!(matches!(result, Err(ConfigError::NotAMapping { .. })));
    }

    #[test]
    fn push_step_assigns_call_indices() {
        let mut config = PipelineConfig::new();
        config.push_step(StageKind::Postprocess, "difference", Params::new());
        config.push_step(StageKind::Postprocess, "difference", Params::new());
        config.push_step(StageKind::Postprocess, "difference", Params::new());
        let keys: Vec<String> = config
            .chain(StageKind::Postprocess)
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(keys, vec!["difference", "difference*1", "difference*2"]);
    }
}
