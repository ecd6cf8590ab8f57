//! Foam loop configuration.
//!
//! ## Responsibility
//! Parse, validate, and atomically update the flat key-value configuration
//! document that drives the measurement-control cycle.
//!
//! ## Guarantees
//! - Deterministic: the same TOML input always produces the same `FoamConfig`
//! - Validated: every semantic constraint is checked before a config is used
//! - Collected: validation gathers *all* violations before returning
//! - Live updates are all-or-nothing; a rejected update leaves the previous
//!   values intact
//!
//! ## NOT Responsible For
//! - Persistence (the embedder owns the file, if any)
//! - Applying live tunables to a running scheduler (that belongs to
//!   `scheduler::Scheduler::set_config`)

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ── Default value functions ──────────────────────────────────────────────

fn default_k_initial() -> u32 {
    24
}

fn default_true() -> bool {
    true
}

fn default_t_target_ms() -> f64 {
    12.0
}

fn default_iq_min() -> f64 {
    0.70
}

fn default_iq_max() -> f64 {
    0.90
}

fn default_beta_grow() -> f64 {
    0.015
}

fn default_beta_shrink() -> f64 {
    0.002
}

fn default_dr_cap() -> f64 {
    0.01
}

fn default_r_min() -> f64 {
    0.005
}

fn default_r_max() -> f64 {
    0.060
}

fn default_sigma_disp() -> f64 {
    0.5
}

fn default_v_dom() -> f64 {
    0.5
}

fn default_chunk_max() -> usize {
    512
}

fn default_recycle_every() -> u64 {
    300
}

fn default_n_max() -> usize {
    100_000
}

fn default_k_min() -> u32 {
    8
}

fn default_k_max() -> u32 {
    200
}

fn default_dk_up() -> u32 {
    8
}

fn default_dk_down() -> u32 {
    4
}

// ── Errors ───────────────────────────────────────────────────────────────

/// Errors arising from configuration parsing, validation, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// A specific field has an out-of-range or contradictory value.
    #[error("field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Field name as it appears in the document (e.g. `iq_min`).
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("io error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

// ── FoamConfig ───────────────────────────────────────────────────────────

/// Full configuration for one scheduler instance.
///
/// `n` is fixed for the scheduler's lifetime; the radius bounds and batching
/// parameters likewise require reconstruction. The band, rates, cadence
/// override, and `auto_cadence` are live-tunable through [`ConfigUpdate`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct FoamConfig {
    /// Fixed particle count (construction only).
    pub n: usize,
    /// Starting cadence: ticks between geometry submissions.
    #[serde(default = "default_k_initial")]
    pub k_initial: u32,
    /// Enable adaptive cadence.
    #[serde(default = "default_true")]
    pub auto_cadence: bool,
    /// Target geometry latency in milliseconds.
    #[serde(default = "default_t_target_ms")]
    pub t_target_ms: f64,
    /// Lower edge of the IQ control band.
    #[serde(default = "default_iq_min")]
    pub iq_min: f64,
    /// Upper edge of the IQ control band.
    #[serde(default = "default_iq_max")]
    pub iq_max: f64,
    /// Growth rate applied to cells below the band.
    #[serde(default = "default_beta_grow")]
    pub beta_grow: f64,
    /// Shrink rate applied to cells above the band.
    #[serde(default = "default_beta_shrink")]
    pub beta_shrink: f64,
    /// Per-step relative radius change bound (γ).
    #[serde(default = "default_dr_cap")]
    pub dr_cap: f64,
    /// Absolute lower radius clamp.
    #[serde(default = "default_r_min")]
    pub r_min: f64,
    /// Absolute upper radius clamp.
    #[serde(default = "default_r_max")]
    pub r_max: f64,
    /// Dispersion (`std/mean`) threshold triggering renormalisation.
    #[serde(default = "default_sigma_disp")]
    pub sigma_disp: f64,
    /// Dominance threshold on `max(V)` triggering update dampening.
    #[serde(default = "default_v_dom")]
    pub v_dom: f64,
    /// Adapter batching bound: particles per backend invocation.
    #[serde(default = "default_chunk_max")]
    pub chunk_max: usize,
    /// Worker reset interval in completed results. `0` disables recycling.
    #[serde(default = "default_recycle_every")]
    pub recycle_every: u64,
    /// Hard cap on the particle count the adapter accepts.
    #[serde(default = "default_n_max")]
    pub n_max: usize,
    /// Lower cadence bound for the adaptive controller.
    #[serde(default = "default_k_min")]
    pub k_min: u32,
    /// Upper cadence bound for the adaptive controller.
    #[serde(default = "default_k_max")]
    pub k_max: u32,
    /// Cadence increment when geometry is slow.
    #[serde(default = "default_dk_up")]
    pub dk_up: u32,
    /// Cadence decrement when geometry is fast.
    #[serde(default = "default_dk_down")]
    pub dk_down: u32,
}

impl FoamConfig {
    /// A config with the documented defaults for `n` particles.
    pub fn with_n(n: usize) -> Self {
        Self {
            n,
            k_initial: default_k_initial(),
            auto_cadence: true,
            t_target_ms: default_t_target_ms(),
            iq_min: default_iq_min(),
            iq_max: default_iq_max(),
            beta_grow: default_beta_grow(),
            beta_shrink: default_beta_shrink(),
            dr_cap: default_dr_cap(),
            r_min: default_r_min(),
            r_max: default_r_max(),
            sigma_disp: default_sigma_disp(),
            v_dom: default_v_dom(),
            chunk_max: default_chunk_max(),
            recycle_every: default_recycle_every(),
            n_max: default_n_max(),
            k_min: default_k_min(),
            k_max: default_k_max(),
            dk_up: default_dk_up(),
            dk_down: default_dk_down(),
        }
    }

    /// Parse a config from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns every violation found, not just the first.
    pub fn from_toml_str(s: &str) -> Result<Self, Vec<ConfigError>> {
        let config: FoamConfig = toml::from_str(s).map_err(|e| {
            vec![ConfigError::Parse {
                file: "<inline>".into(),
                source: e,
            }]
        })?;
        validate(&config)?;
        Ok(config)
    }

    /// Load and validate a config from a TOML file.
    ///
    /// # Errors
    ///
    /// I/O and parse failures are reported with the file path; semantic
    /// violations are collected as with [`FoamConfig::from_toml_str`].
    pub fn from_path(path: impl AsRef<std::path::Path>) -> Result<Self, Vec<ConfigError>> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            vec![ConfigError::Io {
                file: path.display().to_string(),
                source: e,
            }]
        })?;
        let config: FoamConfig = toml::from_str(&text).map_err(|e| {
            vec![ConfigError::Parse {
                file: path.display().to_string(),
                source: e,
            }]
        })?;
        validate(&config)?;
        Ok(config)
    }

    /// Apply a live update, returning the merged config.
    ///
    /// The merge is validated as a whole; the caller only replaces its config
    /// when this returns `Ok`.
    pub fn merged(&self, update: &ConfigUpdate) -> Result<Self, Vec<ConfigError>> {
        let mut next = self.clone();
        if let Some(iq_min) = update.iq_min {
            next.iq_min = iq_min;
        }
        if let Some(iq_max) = update.iq_max {
            next.iq_max = iq_max;
        }
        if let Some(beta_grow) = update.beta_grow {
            next.beta_grow = beta_grow;
        }
        if let Some(beta_shrink) = update.beta_shrink {
            next.beta_shrink = beta_shrink;
        }
        if let Some(auto_cadence) = update.auto_cadence {
            next.auto_cadence = auto_cadence;
        }
        if let Some(k) = update.k {
            if k == 0 || k < next.k_min || k > next.k_max {
                return Err(vec![ConfigError::InvalidField {
                    field: "k".into(),
                    value: k.to_string(),
                    reason: format!("must be within [{}, {}]", next.k_min, next.k_max),
                }]);
            }
        }
        validate(&next)?;
        Ok(next)
    }
}

/// Partial update of the live-tunable parameters.
///
/// Everything else (particle count, radius bounds, batching, recycling)
/// requires constructing a new scheduler.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ConfigUpdate {
    /// New lower band edge.
    pub iq_min: Option<f64>,
    /// New upper band edge.
    pub iq_max: Option<f64>,
    /// New growth rate.
    pub beta_grow: Option<f64>,
    /// New shrink rate.
    pub beta_shrink: Option<f64>,
    /// Manual cadence override (clamped to `[k_min, k_max]` by validation).
    pub k: Option<u32>,
    /// Enable or disable adaptive cadence.
    pub auto_cadence: Option<bool>,
}

// ── Validation ───────────────────────────────────────────────────────────

/// Validate all semantic constraints on a [`FoamConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
pub fn validate(config: &FoamConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    let mut invalid = |field: &str, value: String, reason: &str| {
        errors.push(ConfigError::InvalidField {
            field: field.into(),
            value,
            reason: reason.into(),
        });
    };

    // ── Particle count ───────────────────────────────────────────────
    if config.n == 0 {
        invalid("n", "0".into(), "must be at least 1");
    }
    if config.n > config.n_max {
        invalid(
            "n",
            config.n.to_string(),
            "must not exceed n_max",
        );
    }

    // ── Control band ─────────────────────────────────────────────────
    if !(config.iq_min > 0.0 && config.iq_min < config.iq_max) {
        invalid(
            "iq_min",
            config.iq_min.to_string(),
            "band requires 0 < iq_min < iq_max",
        );
    }
    if !(config.iq_max <= 1.0) {
        invalid("iq_max", config.iq_max.to_string(), "must be at most 1.0");
    }

    // ── Rates ────────────────────────────────────────────────────────
    if !(0.0..=1.0).contains(&config.beta_grow) {
        invalid(
            "beta_grow",
            config.beta_grow.to_string(),
            "must be between 0.0 and 1.0",
        );
    }
    if !(0.0..=1.0).contains(&config.beta_shrink) {
        invalid(
            "beta_shrink",
            config.beta_shrink.to_string(),
            "must be between 0.0 and 1.0",
        );
    }
    if !(config.dr_cap > 0.0 && config.dr_cap < 1.0) {
        invalid(
            "dr_cap",
            config.dr_cap.to_string(),
            "must be in (0.0, 1.0)",
        );
    }

    // ── Radius bounds ────────────────────────────────────────────────
    if !(config.r_min > 0.0 && config.r_min < config.r_max) {
        invalid(
            "r_min",
            config.r_min.to_string(),
            "requires 0 < r_min < r_max",
        );
    }

    // ── Guards ───────────────────────────────────────────────────────
    if !(config.sigma_disp > 0.0) {
        invalid(
            "sigma_disp",
            config.sigma_disp.to_string(),
            "must be positive",
        );
    }
    if !(config.v_dom > 0.0 && config.v_dom <= 1.0) {
        invalid("v_dom", config.v_dom.to_string(), "must be in (0.0, 1.0]");
    }

    // ── Cadence ──────────────────────────────────────────────────────
    if config.k_initial == 0 {
        invalid("k_initial", "0".into(), "must be at least 1");
    }
    if config.k_min == 0 || config.k_min > config.k_max {
        invalid(
            "k_min",
            config.k_min.to_string(),
            "requires 1 <= k_min <= k_max",
        );
    }
    if !(config.t_target_ms > 0.0) {
        invalid(
            "t_target_ms",
            config.t_target_ms.to_string(),
            "must be positive",
        );
    }

    // ── Batching ─────────────────────────────────────────────────────
    if config.chunk_max == 0 {
        invalid("chunk_max", "0".into(), "must be at least 1");
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Export the JSON Schema for [`FoamConfig`].
///
/// Enables IDE autocomplete when embedders edit the persisted TOML document.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(FoamConfig);
    serde_json::to_string_pretty(&schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_with_n_defaults_match_documented_values() {
        let c = FoamConfig::with_n(1000);
        assert_eq!(c.n, 1000);
        assert_eq!(c.k_initial, 24);
        assert!(c.auto_cadence);
        assert!((c.iq_min - 0.70).abs() < f64::EPSILON);
        assert!((c.iq_max - 0.90).abs() < f64::EPSILON);
        assert!((c.beta_grow - 0.015).abs() < f64::EPSILON);
        assert!((c.beta_shrink - 0.002).abs() < f64::EPSILON);
        assert!((c.dr_cap - 0.01).abs() < f64::EPSILON);
        assert!((c.r_min - 0.005).abs() < f64::EPSILON);
        assert!((c.r_max - 0.060).abs() < f64::EPSILON);
        assert_eq!(c.chunk_max, 512);
        assert_eq!(c.recycle_every, 300);
    }

    #[test]
    fn test_default_config_validates() {
        assert!(validate(&FoamConfig::with_n(500)).is_ok());
    }

    #[test]
    fn test_zero_n_rejected() {
        let c = FoamConfig::with_n(0);
        let errs = validate(&c).expect_err("n == 0 must fail");
        assert!(errs.iter().any(|e| e.to_string().contains("'n'")));
    }

    #[test]
    fn test_band_inversion_rejected() {
        let mut c = FoamConfig::with_n(10);
        c.iq_min = 0.9;
        c.iq_max = 0.7;
        assert!(validate(&c).is_err());
    }

    #[test]
    fn test_negative_rate_rejected() {
        let mut c = FoamConfig::with_n(10);
        c.beta_grow = -0.1;
        assert!(validate(&c).is_err());
    }

    #[test]
    fn test_validation_collects_multiple_errors() {
        let mut c = FoamConfig::with_n(0);
        c.iq_min = 2.0;
        c.beta_shrink = -1.0;
        let errs = validate(&c).expect_err("must fail");
        assert!(errs.len() >= 3, "expected 3+ violations, got {}", errs.len());
    }

    #[test]
    fn test_minimal_toml_parses_with_defaults() {
        let c = FoamConfig::from_toml_str("n = 256").expect("minimal TOML parses");
        assert_eq!(c.n, 256);
        assert_eq!(c.k_initial, 24);
        assert_eq!(c.n_max, 100_000);
    }

    #[test]
    fn test_full_toml_overrides_defaults() {
        let c = FoamConfig::from_toml_str(
            r#"
n = 2000
k_initial = 48
auto_cadence = false
t_target_ms = 20.0
iq_min = 0.65
iq_max = 0.85
chunk_max = 1024
recycle_every = 100
"#,
        )
        .expect("full TOML parses");
        assert_eq!(c.k_initial, 48);
        assert!(!c.auto_cadence);
        assert_eq!(c.chunk_max, 1024);
        assert_eq!(c.recycle_every, 100);
    }

    #[test]
    fn test_invalid_toml_rejected_at_parse_and_validate() {
        let err = FoamConfig::from_toml_str("n = 10\niq_min = 0.9\niq_max = 0.7")
            .expect_err("band inversion must fail");
        assert!(!err.is_empty());
    }

    #[test]
    fn test_from_path_roundtrip() {
        let mut f = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(f, "n = 64\nk_initial = 16").expect("write");
        let c = FoamConfig::from_path(f.path()).expect("load");
        assert_eq!(c.n, 64);
        assert_eq!(c.k_initial, 16);
    }

    #[test]
    fn test_from_path_missing_file_reports_io_error() {
        let err = FoamConfig::from_path("/definitely/not/here.toml").expect_err("must fail");
        assert!(matches!(err[0], ConfigError::Io { .. }));
    }

    #[test]
    fn test_merged_applies_live_fields() {
        let c = FoamConfig::with_n(10);
        let update = ConfigUpdate {
            iq_min: Some(0.60),
            iq_max: Some(0.80),
            beta_grow: Some(0.02),
            ..Default::default()
        };
        let next = c.merged(&update).expect("valid update");
        assert!((next.iq_min - 0.60).abs() < f64::EPSILON);
        assert!((next.iq_max - 0.80).abs() < f64::EPSILON);
        assert!((next.beta_grow - 0.02).abs() < f64::EPSILON);
        // untouched fields preserved
        assert_eq!(next.n, 10);
        assert!((next.beta_shrink - 0.002).abs() < f64::EPSILON);
    }

    #[test]
    fn test_merged_rejects_band_inversion_leaving_original_intact() {
        let c = FoamConfig::with_n(10);
        let update = ConfigUpdate {
            iq_min: Some(0.95),
            ..Default::default()
        };
        assert!(c.merged(&update).is_err());
        // original untouched by construction (merged() is pure)
        assert!((c.iq_min - 0.70).abs() < f64::EPSILON);
    }

    #[test]
    fn test_merged_rejects_out_of_range_cadence_override() {
        let c = FoamConfig::with_n(10);
        let update = ConfigUpdate {
            k: Some(0),
            ..Default::default()
        };
        assert!(c.merged(&update).is_err());
        let update = ConfigUpdate {
            k: Some(10_000),
            ..Default::default()
        };
        assert!(c.merged(&update).is_err());
        let update = ConfigUpdate {
            k: Some(32),
            ..Default::default()
        };
        assert!(c.merged(&update).is_ok());
    }

    #[test]
    fn test_toml_roundtrip_preserves_config() {
        let c = FoamConfig::with_n(321);
        let text = toml::to_string_pretty(&c).expect("serialize");
        let back: FoamConfig = toml::from_str(&text).expect("deserialize");
        assert_eq!(c, back);
    }

    #[test]
    fn test_export_schema_produces_valid_json() {
        let schema = export_schema().expect("schema export");
        let parsed: serde_json::Value = serde_json::from_str(&schema).expect("valid JSON");
        assert!(parsed.get("properties").is_some() || parsed.get("$ref").is_some());
    }
}
