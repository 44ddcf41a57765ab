//! Settings export/import (JSON, schema 1.1.0).
//!
//! The document captures everything needed to reproduce a tuning session in
//! a downstream pipeline: the solve parameters, the AR(2) coefficients
//! derived from them (field names kept camelCase for compatibility with the
//! existing consumers), and a human-readable statement of the model. Imports
//! are re-validated against the same schema before use.

use crate::error::EngineError;
use crate::protocol::SolveParams;
use serde::{Deserialize, Serialize};
use spiketune_solver::kernel::tau_to_ar2;

pub const SCHEMA_VERSION: &str = "1.1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportDocument {
    pub schema_version: String,
    pub app_version: String,
    /// ISO-8601 timestamp.
    pub export_date: String,
    pub parameters: ExportParameters,
    pub ar2_coefficients: Ar2Block,
    pub formulation: Formulation,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportParameters {
    pub tau_rise_s: f64,
    pub tau_decay_s: f64,
    pub lambda: f64,
    pub sampling_rate_hz: f64,
    pub filter_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ar2Block {
    #[serde(rename = "decayRoot")]
    pub decay_root: f64,
    #[serde(rename = "riseRoot")]
    pub rise_root: f64,
    pub g1: f64,
    pub g2: f64,
    pub dt: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Formulation {
    pub model: String,
    pub objective: String,
    pub kernel: String,
    pub ar2_relation: String,
    pub lambda_definition: String,
    pub convergence: String,
}

impl Default for Formulation {
    fn default() -> Self {
        Formulation {
            model: "y(t) = (K * s)(t) + b + noise, s(t) >= 0".into(),
            objective: "minimize (1/2)||y - K*s - b||^2 + lambda*G_dc*||s||_1 \
                        subject to s >= 0"
                .into(),
            kernel: "h(t) = exp(-t/tau_decay) - exp(-t/tau_rise), \
                     normalized to unit peak"
                .into(),
            ar2_relation: "c[t] = g1*c[t-1] + g2*c[t-2] + s[t], \
                           g1 = d + r, g2 = -(d*r), d = exp(-dt/tau_decay), \
                           r = exp(-dt/tau_rise)"
                .into(),
            lambda_definition: "lambda scales with the kernel DC gain \
                                G_dc = sum(h) so its effect is kernel-shape \
                                independent"
                .into(),
            convergence: "relative objective change < 1e-6, hard cap 2000 \
                          iterations"
                .into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_cells: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_timepoints: Option<usize>,
}

impl ExportDocument {
    /// Build a document for the current parameters, stamping the crate
    /// version and the current UTC time.
    pub fn new(params: &SolveParams, metadata: Metadata) -> Result<Self, EngineError> {
        let ar2 = tau_to_ar2(params.tau_rise, params.tau_decay, params.fs)?;
        Ok(ExportDocument {
            schema_version: SCHEMA_VERSION.into(),
            app_version: env!("CARGO_PKG_VERSION").into(),
            export_date: chrono::Utc::now().to_rfc3339(),
            parameters: ExportParameters {
                tau_rise_s: params.tau_rise,
                tau_decay_s: params.tau_decay,
                lambda: params.lambda,
                sampling_rate_hz: params.fs,
                filter_enabled: params.filter_enabled,
            },
            ar2_coefficients: Ar2Block {
                decay_root: ar2.decay_root,
                rise_root: ar2.rise_root,
                g1: ar2.g1,
                g2: ar2.g2,
                dt: ar2.dt,
            },
            formulation: Formulation::default(),
            metadata,
        })
    }

    pub fn to_json(&self) -> Result<String, EngineError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse and re-validate an exported document.
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let doc: ExportDocument = serde_json::from_str(json)?;
        doc.validate()?;
        Ok(doc)
    }

    /// Schema and parameter sanity checks applied on import.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(EngineError::SchemaVersion {
                found: self.schema_version.clone(),
                expected: SCHEMA_VERSION.into(),
            });
        }
        let p = &self.parameters;
        for (name, v) in [
            ("tau_rise_s", p.tau_rise_s),
            ("tau_decay_s", p.tau_decay_s),
            ("lambda", p.lambda),
            ("sampling_rate_hz", p.sampling_rate_hz),
        ] {
            if !v.is_finite() || v <= 0.0 {
                return Err(EngineError::IoFormat(format!(
                    "invalid exported parameter {name} = {v}"
                )));
            }
        }
        Ok(())
    }

    /// The parameter set this document describes.
    pub fn solve_params(&self) -> SolveParams {
        SolveParams {
            tau_rise: self.parameters.tau_rise_s,
            tau_decay: self.parameters.tau_decay_s,
            lambda: self.parameters.lambda,
            fs: self.parameters.sampling_rate_hz,
            filter_enabled: self.parameters.filter_enabled,
        }
    }
}
