//! Proof capsules: a hashed, human-readable record of a signal.
//!
//! The hash covers only the signal payload. The payload is rendered in a
//! canonical form first: keys sorted, fixed field set, `key: value` pairs
//! joined by `, `, floats in shortest round-trip notation (exponent forms
//! written `5e-05`, `1e+16`) and non-finite floats spelled `NaN`,
//! `Infinity`, `-Infinity`.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::signals::{finite_or_null, EntropySignal};

pub const SCHEMA_VERSION: &str = "trade-capsule-1.1.0";
pub const PROVENANCE_SYSTEM: &str = "entropylab-sat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "SAT")]
    Sat,
    #[serde(rename = "UNDECIDED")]
    Undecided,
}

impl Verdict {
    pub fn for_signal(signal: &EntropySignal) -> Self {
        if signal.is_sat() {
            Verdict::Sat
        } else {
            Verdict::Undecided
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Sat => "SAT",
            Verdict::Undecided => "UNDECIDED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    #[serde(with = "finite_or_null")]
    pub delta_phi: f64,
    pub p_threshold: f64,
    pub np_threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub system: String,
    pub schema: String,
    pub claim: Claim,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofCapsule {
    pub schema_version: String,
    pub signal_hash: String,
    pub timestamp_ns: i64,
    pub statement: String,
    pub provenance: Provenance,
    pub inputs_fingerprint: String,
    pub signal: EntropySignal,
}

impl ProofCapsule {
    pub fn build(signal: &EntropySignal, inputs_fingerprint: &str) -> Self {
        let ts = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        Self::build_at(signal, inputs_fingerprint, ts)
    }

    pub fn build_at(signal: &EntropySignal, inputs_fingerprint: &str, timestamp_ns: i64) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            signal_hash: signal_hash(signal),
            timestamp_ns,
            statement: statement_for(signal),
            provenance: Provenance {
                system: PROVENANCE_SYSTEM.to_string(),
                schema: SCHEMA_VERSION.to_string(),
                claim: Claim {
                    delta_phi: signal.delta_phi,
                    p_threshold: signal.p_threshold,
                    np_threshold: signal.np_threshold,
                },
                verdict: Verdict::for_signal(signal),
            },
            inputs_fingerprint: inputs_fingerprint.to_string(),
            signal: *signal,
        }
    }

    /// Recompute the digest from the embedded signal and compare.
    pub fn verify(&self) -> bool {
        self.signal_hash == signal_hash(&self.signal)
    }
}

fn statement_for(signal: &EntropySignal) -> String {
    let dphi = if signal.delta_phi.is_finite() {
        format!("{:.6}", signal.delta_phi)
    } else {
        "undefined".to_string()
    };
    format!(
        "Over the trailing {}-tick window the entropy drift is ΔΦ={}; \
         the market is in NP-wall={} with no_recovery={}. \
         This trading decision rests on that structured entropy claim.",
        signal.window, dphi, signal.np_wall, signal.no_recovery
    )
}

// =============================================================================
// Canonical payload
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl Scalar {
    fn render(&self) -> String {
        match *self {
            Scalar::Bool(b) => b.to_string(),
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) if f.is_nan() => "NaN".to_string(),
            Scalar::Float(f) if f == f64::INFINITY => "Infinity".to_string(),
            Scalar::Float(f) if f == f64::NEG_INFINITY => "-Infinity".to_string(),
            Scalar::Float(f) => render_float(f),
        }
    }
}

/// Shortest round-trip digits; exponent forms carry a sign and at least
/// two exponent digits (`5e-05`, `1e+16`).
fn render_float(f: f64) -> String {
    let text = format!("{:?}", f);
    match text.split_once('e') {
        Some((mantissa, exp)) => {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(d) => ('-', d),
                None => ('+', exp),
            };
            format!("{}e{}{:0>2}", mantissa, sign, digits)
        }
        None => text,
    }
}

pub fn signal_fields(signal: &EntropySignal) -> Vec<(&'static str, Scalar)> {
    vec![
        ("np_wall", Scalar::Bool(signal.np_wall)),
        ("no_recovery", Scalar::Bool(signal.no_recovery)),
        ("delta_phi", Scalar::Float(signal.delta_phi)),
        ("p_threshold", Scalar::Float(signal.p_threshold)),
        ("np_threshold", Scalar::Float(signal.np_threshold)),
        ("window", Scalar::Int(signal.window as i64)),
        ("confidence", Scalar::Float(signal.confidence)),
        ("direction", Scalar::Int(signal.direction as i64)),
    ]
}

/// Key-sorted JSON-like rendering of a flat payload.
pub fn canonical_payload<'a, I>(fields: I) -> String
where
    I: IntoIterator<Item = (&'a str, Scalar)>,
{
    let sorted: BTreeMap<&str, Scalar> = fields.into_iter().collect();
    let body: Vec<String> = sorted
        .iter()
        .map(|(k, v)| format!("\"{}\": {}", k, v.render()))
        .collect();
    format!("{{{}}}", body.join(", "))
}

pub fn digest_fields<'a, I>(fields: I) -> String
where
    I: IntoIterator<Item = (&'a str, Scalar)>,
{
    let mut hasher = Sha256::new();
    hasher.update(canonical_payload(fields).as_bytes());
    hex::encode(hasher.finalize())
}

pub fn signal_hash(signal: &EntropySignal) -> String {
    digest_fields(signal_fields(signal))
}
