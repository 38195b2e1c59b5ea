// This file is part of Veilnet and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Session parameters and the named key-value message that seats them.
//!
//! All participants must agree bit-exactly on the session parameters; they
//! are fixed by the relay's `Parameters` broadcast at setup and immutable
//! until a resync or shutdown.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Minimum DC-net payload size in bytes.
pub const MIN_PAYLOAD_SIZE: usize = 16;
/// Default pipeline window (max rounds broadcast but not yet decoded).
pub const DEFAULT_WINDOW: u32 = 2;
/// Default deadline for the contributions of one round.
pub const DEFAULT_ROUND_TIMEOUT: Duration = Duration::from_secs(5);

pub const PARAM_NEXT_FREE_CLIENT_ID: &str = "NextFreeClientID";
pub const PARAM_NEXT_FREE_TRUSTEE_ID: &str = "NextFreeTrusteeID";
pub const PARAM_N_CLIENTS: &str = "NClients";
pub const PARAM_N_TRUSTEES: &str = "NTrustees";
pub const PARAM_UPSTREAM_CELL_SIZE: &str = "UpstreamCellSize";
pub const PARAM_USE_UDP: &str = "UseUDP";
pub const PARAM_DCNET_TYPE: &str = "DCNetType";
pub const PARAM_EQUIVOCATION: &str = "EquivocationProtectionEnabled";
pub const PARAM_WINDOW_SIZE: &str = "WindowSize";
pub const PARAM_ROUND_TIMEOUT_MS: &str = "RoundTimeoutMs";
pub const PARAM_ALLOW_DEGRADED_SLOT: &str = "AllowDegradedSlot";
pub const PARAM_LATENCY_PROBES: &str = "DoLatencyTests";

/// A single value in a [`ParamsMap`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamValue {
    Int(i64),
    Bool(bool),
    Str(String),
}

/// Named key-value session-parameters message.
///
/// Unknown keys are ignored; every accessor falls back to a caller-supplied
/// default so that partially filled maps stay usable.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamsMap {
    values: BTreeMap<String, ParamValue>,
    /// When set, parameters are re-seated even if the receiving state
    /// machine would otherwise reject the message.
    pub force: bool,
}

impl ParamsMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_int(&mut self, key: &str, value: i64) -> &mut Self {
        self.values.insert(key.to_string(), ParamValue::Int(value));
        self
    }

    pub fn set_bool(&mut self, key: &str, value: bool) -> &mut Self {
        self.values.insert(key.to_string(), ParamValue::Bool(value));
        self
    }

    pub fn set_str(&mut self, key: &str, value: &str) -> &mut Self {
        self.values
            .insert(key.to_string(), ParamValue::Str(value.to_string()));
        self
    }

    #[must_use]
    pub fn int_or(&self, key: &str, default: i64) -> i64 {
        match self.values.get(key) {
            Some(ParamValue::Int(v)) => *v,
            _ => default,
        }
    }

    #[must_use]
    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        match self.values.get(key) {
            Some(ParamValue::Bool(v)) => *v,
            _ => default,
        }
    }

    #[must_use]
    pub fn str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        match self.values.get(key) {
            Some(ParamValue::Str(v)) => v.as_str(),
            _ => default,
        }
    }
}

/// DC-net cipher variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DcNetVariant {
    /// Plain XOR pads.
    Simple,
    /// XOR pads plus per-round equivocation tags binding the downstream
    /// history.
    Verifiable,
}

impl std::fmt::Display for DcNetVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DcNetVariant::Simple => write!(f, "Simple"),
            DcNetVariant::Verifiable => write!(f, "Verifiable"),
        }
    }
}

/// Validated, immutable session parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionParams {
    pub n_clients: usize,
    pub n_trustees: usize,
    /// DC-net payload size L in bytes per cell.
    pub payload_size: usize,
    pub equivocation: bool,
    pub variant: DcNetVariant,
    pub use_udp: bool,
    /// Pipeline window W.
    pub window: u32,
    pub round_timeout: Duration,
    /// Operator override restoring the degraded `slot = client id`
    /// fallback when shuffle recognition fails.
    pub allow_degraded_slot: bool,
    pub latency_probes: bool,
}

impl SessionParams {
    /// Builds validated parameters from a received [`ParamsMap`].
    pub fn from_map(map: &ParamsMap) -> Result<Self> {
        let n_clients = map.int_or(PARAM_N_CLIENTS, 0);
        if n_clients < 1 {
            return Err(Error::Config(format!("NClients must be >= 1, got {n_clients}")));
        }
        let n_trustees = map.int_or(PARAM_N_TRUSTEES, 0);
        if n_trustees < 1 {
            return Err(Error::Config(format!(
                "NTrustees must be >= 1, got {n_trustees}"
            )));
        }
        let payload_size = map.int_or(PARAM_UPSTREAM_CELL_SIZE, 0);
        if payload_size < MIN_PAYLOAD_SIZE as i64 {
            return Err(Error::Config(format!(
                "UpstreamCellSize must be >= {MIN_PAYLOAD_SIZE}, got {payload_size}"
            )));
        }
        let variant = match map.str_or(PARAM_DCNET_TYPE, "Simple") {
            "Simple" => DcNetVariant::Simple,
            "Verifiable" => DcNetVariant::Verifiable,
            other => {
                return Err(Error::Config(format!("unknown DCNetType {other:?}")));
            }
        };
        let equivocation = map.bool_or(PARAM_EQUIVOCATION, variant == DcNetVariant::Verifiable);
        let window = map.int_or(PARAM_WINDOW_SIZE, i64::from(DEFAULT_WINDOW));
        if window < 1 {
            return Err(Error::Config(format!("WindowSize must be >= 1, got {window}")));
        }
        let timeout_ms = map.int_or(
            PARAM_ROUND_TIMEOUT_MS,
            DEFAULT_ROUND_TIMEOUT.as_millis() as i64,
        );
        if timeout_ms < 1 {
            return Err(Error::Config(format!(
                "RoundTimeoutMs must be >= 1, got {timeout_ms}"
            )));
        }
        Ok(Self {
            n_clients: n_clients as usize,
            n_trustees: n_trustees as usize,
            payload_size: payload_size as usize,
            equivocation,
            variant,
            use_udp: map.bool_or(PARAM_USE_UDP, false),
            window: window as u32,
            round_timeout: Duration::from_millis(timeout_ms as u64),
            allow_degraded_slot: map.bool_or(PARAM_ALLOW_DEGRADED_SLOT, false),
            latency_probes: map.bool_or(PARAM_LATENCY_PROBES, false),
        })
    }

    /// Serializes the parameters into a map suitable for broadcast.
    #[must_use]
    pub fn to_map(&self) -> ParamsMap {
        let mut map = ParamsMap::new();
        map.set_int(PARAM_N_CLIENTS, self.n_clients as i64)
            .set_int(PARAM_N_TRUSTEES, self.n_trustees as i64)
            .set_int(PARAM_UPSTREAM_CELL_SIZE, self.payload_size as i64)
            .set_str(PARAM_DCNET_TYPE, &self.variant.to_string())
            .set_bool(PARAM_EQUIVOCATION, self.equivocation)
            .set_bool(PARAM_USE_UDP, self.use_udp)
            .set_int(PARAM_WINDOW_SIZE, i64::from(self.window))
            .set_int(PARAM_ROUND_TIMEOUT_MS, self.round_timeout.as_millis() as i64)
            .set_bool(PARAM_ALLOW_DEGRADED_SLOT, self.allow_degraded_slot)
            .set_bool(PARAM_LATENCY_PROBES, self.latency_probes);
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_map() -> ParamsMap {
        let mut map = ParamsMap::new();
        map.set_int(PARAM_N_CLIENTS, 2)
            .set_int(PARAM_N_TRUSTEES, 1)
            .set_int(PARAM_UPSTREAM_CELL_SIZE, 32);
        map
    }

    #[test]
    fn accepts_minimal_parameters() {
        let params = SessionParams::from_map(&minimal_map()).unwrap();
        assert_eq!(params.n_clients, 2);
        assert_eq!(params.n_trustees, 1);
        assert_eq!(params.payload_size, 32);
        assert_eq!(params.variant, DcNetVariant::Simple);
        assert!(!params.equivocation);
        assert_eq!(params.window, DEFAULT_WINDOW);
    }

    #[test]
    fn rejects_undersized_cell() {
        let mut map = minimal_map();
        map.set_int(PARAM_UPSTREAM_CELL_SIZE, 8);
        assert!(matches!(
            SessionParams::from_map(&map),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn rejects_unknown_variant() {
        let mut map = minimal_map();
        map.set_str(PARAM_DCNET_TYPE, "Hybrid");
        assert!(matches!(
            SessionParams::from_map(&map),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn verifiable_variant_implies_equivocation() {
        let mut map = minimal_map();
        map.set_str(PARAM_DCNET_TYPE, "Verifiable");
        let params = SessionParams::from_map(&map).unwrap();
        assert!(params.equivocation);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut map = minimal_map();
        map.set_str("SomeFutureOption", "whatever");
        assert!(SessionParams::from_map(&map).is_ok());
    }

    #[test]
    fn roundtrips_through_map() {
        let mut map = minimal_map();
        map.set_str(PARAM_DCNET_TYPE, "Verifiable")
            .set_bool(PARAM_USE_UDP, true)
            .set_int(PARAM_WINDOW_SIZE, 4);
        let params = SessionParams::from_map(&map).unwrap();
        let rebuilt = SessionParams::from_map(&params.to_map()).unwrap();
        assert_eq!(params, rebuilt);
    }
}
