//! Content-derived identity of a (calculation, projection) pair.
//!
//! A fingerprint is the SHA-256 of a canonical JSON document holding the
//! calculation parameters, the process identity and the region identity.
//! It never depends on memory addresses, timestamps or call order, so it is
//! stable across runs and usable as a persistent cache key.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use hc_core::{Error, Result};
use hc_data::{ProcessIdentity, Projection, RegionIdentity};

use crate::calculation::Calculation;

/// Version tag mixed into every fingerprint. Bump when the canonical form
/// changes.
pub const FINGERPRINT_SCHEMA: &str = "hepcalc_fingerprint_v1";

/// SHA-256 identity of a task, displayed as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint([u8; 32]);

#[derive(Serialize)]
struct Canonical<'a> {
    schema: &'static str,
    calculation: &'a Calculation,
    process: ProcessIdentity,
    region: RegionIdentity,
}

impl Fingerprint {
    /// Fingerprint of `calculation` applied to `projection`.
    pub fn of(calculation: &Calculation, projection: &Projection) -> Result<Self> {
        let canonical = Canonical {
            schema: FINGERPRINT_SCHEMA,
            calculation,
            process: projection.process.identity(),
            region: projection.region.identity(),
        };
        let bytes = serde_json::to_vec(&canonical)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&Sha256::digest(&bytes));
        Ok(Self(out))
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex form.
    pub fn to_hex(&self) -> String {
        self.to_string()
    }

    /// Shortened hex form for log lines.
    pub fn short(&self) -> String {
        self.to_hex()[..12].to_string()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl FromStr for Fingerprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Validation(format!("invalid fingerprint: '{s}'"));
        if s.len() != 64 || !s.is_ascii() {
            return Err(invalid());
        }
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[2 * i..2 * i + 2], 16).map_err(|_| invalid())?;
        }
        Ok(Self(out))
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.to_hex()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hc_data::{Binning, Process, Region, RegionVariation};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn projection(selection: &str, weight: &str) -> Projection {
        Projection::new(
            Arc::new(Process::new("ttbar", ["a.json", "b.json"])),
            Arc::new(Region::new(selection, weight)),
        )
    }

    fn hist(bins: usize) -> Calculation {
        Calculation::histogram("pt", Binning::uniform(0.0, 100.0, bins))
    }

    #[test]
    fn hex_round_trip() {
        let fp = Fingerprint::of(&Calculation::count(), &projection("pt > 20", "w")).unwrap();
        let hex = fp.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(hex.parse::<Fingerprint>().unwrap(), fp);
        assert!("zz".parse::<Fingerprint>().is_err());
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, format!("\"{hex}\""));
    }

    #[test]
    fn sensitive_to_every_parameter() {
        let base = Fingerprint::of(&hist(10), &projection("pt > 20", "w")).unwrap();
        let others = [
            Fingerprint::of(&hist(10), &projection("pt > 25", "w")).unwrap(),
            Fingerprint::of(&hist(10), &projection("pt > 20", "w2")).unwrap(),
            Fingerprint::of(&hist(20), &projection("pt > 20", "w")).unwrap(),
            Fingerprint::of(&Calculation::count(), &projection("pt > 20", "w")).unwrap(),
        ];
        for other in others {
            assert_ne!(base, other);
        }
    }

    #[test]
    fn insensitive_to_file_order_and_display() {
        let a = projection("pt > 20", "w");
        let b = Projection::new(
            Arc::new(Process::new("ttbar", ["b.json", "a.json"]).with_label("tt")),
            Arc::new(Region::new("pt > 20", "w").with_label("SR")),
        );
        assert_eq!(
            Fingerprint::of(&Calculation::count(), &a).unwrap(),
            Fingerprint::of(&Calculation::count(), &b).unwrap()
        );
    }

    #[test]
    fn variations_change_fingerprint() {
        let p = projection("pt > 20", "w");
        let varied = Projection::new(
            p.process.clone(),
            Arc::new(p.region.varied(RegionVariation::Reweighted { weight: "sf".into() })),
        );
        assert_ne!(
            Fingerprint::of(&Calculation::count(), &p).unwrap(),
            Fingerprint::of(&Calculation::count(), &varied).unwrap()
        );
    }

    proptest! {
        #[test]
        fn deterministic(sel in "[a-z]{1,6} > [0-9]{1,3}", weight in "[a-z]{0,6}", bins in 1usize..50) {
            let a = Fingerprint::of(&hist(bins), &projection(&sel, &weight)).unwrap();
            let b = Fingerprint::of(&hist(bins), &projection(&sel, &weight)).unwrap();
            prop_assert_eq!(a, b);
        }

        #[test]
        fn distinct_selections_differ(x in 0u32..1000, y in 0u32..1000) {
            prop_assume!(x != y);
            let a = Fingerprint::of(&Calculation::count(), &projection(&format!("pt > {x}"), "")).unwrap();
            let b = Fingerprint::of(&Calculation::count(), &projection(&format!("pt > {y}"), "")).unwrap();
            prop_assert_ne!(a, b);
        }
    }
}
