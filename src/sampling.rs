//! Per-probe sampling configuration.
//!
//! The kernel side decides per fire whether to emit a record; userspace only
//! writes the rates into the sampling map. Rates are given as fractions in
//! [0, 1] and stored as integer percent, rounded to nearest.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use libbpf_rs::{MapCore, MapFlags, MapHandle};

use crate::event::EventKind;

/// Parse a `name:fraction[,name:fraction...]` sampling spec. Later duplicates
/// win; names are the probe names from [`EventKind::name`].
pub fn parse_sampling_rates(spec: &str) -> Result<BTreeMap<EventKind, u32>> {
    let mut rates = BTreeMap::new();
    if spec.is_empty() {
        return Ok(rates);
    }

    for pair in spec.split(',') {
        let mut parts = pair.split(':');
        let (Some(name), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
            bail!("invalid sampling rate format: {pair}");
        };

        let name = name.trim();
        let Some(kind) = EventKind::from_name(name) else {
            bail!("unknown event name: {name}");
        };

        let rate: f64 = value
            .trim()
            .parse()
            .with_context(|| format!("invalid rate for {name}"))?;
        if !(0.0..=1.0).contains(&rate) {
            bail!("sampling rate must be between 0 and 1, got {rate}");
        }

        rates.insert(kind, (rate * 100.0).round() as u32);
    }

    Ok(rates)
}

/// Where sampling rates land. The production sink is the BPF hash map; tests
/// substitute their own.
pub trait SamplingSink {
    fn write_rates(&self, rates: &BTreeMap<EventKind, u32>) -> Result<()>;
}

/// The kernel-side sampling map: event kind -> integer percent.
pub struct SamplingMap {
    map: MapHandle,
}

impl SamplingMap {
    pub fn new(map: MapHandle) -> SamplingMap {
        SamplingMap { map }
    }
}

impl SamplingSink for SamplingMap {
    fn write_rates(&self, rates: &BTreeMap<EventKind, u32>) -> Result<()> {
        for (kind, percent) in rates {
            let key = (*kind as u32).to_ne_bytes();
            let value = percent.to_ne_bytes();
            self.map
                .update(&key, &value, MapFlags::ANY)
                .with_context(|| format!("writing sampling rate for {kind}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_specs() {
        let cases: &[(&str, &[(EventKind, u32)])] = &[
            ("makemap:0.01", &[(EventKind::MakeMap, 1)]),
            ("newgoroutine:0.1", &[(EventKind::NewGoroutine, 10)]),
            ("makeslice:0.5", &[(EventKind::MakeSlice, 50)]),
            ("newobject:1.0", &[(EventKind::NewObject, 100)]),
            (
                "makemap:0.01,newgoroutine:0.5,makeslice:0.99",
                &[
                    (EventKind::MakeMap, 1),
                    (EventKind::NewGoroutine, 50),
                    (EventKind::MakeSlice, 99),
                ],
            ),
            ("", &[]),
            ("makemap:0", &[(EventKind::MakeMap, 0)]),
            // Rounding: 0.001 rounds down, 0.005 rounds up.
            ("makemap:0.001", &[(EventKind::MakeMap, 0)]),
            ("makemap:0.005", &[(EventKind::MakeMap, 1)]),
            ("makemap:0.123456789", &[(EventKind::MakeMap, 12)]),
            // Spaces around names and values are tolerated.
            (
                " makemap : 0.5 , newgoroutine : 0.1 ",
                &[(EventKind::MakeMap, 50), (EventKind::NewGoroutine, 10)],
            ),
            // Later duplicate wins.
            ("makemap:0.1,makemap:0.5", &[(EventKind::MakeMap, 50)]),
        ];

        for (input, want) in cases {
            let got = parse_sampling_rates(input).unwrap_or_else(|e| panic!("{input:?}: {e}"));
            assert_eq!(got.len(), want.len(), "{input:?}");
            for (kind, percent) in *want {
                assert_eq!(got.get(kind), Some(percent), "{input:?}");
            }
        }
    }

    #[test]
    fn parse_invalid_specs() {
        let cases: &[(&str, &str)] = &[
            ("makemap0.5", "invalid sampling rate format"),
            ("makemap:", "invalid rate for makemap"),
            (":0.5", "unknown event name"),
            ("nonexistent:0.5", "unknown event name: nonexistent"),
            ("makemap:abc", "invalid rate for makemap"),
            ("makemap:1.1", "sampling rate must be between 0 and 1"),
            ("makemap:-0.1", "sampling rate must be between 0 and 1"),
            ("makemap:0.5:extra", "invalid sampling rate format"),
        ];

        for (input, want) in cases {
            let err = parse_sampling_rates(input).unwrap_err();
            assert!(
                format!("{err:#}").contains(want),
                "{input:?}: got {err:#}, want substring {want:?}"
            );
        }
    }
}
