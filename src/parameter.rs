//! Acquisition parameters for a single trace.
//!
//! A [`ParameterSet`] is the full configuration for one hardware-timed
//! measurement sweep. Its canonical string form serves two purposes at once:
//! it is the exact payload written to the instrument before a trace, and it
//! is attached verbatim to the resulting [`crate::trace::TraceRecord`] as the
//! provenance key downstream tooling groups data by. Key order is therefore
//! part of the contract and must be stable across runs.

use crate::error::{AppResult, PispecError};
use crate::protocol::{keys, ProtocolRev};
use serde::{Deserialize, Serialize};

/// Full configuration for one trace.
///
/// All numeric fields are non-negative by construction (unsigned types);
/// `act_intensity` always has exactly three elements, one per actinic phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterSet {
    /// Number of sample points in the trace.
    pub num_points: u32,
    /// Interval between measurement pulses, microseconds.
    pub pulse_interval: u32,
    /// Measurement pulse length, microseconds.
    pub pulse_length: u32,
    /// Measurement LED index, IR bank.
    pub meas_led_ir: u8,
    /// Measurement LED index, visible bank.
    pub meas_led_vis: u8,
    /// Visible-channel gain selector (wire key only on legacy firmware).
    pub gain_vis: u8,
    /// IR-channel gain selector.
    pub gain_ir: u8,
    /// Actinic intensity for phases 0..2.
    pub act_intensity: [u16; 3],
    /// Saturation-pulse begin offset, in points.
    pub sat_pulse_begin: u32,
    /// Saturation-pulse end offset, in points.
    pub sat_pulse_end: u32,
    /// Trigger delay, microseconds.
    pub trigger_delay: u32,
    /// Pulse mode: 0 none, 1 saturating, 2 light-response.
    pub pulse_mode: u8,
    /// Free-text note carried onto the trace record; never sent on the wire.
    pub trace_note: String,
}

impl Default for ParameterSet {
    fn default() -> Self {
        Self {
            num_points: 10_000,
            pulse_interval: 100,
            pulse_length: 50,
            meas_led_ir: 5,
            meas_led_vis: 0,
            gain_vis: 0,
            gain_ir: 0,
            act_intensity: [0, 0, 0],
            sat_pulse_begin: 500,
            sat_pulse_end: 600,
            trigger_delay: 0,
            pulse_mode: 1,
            trace_note: String::new(),
        }
    }
}

impl ParameterSet {
    /// Ordered key/value pairs for the given protocol revision.
    ///
    /// Rev2 order is the canonical contract: `e i j n p r s t v w x y z`.
    /// Legacy boards used per-channel gain keys and the historical ordering.
    pub fn wire_pairs(&self, rev: ProtocolRev) -> Vec<(char, u32)> {
        let [w, x, y] = self.act_intensity;
        match rev {
            ProtocolRev::Rev2 => vec![
                (keys::TRIGGER_DELAY, self.trigger_delay),
                (keys::PULSE_INTERVAL, self.pulse_interval),
                (keys::GAIN, u32::from(self.gain_ir)),
                (keys::NUM_POINTS, self.num_points),
                (keys::PULSE_LENGTH, self.pulse_length),
                (keys::MEAS_LED_IR, u32::from(self.meas_led_ir)),
                (keys::SAT_PULSE_BEGIN, self.sat_pulse_begin),
                (keys::SAT_PULSE_END, self.sat_pulse_end),
                (keys::MEAS_LED_VIS, u32::from(self.meas_led_vis)),
                (keys::ACT_PHASE[0], u32::from(w)),
                (keys::ACT_PHASE[1], u32::from(x)),
                (keys::ACT_PHASE[2], u32::from(y)),
                (keys::PULSE_MODE, u32::from(self.pulse_mode)),
            ],
            ProtocolRev::Legacy => vec![
                (keys::NUM_POINTS, self.num_points),
                (keys::PULSE_INTERVAL, self.pulse_interval),
                (keys::GAIN_VIS_LEGACY, u32::from(self.gain_vis)),
                (keys::GAIN_IR_LEGACY, u32::from(self.gain_ir)),
                (keys::MEAS_LED_VIS, u32::from(self.meas_led_vis)),
                (keys::MEAS_LED_IR, u32::from(self.meas_led_ir)),
                (keys::PULSE_LENGTH, self.pulse_length),
                (keys::SAT_PULSE_BEGIN, self.sat_pulse_begin),
                (keys::SAT_PULSE_END, self.sat_pulse_end),
                (keys::ACT_PHASE[0], u32::from(w)),
                (keys::ACT_PHASE[1], u32::from(x)),
                (keys::ACT_PHASE[2], u32::from(y)),
                (keys::PULSE_MODE, u32::from(self.pulse_mode)),
            ],
        }
    }

    /// Canonical command string: the wire payload and provenance key.
    pub fn canonical_string(&self, rev: ProtocolRev) -> String {
        self.wire_pairs(rev)
            .into_iter()
            .map(|(k, v)| format!("{k}{v};"))
            .collect()
    }

    /// Parse a parameter string back into a `ParameterSet`.
    ///
    /// Accepts key/value pairs in any order (the firmware's `d` echo is not
    /// guaranteed to match the canonical ordering). Unknown keys and values
    /// out of range for their field are errors; missing keys keep their
    /// defaults. The trace note never travels over the wire, so it comes
    /// back empty.
    pub fn parse(s: &str) -> AppResult<Self> {
        let mut p = Self::default();
        for field in s.split(';') {
            let field = field.trim();
            if field.is_empty() {
                continue;
            }
            let mut chars = field.chars();
            let key = chars.next().unwrap_or_default();
            let value: u32 = chars.as_str().parse().map_err(|_| {
                PispecError::ParameterParse(format!("bad value in field '{field}'"))
            })?;
            match key {
                k if k == keys::NUM_POINTS => p.num_points = value,
                k if k == keys::PULSE_INTERVAL => p.pulse_interval = value,
                k if k == keys::PULSE_LENGTH => p.pulse_length = value,
                k if k == keys::MEAS_LED_IR => p.meas_led_ir = narrow(field, value)?,
                k if k == keys::MEAS_LED_VIS => p.meas_led_vis = narrow(field, value)?,
                k if k == keys::GAIN => p.gain_ir = narrow(field, value)?,
                k if k == keys::GAIN_VIS_LEGACY => p.gain_vis = narrow(field, value)?,
                k if k == keys::GAIN_IR_LEGACY => p.gain_ir = narrow(field, value)?,
                k if k == keys::SAT_PULSE_BEGIN => p.sat_pulse_begin = value,
                k if k == keys::SAT_PULSE_END => p.sat_pulse_end = value,
                k if k == keys::TRIGGER_DELAY => p.trigger_delay = value,
                k if k == keys::PULSE_MODE => p.pulse_mode = narrow(field, value)?,
                k if k == keys::ACT_PHASE[0] => p.act_intensity[0] = narrow(field, value)?,
                k if k == keys::ACT_PHASE[1] => p.act_intensity[1] = narrow(field, value)?,
                k if k == keys::ACT_PHASE[2] => p.act_intensity[2] = narrow(field, value)?,
                _ => {
                    return Err(PispecError::ParameterParse(format!(
                        "unknown key '{key}' in field '{field}'"
                    )))
                }
            }
        }
        Ok(p)
    }
}

/// Checked narrowing for fields smaller than the wire's u32 value space.
fn narrow<T: TryFrom<u32>>(field: &str, value: u32) -> AppResult<T> {
    T::try_from(value).map_err(|_| {
        PispecError::ParameterParse(format!("value out of range in field '{field}'"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p700_example() -> ParameterSet {
        ParameterSet {
            num_points: 1000,
            pulse_interval: 1000,
            pulse_length: 50,
            meas_led_ir: 5,
            meas_led_vis: 0,
            gain_vis: 0,
            gain_ir: 2,
            act_intensity: [0, 120, 0],
            sat_pulse_begin: 200,
            sat_pulse_end: 400,
            trigger_delay: 0,
            pulse_mode: 1,
            trace_note: "800nm".to_string(),
        }
    }

    #[test]
    fn test_canonical_string_rev2_key_order() {
        let s = p700_example().canonical_string(ProtocolRev::Rev2);
        assert_eq!(
            s,
            "e0;i1000;j2;n1000;p50;r5;s200;t400;v0;w0;x120;y0;z1;"
        );
    }

    #[test]
    fn test_canonical_string_legacy_key_order() {
        let s = p700_example().canonical_string(ProtocolRev::Legacy);
        assert_eq!(
            s,
            "n1000;i1000;g0;h2;v0;r5;p50;s200;t400;w0;x120;y0;z1;"
        );
    }

    #[test]
    fn test_canonical_string_is_stable() {
        let p = p700_example();
        assert_eq!(
            p.canonical_string(ProtocolRev::Rev2),
            p.clone().canonical_string(ProtocolRev::Rev2)
        );
    }

    #[test]
    fn test_parse_round_trip_is_idempotent() {
        for rev in [ProtocolRev::Rev2, ProtocolRev::Legacy] {
            let canonical = p700_example().canonical_string(rev);
            let reparsed = ParameterSet::parse(&canonical).unwrap();
            assert_eq!(reparsed.canonical_string(rev), canonical);
        }
    }

    #[test]
    fn test_parse_accepts_any_key_order() {
        let p = ParameterSet::parse("z2;n500;i248;").unwrap();
        assert_eq!(p.pulse_mode, 2);
        assert_eq!(p.num_points, 500);
        assert_eq!(p.pulse_interval, 248);
        // Missing keys keep defaults
        assert_eq!(p.pulse_length, ParameterSet::default().pulse_length);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ParameterSet::parse("n12x4;").is_err());
        assert!(ParameterSet::parse("k9;").is_err());
    }

    #[test]
    fn test_parse_rejects_out_of_range_values() {
        assert!(ParameterSet::parse("r300;").is_err());
        assert!(ParameterSet::parse("x70000;").is_err());
        assert!(ParameterSet::parse("z256;").is_err());
        assert_eq!(ParameterSet::parse("r255;").unwrap().meas_led_ir, 255);
    }

    #[test]
    fn test_note_not_on_wire() {
        let s = p700_example().canonical_string(ProtocolRev::Rev2);
        assert!(!s.contains("800nm"));
        assert_eq!(ParameterSet::parse(&s).unwrap().trace_note, "");
    }
}
