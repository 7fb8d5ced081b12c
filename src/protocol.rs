//! Wire framing for the instrument's command protocol.
//!
//! The photometer speaks a half-duplex, semicolon-delimited text protocol:
//! every command is a single ASCII key character followed by an integer value
//! and a literal `;` terminator, e.g. `n1000;`. Multiple commands may be
//! concatenated into one write. Responses are `;`-terminated text as well,
//! though the firmware does not terminate large trace buffers reliably (the
//! link layer compensates with timeout-based completion detection).
//!
//! Two firmware revisions are in the field. They differ only in which gain
//! keys exist and in the parameter-string ordering, so both collapse into one
//! framer parameterized by [`ProtocolRev`] instead of per-revision
//! duplicates.

use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Frame terminator byte marking the end of one command or response unit.
pub const TERMINATOR: u8 = b';';

/// Command keys understood by the trace controller firmware.
///
/// Keys `w`, `x`, `y` carry the three actinic-intensity phases; the remaining
/// acquisition parameters each have a single key. `g` doubles as the legacy
/// visible-channel gain key in parameter strings, but as a bare command it
/// requests trace-data retrieval (the firmware disambiguates by context).
pub mod keys {
    /// Number of sample points in a trace.
    pub const NUM_POINTS: char = 'n';
    /// Interval between measurement pulses, in microseconds.
    pub const PULSE_INTERVAL: char = 'i';
    /// Measurement pulse length, in microseconds.
    pub const PULSE_LENGTH: char = 'p';
    /// Measurement LED selector, IR bank.
    pub const MEAS_LED_IR: char = 'r';
    /// Measurement LED selector, visible bank.
    pub const MEAS_LED_VIS: char = 'v';
    /// Saturation-pulse begin offset, in points.
    pub const SAT_PULSE_BEGIN: char = 's';
    /// Saturation-pulse end offset, in points.
    pub const SAT_PULSE_END: char = 't';
    /// Trigger delay, in microseconds.
    pub const TRIGGER_DELAY: char = 'e';
    /// Actinic intensity, phases 0..2.
    pub const ACT_PHASE: [char; 3] = ['w', 'x', 'y'];
    /// Pulse mode: 0 none, 1 saturating, 2 light-response.
    pub const PULSE_MODE: char = 'z';
    /// Detector gain (current firmware; one programmable preamp).
    pub const GAIN: char = 'j';
    /// Visible-channel gain (legacy firmware only).
    pub const GAIN_VIS_LEGACY: char = 'g';
    /// IR-channel gain (legacy firmware only).
    pub const GAIN_IR_LEGACY: char = 'h';
    /// Set the standing actinic intensity (0-255).
    pub const ACTINIC: char = 'a';
    /// Gate the actinic output on (1) or off (0).
    pub const ACTINIC_GATE: char = 'u';
    /// Switch the measurement-pulser supply on (1) or off (0).
    pub const PULSER_POWER: char = 'q';
    /// Request the trace buffer.
    pub const RETRIEVE: char = 'g';
    /// Execute a trace.
    pub const EXECUTE: char = 'm';
    /// Request the firmware's current parameter set.
    pub const REQUEST_PARAMS: char = 'd';
}

/// Firmware protocol revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolRev {
    /// Original controller boards: per-channel gain keys `g`/`h`, parameter
    /// string ordered `n,i,g,h,v,r,p,s,t,w,x,y,z`.
    Legacy,
    /// Current boards: single gain key `j`, parameter string in stable
    /// alphabetical key order (the provenance contract).
    #[default]
    Rev2,
}

/// Encode a single command into wire bytes: `"{key}{value};"`.
///
/// Values are integers or small enumerations, so no escaping is needed.
pub fn encode<V: Display>(key: char, value: V) -> Vec<u8> {
    format!("{key}{value};").into_bytes()
}

/// Encode a batch of commands as one concatenated write.
pub fn encode_batch<V: Display>(pairs: &[(char, V)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in pairs {
        out.extend_from_slice(&encode(*key, value));
    }
    out
}

/// Best-effort UTF-8 decode of a received chunk.
///
/// A decode failure is non-fatal: the fragment is dropped and an empty
/// string returned, so one garbled chunk never aborts a read in progress.
pub fn decode_chunk(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(e) => {
            debug!("dropping undecodable fragment ({} bytes): {}", bytes.len(), e);
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_single_command() {
        assert_eq!(encode(keys::NUM_POINTS, 1000), b"n1000;");
        assert_eq!(encode(keys::EXECUTE, 0), b"m0;");
    }

    #[test]
    fn test_encode_batch_concatenates() {
        let bytes = encode_batch(&[('n', 1000), ('i', 248), ('p', 50)]);
        assert_eq!(bytes, b"n1000;i248;p50;");
    }

    #[test]
    fn test_decode_chunk_valid_utf8() {
        assert_eq!(decode_chunk(b"0,125,3301\r\n"), "0,125,3301\r\n");
    }

    #[test]
    fn test_decode_chunk_invalid_utf8_drops_fragment() {
        assert_eq!(decode_chunk(&[0xff, 0xfe, b'1']), "");
    }

    #[test]
    fn test_default_rev_is_current() {
        assert_eq!(ProtocolRev::default(), ProtocolRev::Rev2);
    }
}
