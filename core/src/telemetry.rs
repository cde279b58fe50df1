//! Binary telemetry frames read straight from the backplane
//!
//! Frame format (all integers little-endian, fields packed):
//!
//! ```text
//! magic:        u32  = 0x48455254 ("HERT")
//! frame:        u64
//! time_seconds: f64
//! count:        u32
//! values:       count × f64, in subscription order
//! ```
//!
//! Total size is `24 + 8 × count` bytes.
use std::sync::Arc;

use crate::backplane::Backplane;
use crate::error::TypedResult;
use crate::problem;

/// "HERT" in ASCII
pub const TELEMETRY_MAGIC: u32 = 0x4845_5254;
/// Size of the fixed frame header in bytes
pub const TELEMETRY_HEADER_SIZE: usize = 24;

/// Encodes telemetry frames for one subscription
///
/// The signal list is fixed at construction; every [`TelemetryEncoder::encode`]
/// is a pure function of the header fields and signal values at the instant
/// of the read.
#[derive(Debug, Clone)]
pub struct TelemetryEncoder {
    backplane: Arc<Backplane>,
    signals: Vec<String>,
}

impl TelemetryEncoder {
    pub fn new(backplane: Arc<Backplane>, signals: Vec<String>) -> Self {
        Self { backplane, signals }
    }

    /// Signal names included in each frame, in subscription order
    pub fn signals(&self) -> &[String] {
        &self.signals
    }

    pub fn signal_count(&self) -> usize {
        self.signals.len()
    }

    /// Size in bytes of the frames produced by this encoder
    pub fn frame_size(&self) -> usize {
        TELEMETRY_HEADER_SIZE + self.signals.len() * 8
    }

    /// Reads the current backplane state into a binary frame
    pub fn encode(&self) -> TypedResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.frame_size());
        out.extend_from_slice(&TELEMETRY_MAGIC.to_le_bytes());
        out.extend_from_slice(&self.backplane.frame().to_le_bytes());
        out.extend_from_slice(&self.backplane.time().to_le_bytes());
        out.extend_from_slice(&(self.signals.len() as u32).to_le_bytes());
        for name in &self.signals {
            out.extend_from_slice(&self.backplane.get_signal(name)?.to_le_bytes());
        }
        Ok(out)
    }
}

/// A decoded telemetry frame
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryFrame {
    pub frame: u64,
    pub time_seconds: f64,
    pub values: Vec<f64>,
}

/// Decodes a binary telemetry frame, validating magic and length
pub fn decode(data: &[u8]) -> TypedResult<TelemetryFrame> {
    if data.len() < TELEMETRY_HEADER_SIZE {
        return Err(problem!(
            Protocol,
            "Telemetry frame too short: {} < {TELEMETRY_HEADER_SIZE}",
            data.len()
        ));
    }

    let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
    if magic != TELEMETRY_MAGIC {
        return Err(problem!(
            Protocol,
            "Invalid telemetry magic: {magic:#x}, expected {TELEMETRY_MAGIC:#x}"
        ));
    }

    let frame = u64::from_le_bytes(data[4..12].try_into().unwrap());
    let time_seconds = f64::from_le_bytes(data[12..20].try_into().unwrap());
    let count = u32::from_le_bytes(data[20..24].try_into().unwrap()) as usize;

    let expected = TELEMETRY_HEADER_SIZE + count * 8;
    if data.len() < expected {
        return Err(problem!(
            Protocol,
            "Telemetry frame truncated: {} < {expected}",
            data.len()
        ));
    }

    let values = (0..count)
        .map(|i| {
            let at = TELEMETRY_HEADER_SIZE + i * 8;
            f64::from_le_bytes(data[at..at + 8].try_into().unwrap())
        })
        .collect();

    Ok(TelemetryFrame {
        frame,
        time_seconds,
        values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalDescriptor;

    fn test_backplane(tag: &str) -> Arc<Backplane> {
        let name = format!("/hermes_telemetry_test_{}_{tag}", std::process::id());
        let signals = [
            SignalDescriptor::new("a.x"),
            SignalDescriptor::new("a.y"),
            SignalDescriptor::new("b.z"),
        ];
        Arc::new(Backplane::create(&name, &signals).unwrap())
    }

    #[test]
    fn frame_format_round_trip() {
        let bp = test_backplane("round_trip");
        bp.set_frame(17);
        bp.set_time_ns(2_500_000_000);
        bp.set_signal("a.x", 1.0).unwrap();
        bp.set_signal("a.y", -2.5).unwrap();
        bp.set_signal("b.z", 1e12).unwrap();

        let encoder = TelemetryEncoder::new(
            bp.clone(),
            vec!["b.z".to_string(), "a.x".to_string()],
        );
        let bytes = encoder.encode().unwrap();
        assert_eq!(bytes.len(), 24 + 2 * 8);
        assert_eq!(bytes.len(), encoder.frame_size());
        assert_eq!(&bytes[0..4], &TELEMETRY_MAGIC.to_le_bytes());

        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.frame, 17);
        assert_eq!(frame.time_seconds, 2.5);
        assert_eq!(frame.values, vec![1e12, 1.0]);

        bp.destroy().unwrap();
    }

    #[test]
    fn empty_subscription_is_header_only() {
        let bp = test_backplane("empty");
        let encoder = TelemetryEncoder::new(bp.clone(), Vec::new());
        let bytes = encoder.encode().unwrap();
        assert_eq!(bytes.len(), TELEMETRY_HEADER_SIZE);
        assert!(decode(&bytes).unwrap().values.is_empty());
        bp.destroy().unwrap();
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode(&[0u8; 10]).is_err());

        let mut bytes = vec![0u8; 24];
        bytes[0..4].copy_from_slice(&0xdead_beefu32.to_le_bytes());
        assert!(decode(&bytes).is_err());

        // Count promises more values than present
        let bp = test_backplane("truncated");
        let encoder = TelemetryEncoder::new(bp.clone(), vec!["a.x".to_string()]);
        let mut bytes = encoder.encode().unwrap();
        bytes.truncate(24);
        assert!(decode(&bytes).is_err());
        bp.destroy().unwrap();
    }
}
