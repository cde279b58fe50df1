//! Wire router propagating values between signals
//!
//! Each wire transfers `dst ← src * gain + offset`. Wires execute in
//! insertion order before module stepping, so modules read already-routed
//! inputs. Duplicate destinations are allowed; the last wire in insertion
//! order wins.
use std::sync::Arc;

use hermes_core::backplane::Backplane;
use hermes_core::error::TypedResult;
use hermes_core::problem;

use crate::config::WireConfig;

/// A validated wire, ready for routing
#[derive(Debug, Clone)]
struct CompiledWire {
    src: String,
    dst: String,
    gain: f64,
    offset: f64,
}

/// Routes signal values through the configured wires each major frame
pub struct WireRouter {
    backplane: Arc<Backplane>,
    wires: Vec<CompiledWire>,
}

impl WireRouter {
    /// Validates every wire against the backplane directory and compiles
    /// the routing table
    pub fn compile(backplane: Arc<Backplane>, wiring: &[WireConfig]) -> TypedResult<Self> {
        let mut wires = Vec::with_capacity(wiring.len());
        for wire in wiring {
            if !backplane.contains(&wire.src) {
                return Err(problem!(Config, "Wire source signal not found: {}", wire.src));
            }
            if !backplane.contains(&wire.dst) {
                return Err(problem!(
                    Config,
                    "Wire destination signal not found: {}",
                    wire.dst
                ));
            }
            wires.push(CompiledWire {
                src: wire.src.clone(),
                dst: wire.dst.clone(),
                gain: wire.gain,
                offset: wire.offset,
            });
        }
        Ok(Self { backplane, wires })
    }

    pub fn wire_count(&self) -> usize {
        self.wires.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wires.is_empty()
    }

    /// Executes all wire transfers in insertion order
    pub fn route(&self) -> TypedResult<()> {
        for wire in &self.wires {
            let value = self.backplane.get_signal(&wire.src)?;
            self.backplane
                .set_signal(&wire.dst, value * wire.gain + wire.offset)?;
        }
        Ok(())
    }
}
