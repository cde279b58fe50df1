//! Injection module holding externally written signal values
//!
//! Values persist between steps; there are no internal dynamics. External
//! systems write the signals through the control channel or shared memory,
//! and wires route them onward.
use std::sync::Arc;

use hermes_core::backplane::Backplane;
use hermes_core::error::TypedResult;

use crate::module::InprocModule;
use crate::registry::InprocContext;

pub struct Injection {
    backplane: Arc<Backplane>,
    signals: Vec<String>,
}

impl Injection {
    pub fn construct(ctx: InprocContext) -> Box<dyn InprocModule> {
        Box::new(Self {
            backplane: ctx.backplane,
            signals: ctx.signals,
        })
    }

    fn zero_all(&self) -> TypedResult<()> {
        for signal in &self.signals {
            self.backplane.set_signal(signal, 0.0)?;
        }
        Ok(())
    }
}

impl InprocModule for Injection {
    fn stage(&mut self) -> TypedResult<()> {
        self.zero_all()
    }

    fn step(&mut self, _dt: f64) -> TypedResult<()> {
        Ok(())
    }

    fn reset(&mut self) -> TypedResult<()> {
        self.zero_all()
    }
}
