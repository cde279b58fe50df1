//! Mock physics module with deterministic first-order dynamics
//!
//! ```text
//! state  += input * dt
//! output  = input * 2 + state
//! ```
//!
//! Used to exercise wiring and multi-rate stepping without an external
//! numerical engine.
use std::sync::Arc;

use hermes_core::backplane::Backplane;
use hermes_core::error::TypedResult;

use crate::module::InprocModule;
use crate::registry::InprocContext;

pub struct MockPhysics {
    backplane: Arc<Backplane>,
    input_sig: String,
    output_sig: String,
    state_sig: String,
    state: f64,
}

impl MockPhysics {
    pub fn construct(ctx: InprocContext) -> Box<dyn InprocModule> {
        Box::new(Self {
            input_sig: format!("{}.input", ctx.module_name),
            output_sig: format!("{}.output", ctx.module_name),
            state_sig: format!("{}.state", ctx.module_name),
            backplane: ctx.backplane,
            state: 0.0,
        })
    }

    fn apply_initial_conditions(&mut self) -> TypedResult<()> {
        self.state = 0.0;
        self.backplane.set_signal(&self.input_sig, 0.0)?;
        self.backplane.set_signal(&self.output_sig, 0.0)?;
        self.backplane.set_signal(&self.state_sig, 0.0)?;
        Ok(())
    }
}

impl InprocModule for MockPhysics {
    fn stage(&mut self) -> TypedResult<()> {
        self.apply_initial_conditions()
    }

    fn step(&mut self, dt: f64) -> TypedResult<()> {
        let input = self.backplane.get_signal(&self.input_sig)?;

        self.state += input * dt;
        let output = input * 2.0 + self.state;

        self.backplane.set_signal(&self.output_sig, output)?;
        self.backplane.set_signal(&self.state_sig, self.state)?;
        Ok(())
    }

    fn reset(&mut self) -> TypedResult<()> {
        self.apply_initial_conditions()
    }
}
