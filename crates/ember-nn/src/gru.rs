use ember_core::ops::{self, RnnFlags};
use ember_core::{Device, Kind, Result, Tensor};

use crate::config::RnnConfig;
use crate::rnn::{state_shape, Rnn, RnnParams};
use crate::state::RecurrentState;

// Output sequence plus final hidden.
const OUTPUTS: usize = 2;

/// Gated recurrent unit layer. State is [`RecurrentState::Single`].
#[derive(Debug)]
pub struct Gru {
    params: RnnParams,
    flags: RnnFlags,
    config: RnnConfig,
    hidden_dim: i64,
    device: Device,
}

impl Gru {
    const GATES: i64 = 3;

    pub fn new(input_dim: i64, hidden_dim: i64, config: RnnConfig, device: Device) -> Result<Self> {
        let params = RnnParams::new(input_dim, hidden_dim, Self::GATES, &config, device)?;
        let flags = config.flags()?;
        tracing::debug!(input_dim, hidden_dim, layers = config.num_layers, %device, "built GRU");
        Ok(Self {
            params,
            flags,
            config,
            hidden_dim,
            device,
        })
    }

    pub fn hidden_dim(&self) -> i64 {
        self.hidden_dim
    }

    pub fn parameters(&self) -> &[Tensor] {
        &self.params.tensors
    }

    pub fn named_parameters(&self) -> Vec<(&str, &Tensor)> {
        self.params.named()
    }
}

impl Rnn for Gru {
    fn config(&self) -> &RnnConfig {
        &self.config
    }

    fn arity(&self) -> usize {
        OUTPUTS
    }

    fn zero_state(&self, batch: i64) -> Result<RecurrentState> {
        let shape = state_shape(&self.config, batch, self.hidden_dim)?;
        Ok(RecurrentState::Single(Tensor::zeros(&shape, Kind::Float, self.device)?))
    }

    fn seq_init(&self, input: &Tensor, state: &RecurrentState) -> Result<(Tensor, RecurrentState)> {
        let hx = state.expect_single()?;
        let [output, hidden] = ops::call::<OUTPUTS, _>(&ops::Gru {
            input,
            hx,
            params: &self.params.tensors,
            flags: self.flags,
        })?;
        Ok((output, RecurrentState::Single(hidden)))
    }
}
