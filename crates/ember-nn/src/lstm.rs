use ember_core::ops::{self, RnnFlags};
use ember_core::{Device, Kind, Result, Tensor};

use crate::config::RnnConfig;
use crate::rnn::{state_shape, Rnn, RnnParams};
use crate::state::RecurrentState;

// Output sequence, final hidden and final cell.
const OUTPUTS: usize = 3;

/// Long short-term memory layer. State is [`RecurrentState::Dual`].
///
/// ```no_run
/// use ember_core::{Device, Kind, Tensor};
/// use ember_nn::{Lstm, Rnn, RnnConfig};
///
/// # fn main() -> ember_core::Result<()> {
/// let lstm = Lstm::new(2, 4, RnnConfig::default(), Device::Cpu)?;
/// let state = lstm.zero_state(5)?;
/// let input = Tensor::randn(&[5, 2], Kind::Float, Device::Cpu)?;
/// let step = lstm.step(&input, &state)?;
/// assert_eq!(step.state.hidden().size()?, vec![1, 5, 4]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Lstm {
    params: RnnParams,
    flags: RnnFlags,
    config: RnnConfig,
    hidden_dim: i64,
    device: Device,
}

impl Lstm {
    const GATES: i64 = 4;

    pub fn new(input_dim: i64, hidden_dim: i64, config: RnnConfig, device: Device) -> Result<Self> {
        let params = RnnParams::new(input_dim, hidden_dim, Self::GATES, &config, device)?;
        let flags = config.flags()?;
        tracing::debug!(
            input_dim,
            hidden_dim,
            layers = config.num_layers,
            bidirectional = config.bidirectional,
            %device,
            "built LSTM"
        );
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

    /// Parameters named as `weight_ih_l0`, `bias_hh_l1_reverse`, ...
    pub fn named_parameters(&self) -> Vec<(&str, &Tensor)> {
        self.params.named()
    }
}

impl Rnn for Lstm {
    fn config(&self) -> &RnnConfig {
        &self.config
    }

    fn arity(&self) -> usize {
        OUTPUTS
    }

    fn zero_state(&self, batch: i64) -> Result<RecurrentState> {
        let shape = state_shape(&self.config, batch, self.hidden_dim)?;
        Ok(RecurrentState::Dual {
            hidden: Tensor::zeros(&shape, Kind::Float, self.device)?,
            cell: Tensor::zeros(&shape, Kind::Float, self.device)?,
        })
    }

    fn seq_init(&self, input: &Tensor, state: &RecurrentState) -> Result<(Tensor, RecurrentState)> {
        let hx = state.expect_dual()?;
        let [output, hidden, cell] = ops::call::<OUTPUTS, _>(&ops::Lstm {
            input,
            hx,
            params: &self.params.tensors,
            flags: self.flags,
        })?;
        Ok((output, RecurrentState::Dual { hidden, cell }))
    }
}
