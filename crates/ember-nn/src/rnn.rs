use ember_core::{Device, EmberError, Kind, Result, Tensor};

use crate::config::RnnConfig;
use crate::state::RecurrentState;

/// Result of one time step.
#[derive(Debug)]
pub struct Step {
    /// Output for the step, a length-1 sequence.
    pub output: Tensor,
    pub state: RecurrentState,
    /// Number of tensors the native call produced.
    pub arity: usize,
}

/// A recurrent layer driven by the fused native kernels.
///
/// Both [`Rnn::step`] and [`Rnn::seq`] make exactly one native call; the
/// recurrence over time happens inside the native library.
pub trait Rnn {
    fn config(&self) -> &RnnConfig;

    /// Outputs of this layer's native call.
    fn arity(&self) -> usize;

    /// Zero-filled state for `batch` sequences.
    fn zero_state(&self, batch: i64) -> Result<RecurrentState>;

    /// Run a whole sequence from `state`, returning the output sequence and
    /// the final state.
    fn seq_init(&self, input: &Tensor, state: &RecurrentState) -> Result<(Tensor, RecurrentState)>;

    /// Run a whole sequence from the zero state.
    fn seq(&self, input: &Tensor) -> Result<(Tensor, RecurrentState)> {
        let shape = input.shape()?;
        let batch = shape
            .dim(self.config().batch_axis())
            .ok_or_else(|| EmberError::InvalidArgument(format!("sequence input {shape} has no batch axis")))?;
        let state = self.zero_state(batch)?;
        self.seq_init(input, &state)
    }

    /// Advance by one time step. `input` is `[batch, features]`.
    fn step(&self, input: &Tensor, state: &RecurrentState) -> Result<Step> {
        let seq = input.unsqueeze(self.config().seq_axis())?;
        let (output, state) = self.seq_init(&seq, state)?;
        Ok(Step {
            output,
            state,
            arity: self.arity(),
        })
    }
}

/// Weights of a stacked, possibly bidirectional recurrent layer.
///
/// Stored per layer and direction as `w_ih`, `w_hh`, then `b_ih`, `b_hh` when
/// biases are enabled, the order the fused kernels consume them in.
#[derive(Debug)]
pub(crate) struct RnnParams {
    pub tensors: Vec<Tensor>,
    pub names: Vec<String>,
}

impl RnnParams {
    pub fn new(input_dim: i64, hidden_dim: i64, gates: i64, config: &RnnConfig, device: Device) -> Result<Self> {
        if input_dim <= 0 || hidden_dim <= 0 {
            return Err(EmberError::InvalidArgument(format!(
                "input and hidden sizes must be positive, got {input_dim} and {hidden_dim}"
            )));
        }
        config.validate()?;
        let directions = config.directions();
        let gate_dim = gates * hidden_dim;

        let mut tensors = Vec::new();
        let mut names = Vec::new();
        for layer in 0..config.num_layers {
            let in_dim = if layer == 0 {
                input_dim
            } else {
                hidden_dim * directions as i64
            };
            for direction in 0..directions {
                let suffix = if direction == 1 { "_reverse" } else { "" };
                let mut push = |name: &str, size: &[i64]| -> Result<()> {
                    tensors.push(Tensor::randn(size, Kind::Float, device)?);
                    names.push(format!("{name}_l{layer}{suffix}"));
                    Ok(())
                };
                push("weight_ih", &[gate_dim, in_dim])?;
                push("weight_hh", &[gate_dim, hidden_dim])?;
                if config.has_biases {
                    push("bias_ih", &[gate_dim])?;
                    push("bias_hh", &[gate_dim])?;
                }
            }
        }
        Ok(Self { tensors, names })
    }

    pub fn named(&self) -> Vec<(&str, &Tensor)> {
        self.names.iter().map(String::as_str).zip(&self.tensors).collect()
    }
}

/// Shape `[layers × directions, batch, hidden]` of every state tensor.
pub(crate) fn state_shape(config: &RnnConfig, batch: i64, hidden_dim: i64) -> Result<[i64; 3]> {
    if batch <= 0 {
        return Err(EmberError::InvalidArgument(format!("batch size must be positive, got {batch}")));
    }
    Ok([config.state_layers() as i64, batch, hidden_dim])
}
