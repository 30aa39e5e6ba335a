//! Recurrent layer tests, run against the fake runtime.
//! Run with: cargo test -p ember-nn

use ember_core::{grad, live_tensors, Device, EmberError, Kind, Tensor};
use ember_nn::{Gru, Lstm, RecurrentState, Rnn, RnnConfig};
use ember_sys::fake;
use serial_test::serial;

const BATCH: i64 = 5;
const SEQ_LEN: i64 = 3;
const INPUT: i64 = 2;
const HIDDEN: i64 = 4;

fn setup() {
    let _ = ember_core::runtime::install(fake::api());
}

fn randn(size: &[i64]) -> Tensor {
    Tensor::randn(size, Kind::Float, Device::Cpu).unwrap()
}

fn configs() -> Vec<RnnConfig> {
    let mut out = Vec::new();
    for num_layers in [1, 2] {
        for bidirectional in [false, true] {
            out.push(RnnConfig {
                num_layers,
                bidirectional,
                ..Default::default()
            });
        }
    }
    out
}

fn state_dims(cfg: &RnnConfig) -> Vec<i64> {
    vec![(cfg.num_layers * cfg.directions()) as i64, BATCH, HIDDEN]
}

// ============================================================================
// LSTM
// ============================================================================

#[test]
#[serial]
fn test_lstm_zero_state_then_step() {
    setup();
    let lstm = Lstm::new(INPUT, HIDDEN, RnnConfig::default(), Device::Cpu).unwrap();
    let state = lstm.zero_state(BATCH).unwrap();
    assert_eq!(state.tag(), "dual");
    assert_eq!(state.hidden().size().unwrap(), vec![1, 5, 4]);
    assert_eq!(state.cell().unwrap().size().unwrap(), vec![1, 5, 4]);

    let input = randn(&[BATCH, INPUT]);
    let step = lstm.step(&input, &state).unwrap();
    assert_eq!(step.arity, 3);
    assert_eq!(step.output.size().unwrap(), vec![5, 1, 4]);
    match &step.state {
        RecurrentState::Dual { hidden, cell } => {
            assert_eq!(hidden.size().unwrap(), vec![1, 5, 4]);
            assert_eq!(cell.size().unwrap(), vec![1, 5, 4]);
        }
        other => panic!("expected a dual state, got {}", other.tag()),
    }
    assert_eq!(step.state.batch_size().unwrap(), BATCH);
}

#[test]
#[serial]
fn test_lstm_shape_grid() {
    setup();
    for cfg in configs() {
        let lstm = Lstm::new(INPUT, HIDDEN, cfg.clone(), Device::Cpu).unwrap();
        let want = state_dims(&cfg);

        let state = lstm.zero_state(BATCH).unwrap();
        let step = lstm.step(&randn(&[BATCH, INPUT]), &state).unwrap();
        for t in step.state.tensors() {
            assert_eq!(t.size().unwrap(), want, "{cfg:?}");
        }

        let (output, last) = lstm.seq(&randn(&[BATCH, SEQ_LEN, INPUT])).unwrap();
        let dirs = cfg.directions() as i64;
        assert_eq!(output.size().unwrap(), vec![BATCH, SEQ_LEN, HIDDEN * dirs], "{cfg:?}");
        assert_eq!(last.hidden().size().unwrap(), want);
    }
}

#[test]
#[serial]
fn test_lstm_step_is_one_native_call() {
    setup();
    let lstm = Lstm::new(INPUT, HIDDEN, RnnConfig::default(), Device::Cpu).unwrap();
    let state = lstm.zero_state(BATCH).unwrap();
    let input = randn(&[BATCH, INPUT]);

    let before = fake::calls("atg_lstm");
    let step = lstm.step(&input, &state).unwrap();
    let step = lstm.step(&input, &step.state).unwrap();
    assert_eq!(fake::calls("atg_lstm"), before + 2);
    assert_eq!(step.state.hidden().size().unwrap(), vec![1, 5, 4]);
}

#[test]
#[serial]
fn test_lstm_seq_is_one_native_call() {
    setup();
    let lstm = Lstm::new(INPUT, HIDDEN, RnnConfig::default(), Device::Cpu).unwrap();
    let input = randn(&[BATCH, 50, INPUT]);
    let before = fake::calls("atg_lstm");
    let (output, _) = lstm.seq(&input).unwrap();
    assert_eq!(fake::calls("atg_lstm"), before + 1);
    assert_eq!(output.size().unwrap(), vec![BATCH, 50, HIDDEN]);
}

#[test]
#[serial]
fn test_lstm_time_major() {
    setup();
    let cfg = RnnConfig {
        batch_first: false,
        ..Default::default()
    };
    let lstm = Lstm::new(INPUT, HIDDEN, cfg, Device::Cpu).unwrap();
    let (output, state) = lstm.seq(&randn(&[SEQ_LEN, BATCH, INPUT])).unwrap();
    assert_eq!(output.size().unwrap(), vec![SEQ_LEN, BATCH, HIDDEN]);
    assert_eq!(state.batch_size().unwrap(), BATCH);

    let step = lstm.step(&randn(&[BATCH, INPUT]), &state).unwrap();
    assert_eq!(step.output.size().unwrap(), vec![1, BATCH, HIDDEN]);
}

#[test]
#[serial]
fn test_lstm_rejects_single_state() {
    setup();
    let lstm = Lstm::new(INPUT, HIDDEN, RnnConfig::default(), Device::Cpu).unwrap();
    let wrong = RecurrentState::Single(Tensor::zeros(&[1, BATCH, HIDDEN], Kind::Float, Device::Cpu).unwrap());
    let before = fake::calls("atg_lstm");
    let err = lstm.step(&randn(&[BATCH, INPUT]), &wrong).unwrap_err();
    assert!(matches!(
        err,
        EmberError::StateMismatch {
            expected: "dual",
            found: "single"
        }
    ));
    assert_eq!(fake::calls("atg_lstm"), before);
}

#[test]
#[serial]
fn test_lstm_parameter_layout() {
    setup();
    let cfg = RnnConfig {
        num_layers: 2,
        bidirectional: true,
        ..Default::default()
    };
    let lstm = Lstm::new(INPUT, HIDDEN, cfg, Device::Cpu).unwrap();
    let named = lstm.named_parameters();
    assert_eq!(named.len(), 16);
    assert_eq!(named[0].0, "weight_ih_l0");
    assert_eq!(named[0].1.size().unwrap(), vec![16, INPUT]);
    assert_eq!(named[5].0, "weight_hh_l0_reverse");
    // Second layer reads both directions of the first.
    assert_eq!(named[8].0, "weight_ih_l1");
    assert_eq!(named[8].1.size().unwrap(), vec![16, 2 * HIDDEN]);
    assert_eq!(named[15].0, "bias_hh_l1_reverse");
}

// ============================================================================
// GRU
// ============================================================================

#[test]
#[serial]
fn test_gru_shape_grid() {
    setup();
    for cfg in configs() {
        let gru = Gru::new(INPUT, HIDDEN, cfg.clone(), Device::Cpu).unwrap();
        let want = state_dims(&cfg);

        let state = gru.zero_state(BATCH).unwrap();
        assert_eq!(state.tag(), "single");
        let step = gru.step(&randn(&[BATCH, INPUT]), &state).unwrap();
        assert_eq!(step.arity, 2);
        assert!(step.state.cell().is_none());
        assert_eq!(step.state.hidden().size().unwrap(), want, "{cfg:?}");

        let (output, _) = gru.seq(&randn(&[BATCH, SEQ_LEN, INPUT])).unwrap();
        let dirs = cfg.directions() as i64;
        assert_eq!(output.size().unwrap(), vec![BATCH, SEQ_LEN, HIDDEN * dirs], "{cfg:?}");
    }
}

#[test]
#[serial]
fn test_gru_without_biases() {
    setup();
    let cfg = RnnConfig {
        has_biases: false,
        ..Default::default()
    };
    let gru = Gru::new(INPUT, HIDDEN, cfg, Device::Cpu).unwrap();
    assert_eq!(gru.parameters().len(), 2);
    let before = fake::calls("atg_gru");
    let (output, state) = gru.seq(&randn(&[BATCH, SEQ_LEN, INPUT])).unwrap();
    assert_eq!(fake::calls("atg_gru"), before + 1);
    assert_eq!(output.size().unwrap(), vec![BATCH, SEQ_LEN, HIDDEN]);
    assert_eq!(state.hidden().size().unwrap(), vec![1, BATCH, HIDDEN]);
}

#[test]
#[serial]
fn test_gru_rejects_dual_state() {
    setup();
    let gru = Gru::new(INPUT, HIDDEN, RnnConfig::default(), Device::Cpu).unwrap();
    let lstm = Lstm::new(INPUT, HIDDEN, RnnConfig::default(), Device::Cpu).unwrap();
    let wrong = lstm.zero_state(BATCH).unwrap();
    let err = gru.seq_init(&randn(&[BATCH, 1, INPUT]), &wrong).unwrap_err();
    assert_eq!(err.to_string(), "expected a single recurrent state, got a dual one");
}

// ============================================================================
// Construction and state lifecycle
// ============================================================================

#[test]
#[serial]
fn test_invalid_sizes_are_rejected() {
    setup();
    assert!(matches!(
        Lstm::new(0, HIDDEN, RnnConfig::default(), Device::Cpu),
        Err(EmberError::InvalidArgument(_))
    ));
    let gru = Gru::new(INPUT, HIDDEN, RnnConfig::default(), Device::Cpu).unwrap();
    assert!(matches!(gru.zero_state(0), Err(EmberError::InvalidArgument(_))));
}

#[test]
#[serial]
fn test_zero_state_follows_ambient_grad_mode() {
    setup();
    let lstm = Lstm::new(INPUT, HIDDEN, RnnConfig::default(), Device::Cpu).unwrap();
    grad::set_enabled(true).unwrap();
    let tracked = lstm.zero_state(BATCH).unwrap();
    let untracked = grad::with_disabled(|| lstm.zero_state(BATCH)).unwrap();
    assert!(tracked.tensors().iter().all(|t| t.grad_mode_at_creation()));
    assert!(untracked.tensors().iter().all(|t| !t.grad_mode_at_creation()));
    assert!(grad::is_enabled());
}

#[test]
#[serial]
fn test_step_arity_counts_native_outputs() {
    setup();
    let lstm = Lstm::new(INPUT, HIDDEN, RnnConfig::default(), Device::Cpu).unwrap();
    let gru = Gru::new(INPUT, HIDDEN, RnnConfig::default(), Device::Cpu).unwrap();
    let layers: [&dyn Rnn; 2] = [&lstm, &gru];
    let input = randn(&[BATCH, INPUT]);
    for layer in layers {
        let state = layer.zero_state(BATCH).unwrap();
        let before = live_tensors();
        let step = layer.step(&input, &state).unwrap();
        assert_eq!(step.arity, layer.arity());
        assert_eq!(live_tensors() - before, step.arity);
        assert_eq!(1 + step.state.tensors().len(), step.arity);
    }
}

#[test]
#[serial]
fn test_states_release_their_tensors() {
    setup();
    let lstm = Lstm::new(INPUT, HIDDEN, RnnConfig::default(), Device::Cpu).unwrap();
    let input = randn(&[BATCH, INPUT]);
    let before = live_tensors();
    {
        let state = lstm.zero_state(BATCH).unwrap();
        let step = lstm.step(&input, &state).unwrap();
        // Two zero tensors, then output, hidden, cell.
        assert_eq!(live_tensors(), before + 5);
        drop(state);
        assert_eq!(live_tensors(), before + 3);
        drop(step);
    }
    assert_eq!(live_tensors(), before);
}
