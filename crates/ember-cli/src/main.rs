use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ember_core::{grad, runtime, Cuda, Device, Kind, Mps, RuntimeConfig, Tensor};
use ember_nn::{Lstm, RecurrentState, Rnn, RnnConfig};

#[derive(Parser)]
#[command(
    name = "ember",
    about = "Backend report and boundary self-check for the libtorch bindings",
    version
)]
struct Cli {
    /// Path to the libtorch C wrapper (overrides EMBER_TORCH_LIB)
    #[arg(long, global = true)]
    lib: Option<PathBuf>,

    /// Log every native call
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show available backends
    Info {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Exercise the native boundary and report each check
    Validate,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    let config = match cli.lib {
        Some(library) => RuntimeConfig { library },
        None => RuntimeConfig::from_env(),
    };
    tracing::debug!(library = %config.library.display(), "loading native runtime");
    if let Err(err) = runtime::init(&config) {
        eprintln!("error: {err}");
        eprintln!("hint: point --lib or {} at the libtorch C wrapper", runtime::LIBRARY_ENV);
        return ExitCode::FAILURE;
    }

    match cli.command {
        Commands::Info { json } => cmd_info(&config, json),
        Commands::Validate => cmd_validate(),
    }
}

fn mark(ok: bool) -> &'static str {
    if ok {
        "[x]"
    } else {
        "[ ]"
    }
}

fn cmd_info(config: &RuntimeConfig, json: bool) -> ExitCode {
    let cuda = Cuda::is_available();
    let mps = Mps::is_available();
    let best = Device::best_available();

    if json {
        let report = serde_json::json!({
            "library": config.library.display().to_string(),
            "cuda": {
                "available": cuda,
                "device_count": Cuda::device_count(),
                "cudnn": Cuda::cudnn_is_available(),
            },
            "mps": { "available": mps },
            "best_device": best.to_string(),
            "grad_enabled": grad::is_enabled(),
        });
        println!("{report:#}");
        return ExitCode::SUCCESS;
    }

    println!("ember v{}", env!("CARGO_PKG_VERSION"));
    println!("  library: {}", config.library.display());

    println!("\nCUDA");
    println!("  available: {}", mark(cuda));
    println!("  devices:   {}", Cuda::device_count());
    println!("  cuDNN:     {}", mark(Cuda::cudnn_is_available()));

    println!("\nMPS");
    println!("  available: {}", mark(mps));
    if mps {
        match Device::Mps.current_allocated_memory() {
            Ok(bytes) => println!("  allocated: {bytes} bytes"),
            Err(err) => println!("  allocated: unknown ({err})"),
        }
    }

    println!("\nBest device: {best}");
    ExitCode::SUCCESS
}

type Check = (&'static str, fn() -> Result<(), String>);

fn cmd_validate() -> ExitCode {
    let checks: [Check; 4] = [
        ("device index round-trip", check_device_round_trip),
        ("gradient mode persists", check_grad_mode),
        ("gradient mode restored after scope", check_scoped_restore),
        ("LSTM step returns three tensors", check_lstm_step),
    ];

    let mut failed = 0;
    for (name, check) in checks {
        match check() {
            Ok(()) => println!("✓ {name}"),
            Err(reason) => {
                failed += 1;
                println!("✗ {name}: {reason}");
            }
        }
    }

    if failed == 0 {
        println!("\nall {} checks passed", checks.len());
        ExitCode::SUCCESS
    } else {
        println!("\n{failed} of {} checks failed", checks.len());
        ExitCode::FAILURE
    }
}

fn check_device_round_trip() -> Result<(), String> {
    let mut devices = vec![Device::Cpu, Device::Mps];
    devices.extend((0..Cuda::device_count().max(1)).map(Device::Cuda));
    for device in devices {
        let back = Device::from_native_index(device.to_native_index());
        if back != device {
            return Err(format!("{device} decoded as {back}"));
        }
    }
    Ok(())
}

fn check_grad_mode() -> Result<(), String> {
    let original = grad::is_enabled();
    grad::set_enabled(true).map_err(|e| e.to_string())?;
    let prev = grad::set_enabled(true).map_err(|e| e.to_string())?;
    grad::set_enabled(original).map_err(|e| e.to_string())?;
    if prev {
        Ok(())
    } else {
        Err("second set_enabled(true) reported false".into())
    }
}

fn check_scoped_restore() -> Result<(), String> {
    let before = grad::is_enabled();
    let result = grad::with_disabled(|| {
        grad::set_enabled(true)?;
        Err::<(), _>(ember_core::EmberError::InvalidArgument("forced".into()))
    });
    if result.is_ok() {
        return Err("scope body error was swallowed".into());
    }
    if grad::is_enabled() != before {
        return Err(format!("mode is {} after scope, expected {before}", grad::is_enabled()));
    }
    Ok(())
}

fn check_lstm_step() -> Result<(), String> {
    let run = || -> ember_core::Result<Result<(), String>> {
        let lstm = Lstm::new(2, 4, RnnConfig::default(), Device::Cpu)?;
        let state = lstm.zero_state(5)?;
        let input = Tensor::randn(&[5, 2], Kind::Float, Device::Cpu)?;
        let step = lstm.step(&input, &state)?;
        if step.arity != 3 {
            return Ok(Err(format!("arity {}", step.arity)));
        }
        let RecurrentState::Dual { hidden, cell } = &step.state else {
            return Ok(Err(format!("got a {} state", step.state.tag())));
        };
        for (name, t) in [("hidden", hidden), ("cell", cell)] {
            let size = t.size()?;
            if size != [1, 5, 4] {
                return Ok(Err(format!("{name} has shape {size:?}, expected [1, 5, 4]")));
            }
        }
        Ok(Ok(()))
    };
    run().map_err(|e| e.to_string())?
}
