use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{ArgAction, Parser};
use tracing::info;
use tracing_subscriber::EnvFilter;

use iso_remaster::artifact::{CopyStager, SquashfsOptions, SquashfsPatcher, XorrisoRepackager};
use iso_remaster::error::{RemasterError, EXIT_FAILURE};
use iso_remaster::mount::{LoopMounter, Mounter};
use iso_remaster::run::{self, RunSettings};
use iso_remaster::signal::{CancelToken, SignalGuard};
use iso_remaster::{config, preflight, RemasterOptions, Toolchain};

/// Remaster a bootable ISO: mount, copy, patch the live root, repack.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Source ISO image
    #[arg(short, long, value_name = "ISO")]
    input: String,

    /// Output image (must end in .img) [default: <input-stem>-custom.img]
    #[arg(short, long, value_name = "IMG")]
    output: Option<String>,

    /// Working directory, kept after the run [default: temporary, removed]
    #[arg(short, long, value_name = "DIR", env = "ISO_REMASTER_WORKDIR")]
    workdir: Option<String>,

    /// Shell script to run inside the unpacked root filesystem
    #[arg(short, long, value_name = "SCRIPT", env = "ISO_REMASTER_PATCH_SCRIPT")]
    patch_script: Option<PathBuf>,

    /// squashfs compressor for the repacked root filesystem
    #[arg(long, value_name = "ALGO", default_value = "xz")]
    compression: String,

    /// squashfs block size
    #[arg(long, value_name = "SIZE", default_value = "1M")]
    block_size: String,

    /// Volume label for the output image [default: keep the input's]
    #[arg(long, value_name = "LABEL")]
    volume_label: Option<String>,

    /// Skip checking that the host tools are installed
    #[arg(long)]
    skip_tool_check: bool,

    /// Do not write the .sha256 and .json files next to the output
    #[arg(long)]
    no_manifest: bool,

    /// Increase logging verbosity
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity
    #[arg(short, long, action = ArgAction::Count)]
    quiet: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.quiet);

    match run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            let code = e
                .downcast_ref::<RemasterError>()
                .map(RemasterError::exit_code)
                .unwrap_or(EXIT_FAILURE);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn run_cli(cli: Cli) -> Result<()> {
    // Nothing is resolved or created before the privilege check.
    preflight::require_root()?;

    let config = config::resolve(&cli.input, cli.output.as_deref(), cli.workdir.as_deref())?;

    if !cli.skip_tool_check {
        preflight::check_host_tools()?;
    }

    let options = RemasterOptions {
        patch_script: cli
            .patch_script
            .as_deref()
            .map(resolve_script)
            .transpose()?,
        squashfs: SquashfsOptions {
            compression: cli.compression,
            block_size: cli.block_size,
            ..SquashfsOptions::default()
        },
        volume_label: cli.volume_label,
    };

    let guard = SignalGuard::arm(CancelToken::new())?;
    let tools = toolchain(&options);

    let report = run::remaster(
        &config,
        &tools,
        guard.token(),
        RunSettings {
            write_manifest: !cli.no_manifest,
        },
    )?;

    info!(
        "Remastered {} -> {} ({} stages)",
        config.input_image.display(),
        config.output_image.display(),
        report.stages.len()
    );
    Ok(())
}

fn toolchain(options: &RemasterOptions) -> Toolchain {
    let mounter: Arc<dyn Mounter> = Arc::new(LoopMounter);
    Toolchain {
        mounter: Arc::clone(&mounter),
        stager: Box::new(CopyStager),
        patcher: Box::new(SquashfsPatcher::new(
            options.squashfs.clone(),
            options.patch_script.clone(),
            mounter,
        )),
        repackager: Box::new(XorrisoRepackager::new(options.volume_label.clone())),
    }
}

fn resolve_script(path: &Path) -> Result<PathBuf> {
    let resolved = path
        .canonicalize()
        .map_err(|e| RemasterError::InvalidInput {
            path: path.to_path_buf(),
            reason: format!("patch script: {e}"),
        })?;
    if !resolved.is_file() {
        return Err(RemasterError::InvalidInput {
            path: resolved,
            reason: "patch script is not a regular file".into(),
        }
        .into());
    }
    Ok(resolved)
}

fn setup_logging(verbose: u8, quiet: u8) {
    let log_level = match (verbose, quiet) {
        (0, 0) => "info",
        (1, 0) => "debug",
        (v, 0) if v > 1 => "trace",
        (0, 1) => "warn",
        (0, 2) => "error",
        (0, q) if q > 2 => "off",
        _ => "info",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
