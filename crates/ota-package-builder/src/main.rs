use clap::{CommandFactory, Parser};
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use ota_package_builder::builder::{self, BuildOptions};
use ota_package_builder::tool::{SystemRunner, ToolPaths, Toolchain};
use ota_package_builder::{Error, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Generate an OTA package (ota.zip + ota.sh) from vela_<name>.bin|elf images.
///
/// One directory builds a full package; an old and a new directory build a
/// diff package. Each image is installed to /dev/<name> on the device.
#[derive(Debug, Parser)]
#[command(author, about)]
struct Args {
    /// <new bin dir> for a full package, or <old bin dir> <new bin dir> for a diff package
    bin_path: Vec<PathBuf>,
    /// Private key (pk8), relative to the tools directory
    #[arg(short, long, default_value = "keys/key.pk8")]
    key: PathBuf,
    /// Certificate (x509.pem), relative to the tools directory
    #[arg(short, long, default_value = "keys/key.x509.pem")]
    cert: PathBuf,
    /// Sign the package
    #[arg(long)]
    sign: bool,
    /// Output path
    #[arg(long, default_value = "ota.zip")]
    output: PathBuf,
    /// Overwrite an existing output without asking
    #[arg(short = 'y', long)]
    yes: bool,
    /// Ship partitions that only exist in the new directory
    #[arg(long)]
    newpartition: bool,
    /// Block size of the device-side dd
    #[arg(long, default_value_t = 32768)]
    bs: u32,
    /// Delta block size; 0 selects non in-place patching
    #[arg(long, default_value_t = 0)]
    blksz: u32,
    /// Print debug log
    #[arg(long)]
    debug: bool,
    /// Device log destination (/dev/log or a file) for the install script
    #[arg(long, default_value = "")]
    otalog: String,
    /// Version number recorded to prevent downgrade
    #[arg(long, default_value_t = 0)]
    version: u32,
    /// Speed conf: [section] with speed=<float> then bin=<vela_x.bin,...>
    #[arg(long)]
    speedconf: Option<PathBuf>,
    /// Device working directory for patch application
    #[arg(long, alias = "ota_tmp", default_value = "/data/ota_tmp")]
    ota_tmp: String,
    /// Script run on the device before the update
    #[arg(long, alias = "user_begin_script")]
    user_begin_script: Option<PathBuf>,
    /// Script run on the device after a successful update
    #[arg(long, alias = "user_end_script")]
    user_end_script: Option<PathBuf>,
    /// Progress reserved for the end script
    #[arg(long, alias = "user_end_script_progress", default_value_t = 0)]
    user_end_script_progress: u32,
    /// Files or directories added to the package
    #[arg(long, alias = "user_file", num_args = 1..)]
    user_file: Vec<PathBuf>,
    /// Restrict AVB upgrade verification to these images
    #[arg(long, alias = "upgrade_verify", num_args = 1..)]
    upgrade_verify: Vec<String>,
    /// Directory holding ddelta_generate and signapk.jar (default: next to this binary)
    #[arg(long)]
    tools_dir: Option<PathBuf>,
    /// avbtool path (default: <tools-dir>/../../../../external/avb/avb/avbtool)
    #[arg(long)]
    avbtool: Option<PathBuf>,
    /// Write a JSON build report
    #[arg(long)]
    report: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.debug);

    if !(1..=2).contains(&args.bin_path.len()) {
        let _ = Args::command().print_help();
        return ExitCode::from(2);
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn run(args: Args) -> Result<()> {
    if !builder::confirm_overwrite(&args.output, args.yes, &mut io::stdin().lock(), &mut io::stdout())? {
        info!("keeping existing {}", args.output.display());
        return Ok(());
    }

    let tools_dir = match args.tools_dir {
        Some(dir) => dir,
        None => default_tools_dir()?,
    };
    let runner = SystemRunner;
    let tools = Toolchain::new(&runner, ToolPaths::new(tools_dir, args.avbtool));

    let opts = BuildOptions {
        inputs: args.bin_path,
        output: args.output,
        sign: args.sign,
        key: args.key,
        cert: args.cert,
        include_new_partitions: args.newpartition,
        block_size: args.bs,
        delta_block_size: args.blksz,
        otalog: args.otalog,
        version: args.version,
        speed_conf: args.speedconf,
        ota_tmp: args.ota_tmp,
        user_begin_script: args.user_begin_script,
        user_end_script: args.user_end_script,
        user_end_script_progress: args.user_end_script_progress,
        user_files: args.user_file,
        upgrade_verify: args.upgrade_verify,
        report: args.report,
    };
    let outcome = builder::build(&opts, &tools)?;
    info!(
        "{} package {} ready ({} members)",
        outcome.kind.as_str(),
        opts.output.display(),
        outcome.members.len()
    );
    Ok(())
}

fn default_tools_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe()
        .map_err(|e| Error::config(format!("cannot locate the running executable: {e}")))?;
    exe.parent()
        .map(|p| p.to_path_buf())
        .ok_or_else(|| Error::config(format!("no parent directory for {}", exe.display())))
}
