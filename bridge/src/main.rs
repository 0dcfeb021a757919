//! xr-bridge - HMD session bridge
//!
//! Probes an OpenXR-style runtime or drives the full frame loop headless.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use xr_bridge::config::XrConfig;
use xr_bridge::host::{self, HostConfig};
use xr_bridge::xr::{
    GraphicsBinding, HeadlessRenderer, RuntimeSummary, SimConfig, SimRuntime, XrBridge, XrRig,
    XrRuntime,
};

#[derive(Parser, Debug)]
#[command(name = "xr-bridge", about = "HMD session bridge", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Runtime to connect to
    #[arg(long, value_enum, default_value_t = RuntimeKind::Sim, global = true)]
    runtime: RuntimeKind,

    /// Reference space: local, stage, or view
    #[arg(long, global = true)]
    reference_space: Option<String>,

    /// API layer to request (repeatable)
    #[arg(long = "api-layer", global = true)]
    api_layers: Vec<String>,

    /// Extension to enable when available (repeatable)
    #[arg(long = "optional-extension", global = true)]
    optional_extensions: Vec<String>,

    /// Tracing filter (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_filter: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Negotiate an instance, resolve the HMD and print what was found
    Probe,
    /// Run the frame loop with the headless renderer
    Run {
        /// Exit after N frames
        #[arg(long)]
        frames: Option<u64>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum RuntimeKind {
    /// In-process simulated runtime
    Sim,
    /// System OpenXR loader (requires the `vr` feature)
    Openxr,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.log_filter.as_deref() {
        Some(f) => tracing_subscriber::EnvFilter::try_new(f)
            .with_context(|| format!("invalid log filter: {f}"))?,
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "xr_bridge=info".into()),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("xr-bridge v{} starting", env!("CARGO_PKG_VERSION"));
    info!("runtime: {:?}", cli.runtime);

    let config = build_config(&cli)?;

    match cli.runtime {
        RuntimeKind::Sim => execute(SimRuntime::new(SimConfig::default()), config, &cli.command),
        RuntimeKind::Openxr => run_openxr(config, &cli.command),
    }
}

fn build_config(cli: &Cli) -> anyhow::Result<XrConfig> {
    let mut config = XrConfig::default();
    if let Some(ref s) = cli.reference_space {
        config.reference_space = match XrConfig::parse_reference_space(s) {
            Some(space) => space,
            None => bail!("unknown reference space: {s}. Use: local, stage, or view"),
        };
    }
    config.api_layers.extend(cli.api_layers.iter().cloned());
    config
        .optional_extensions
        .extend(cli.optional_extensions.iter().cloned());
    Ok(config)
}

#[cfg(feature = "vr")]
fn run_openxr(config: XrConfig, command: &Command) -> anyhow::Result<()> {
    // Without a host-provided GL context only runtimes exposing
    // XR_MND_headless can create a session.
    let runtime = xr_bridge::xr::OpenXrRuntime::load()?;
    execute(runtime, config, command)
}

#[cfg(not(feature = "vr"))]
fn run_openxr(_config: XrConfig, _command: &Command) -> anyhow::Result<()> {
    bail!("built without OpenXR support; rebuild with `--features vr`")
}

fn execute<R: XrRuntime>(runtime: R, config: XrConfig, command: &Command) -> anyhow::Result<()> {
    let binding = GraphicsBinding::Headless;
    let mut bridge = XrBridge::new(runtime, config);

    match command {
        Command::Probe => {
            let summary = bridge.probe(&binding)?;
            print_summary(&summary);
            Ok(())
        }
        Command::Run { frames } => {
            let host_config = HostConfig {
                frames: *frames,
                ..HostConfig::default()
            };
            let report = host::run(
                &mut bridge,
                &binding,
                &mut HeadlessRenderer::default(),
                &mut XrRig::new(),
                &host_config,
            )?;
            info!(
                "finished: {} frame(s), {} rendered{}",
                report.frames,
                report.rendered,
                report
                    .exit
                    .map(|r| format!(", session {}", r.as_str()))
                    .unwrap_or_default()
            );
            Ok(())
        }
    }
}

fn print_summary(summary: &RuntimeSummary) {
    let system = &summary.system;
    println!(
        "runtime:    {} {}",
        summary.instance.runtime_name, summary.instance.runtime_version
    );
    println!("system:     {} (vendor {})", system.system_name, system.vendor_id);
    println!("form:       {}", system.form_factor.as_str());
    println!(
        "swapchain:  max {}x{}, {} layer(s)",
        system.max_swapchain_width, system.max_swapchain_height, system.max_layer_count
    );
    println!(
        "tracking:   orientation={} position={}",
        system.orientation_tracking, system.position_tracking
    );
    println!("extensions: {}", summary.enabled_extensions.join(", "));
    if !summary.enabled_layers.is_empty() {
        println!("layers:     {}", summary.enabled_layers.join(", "));
    }
}
