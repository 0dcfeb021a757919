//! Capability negotiation and system resolution.
//!
//! Intersects what the application asks for with what the runtime offers,
//! creates the instance, attaches the debug-message channel, and resolves
//! the device the session will run on.

use std::sync::mpsc::{self, Receiver, TryRecvError};

use anyhow::{bail, Context};
use tracing::{debug, error, info, trace, warn};

use super::error::RuntimeError;
use super::runtime::{GraphicsBinding, Handle, HandleScope, XrRuntime};
use super::types::{DebugMessage, DebugSeverity, FormFactor, InstanceProperties, SystemDescriptor};
use crate::config::XrConfig;

/// Extension carrying the runtime's diagnostic messages.
pub const DEBUG_UTILS_EXTENSION: &str = "XR_EXT_debug_utils";

/// Receiving end of the runtime's debug messenger.
pub struct DebugChannel {
    receiver: Receiver<DebugMessage>,
    delivered: u64,
}

impl DebugChannel {
    pub fn new(receiver: Receiver<DebugMessage>) -> Self {
        Self {
            receiver,
            delivered: 0,
        }
    }

    /// Re-emit every queued message through `tracing` at the level that
    /// matches its severity. Returns how many were drained.
    pub fn drain(&mut self) -> usize {
        let mut count = 0;
        loop {
            match self.receiver.try_recv() {
                Ok(msg) => {
                    emit(&msg);
                    count += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        self.delivered += count as u64;
        count
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }
}

fn emit(msg: &DebugMessage) {
    match msg.severity {
        DebugSeverity::Verbose => trace!(
            "VR: runtime [{}] {}: {}",
            msg.message_id,
            msg.function_name,
            msg.message
        ),
        DebugSeverity::Info => debug!(
            "VR: runtime [{}] {}: {}",
            msg.message_id,
            msg.function_name,
            msg.message
        ),
        DebugSeverity::Warning => warn!(
            "VR: runtime [{}] {}: {}",
            msg.message_id,
            msg.function_name,
            msg.message
        ),
        DebugSeverity::Error => error!(
            "VR: runtime [{}] {}: {}",
            msg.message_id,
            msg.function_name,
            msg.message
        ),
    }
}

/// Outcome of instance creation.
pub struct NegotiatedInstance {
    pub properties: InstanceProperties,
    pub enabled_extensions: Vec<String>,
    pub enabled_layers: Vec<String>,
    pub debug: DebugChannel,
}

/// Enumerate layers and extensions, enable what is available, and create
/// the instance with its debug messenger.
///
/// The graphics binding's extension and the debug extension are required;
/// everything else in `config` is optional and only logged when missing.
pub fn negotiate<R: XrRuntime + ?Sized>(
    runtime: &mut R,
    scope: &mut HandleScope,
    config: &XrConfig,
    binding: &GraphicsBinding,
) -> anyhow::Result<NegotiatedInstance> {
    info!("VR: negotiating runtime capabilities...");

    let available_layers = match runtime.enumerate_api_layers() {
        Ok(layers) => layers,
        Err(e) => {
            warn!("VR: failed to enumerate API layers: {}", e);
            Vec::new()
        }
    };
    debug!("VR: API layers available: {:?}", available_layers);
    let mut enabled_layers = Vec::new();
    for layer in &config.api_layers {
        if available_layers.contains(layer) {
            enabled_layers.push(layer.clone());
        } else {
            warn!("VR: API layer {} not available, continuing without it", layer);
        }
    }

    let available = runtime
        .enumerate_extensions()
        .context("VR: failed to enumerate extensions")?;
    info!("VR: extensions available: {:?}", available);

    let required = [binding.required_extension(), DEBUG_UTILS_EXTENSION];
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|ext| !available.iter().any(|a| a == ext))
        .collect();
    if !missing.is_empty() {
        bail!("VR: required extensions not supported by runtime: {}", missing.join(", "));
    }

    let mut enabled_extensions: Vec<String> = required.iter().map(|s| s.to_string()).collect();
    for ext in &config.optional_extensions {
        if enabled_extensions.contains(ext) {
            continue;
        }
        if available.contains(ext) {
            enabled_extensions.push(ext.clone());
        } else {
            warn!("VR: optional extension {} not available, continuing without it", ext);
        }
    }

    let properties = runtime
        .create_instance(&config.application_info(), &enabled_extensions, &enabled_layers)
        .context("VR: failed to create instance")?;
    scope.track(Handle::Instance);
    info!(
        "VR: runtime: {} v{}",
        properties.runtime_name, properties.runtime_version
    );

    let (sender, receiver) = mpsc::channel();
    let messenger = runtime
        .create_debug_messenger(sender)
        .context("VR: failed to create debug messenger")?;
    scope.track(Handle::Messenger(messenger));

    info!("VR: enabled extensions: {:?}", enabled_extensions);
    Ok(NegotiatedInstance {
        properties,
        enabled_extensions,
        enabled_layers,
        debug: DebugChannel::new(receiver),
    })
}

/// Resolve the device for `form_factor`. There is no fallback.
pub fn resolve_system<R: XrRuntime + ?Sized>(
    runtime: &mut R,
    form_factor: FormFactor,
) -> anyhow::Result<SystemDescriptor> {
    let system = match runtime.system(form_factor) {
        Ok(system) => system,
        Err(RuntimeError::FormFactorUnavailable) => {
            bail!("VR: no {} device connected", form_factor.as_str())
        }
        Err(e) => return Err(e).context("VR: system discovery failed"),
    };
    info!(
        "VR: HMD discovered: {} (vendor {}), max {}x{}, layers {}, tracking: orient={} pos={}",
        system.system_name,
        system.vendor_id,
        system.max_swapchain_width,
        system.max_swapchain_height,
        system.max_layer_count,
        system.orientation_tracking,
        system.position_tracking,
    );
    Ok(system)
}
