//! Event system for UI decoupling.
//!
//! Allows CLI or other front ends to subscribe to session and transfer
//! events without tight coupling to the core logic.

use std::fmt;

use crate::protocol::{ChipsetVariant, Opcode};

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Upload session phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    /// Transport handed over, nothing sent yet.
    Connecting,
    /// Probing chipset variants.
    Handshake,
    /// Handshake complete, idle.
    Ready,
    /// Reading the region table.
    RegionTable,
    /// Memory transfer in progress.
    Transfer,
    /// Sending postamble and releasing the device.
    Closing,
    /// Transfer finished.
    Complete,
    /// Error state.
    Error,
}

impl fmt::Display for UploadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadPhase::Connecting => write!(f, "Connecting"),
            UploadPhase::Handshake => write!(f, "Handshake"),
            UploadPhase::Ready => write!(f, "Ready"),
            UploadPhase::RegionTable => write!(f, "Region Table"),
            UploadPhase::Transfer => write!(f, "Transfer"),
            UploadPhase::Closing => write!(f, "Closing"),
            UploadPhase::Complete => write!(f, "Complete"),
            UploadPhase::Error => write!(f, "Error"),
        }
    }
}

/// Events emitted by a session and the dump engine.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// Transport attached.
    DeviceConnected { description: String },
    /// Transport reported a disconnect.
    DeviceDisconnected,
    /// Phase changed.
    PhaseChanged { from: UploadPhase, to: UploadPhase },
    /// Handshake succeeded under this variant.
    VariantDetected { variant: ChipsetVariant },
    /// Region table loaded (possibly partial).
    RegionTable {
        device_name: String,
        regions: usize,
    },
    /// Progress update for current operation.
    Progress {
        operation: String,
        current: u64,
        total: u64,
    },
    /// A request is being re-issued.
    Retry {
        command: Opcode,
        attempt: u32,
        reason: String,
    },
    /// Frame sent/received.
    Packet {
        direction: PacketDirection,
        opcode: Opcode,
        length: usize,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Requested transfer completed.
    Complete,
}

/// Frame direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Device
    Rx, // Device -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving upload events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait UploadObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &UploadEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl UploadObserver for NullObserver {
    fn on_event(&self, _event: &UploadEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl UploadObserver for TracingObserver {
    fn on_event(&self, event: &UploadEvent) {
        match event {
            UploadEvent::DeviceConnected { description } => {
                tracing::info!(device = %description, "Device connected");
            }
            UploadEvent::DeviceDisconnected => {
                tracing::warn!("Device disconnected");
            }
            UploadEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            UploadEvent::VariantDetected { variant } => {
                tracing::info!(variant = %variant, "Chipset variant detected");
            }
            UploadEvent::RegionTable {
                device_name,
                regions,
            } => {
                tracing::info!(device = %device_name, regions, "Region table loaded");
            }
            UploadEvent::Progress {
                operation,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(operation = %operation, progress = %format!("{}%", pct), "Progress");
            }
            UploadEvent::Retry {
                command,
                attempt,
                reason,
            } => {
                tracing::warn!(command = %command, attempt, "Retrying: {}", reason);
            }
            UploadEvent::Packet {
                direction,
                opcode,
                length,
            } => {
                tracing::trace!(dir = %direction, opcode = %opcode, len = length, "Frame");
            }
            UploadEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            UploadEvent::Complete => {
                tracing::info!("Transfer complete");
            }
        }
    }
}

/// Observer that records every event; handy in tests and for replaying a session log.
#[derive(Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<UploadEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UploadEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl UploadObserver for RecordingObserver {
    fn on_event(&self, event: &UploadEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}
