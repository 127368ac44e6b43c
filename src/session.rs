//! Device session façade
//!
//! Owns the connection lifecycle to the instrument and which panel is the target of
//! panel reads and writes.
//!
//! ```text
//! Disconnected -> Connecting -> Connected(tool: none) <-> Connected(tool: A) <-> ...
//!      ^                                   |
//!      +----------- Disconnecting <--------+
//! ```
//!
//! Tool switches are only valid while connected. Panel accessors check that the
//! session is connected and that the requested panel is the active tool, so a
//! scenario that forgets to switch gets an error instead of talking to the wrong panel.
//!
//! The session is passed explicitly (`Arc<DeviceSession>`) to scenarios and script
//! bindings; nothing reaches it through globals.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::{DeviceConfig, SettleConfig};
use crate::console::ConsoleLog;
use crate::error::{HarnessError, HarnessResult};
use crate::panels::{OscilloscopePanel, PowerSupplyPanel, SignalGeneratorPanel, VoltmeterPanel};
use crate::settle::settle_delay;

/// Instrument tools a session can switch between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tool {
    /// Dual-rail supply (DAC1 positive, DAC2 negative)
    PowerSupply,
    /// Two-channel DC voltmeter
    Voltmeter,
    /// Two-channel arbitrary signal generator
    SignalGenerator,
    /// Two-channel oscilloscope
    Oscilloscope,
}

impl Tool {
    pub const ALL: [Tool; 4] = [
        Tool::PowerSupply,
        Tool::Voltmeter,
        Tool::SignalGenerator,
        Tool::Oscilloscope,
    ];

    /// Display name as shown in the application's tool menu.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PowerSupply => "Power Supply",
            Self::Voltmeter => "Voltmeter",
            Self::SignalGenerator => "Signal Generator",
            Self::Oscilloscope => "Oscilloscope",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Tool {
    type Err = HarnessError;

    /// Accepts the display name (case-insensitive) or the script global's name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        let alias = match wanted.as_str() {
            "power" => Some(Tool::PowerSupply),
            "dmm" => Some(Tool::Voltmeter),
            "siggen" => Some(Tool::SignalGenerator),
            "osc" => Some(Tool::Oscilloscope),
            _ => None,
        };
        alias
            .or_else(|| {
                Tool::ALL
                    .into_iter()
                    .find(|tool| tool.name().to_lowercase() == wanted)
            })
            .ok_or_else(|| HarnessError::UnknownTool(s.to_string()))
    }
}

/// Handle for a device registered with the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The application's automation surface for device management and panels.
///
/// Mirrors the host calls: add a device by URI, connect it, switch tools, and the
/// four panel objects.
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    /// Register a device URI; returns its id.
    async fn add_device(&self, uri: &str) -> Result<DeviceId>;

    /// Connect a registered device; `Ok(false)` if it is unreachable.
    async fn connect_device(&self, id: &DeviceId) -> Result<bool>;

    async fn disconnect_device(&self, id: &DeviceId) -> Result<()>;

    async fn remove_device(&self, id: &DeviceId) -> Result<()>;

    /// Activate a tool; `Ok(false)` if the tool is not available.
    async fn switch_tool(&self, tool: Tool) -> Result<bool>;

    fn power_supply(&self) -> Arc<dyn PowerSupplyPanel>;
    fn voltmeter(&self) -> Arc<dyn VoltmeterPanel>;
    fn signal_generator(&self) -> Arc<dyn SignalGeneratorPanel>;
    fn oscilloscope(&self) -> Arc<dyn OscilloscopePanel>;
}

/// Connection state of a [`DeviceSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No device; the initial and final state
    Disconnected,
    /// A connect attempt is in progress
    Connecting,
    /// Connected to `uri`; panel calls go to `active_tool`
    Connected {
        /// Backend handle of the connected device
        device: DeviceId,
        /// URI the connection was made on (device or emulator)
        uri: String,
        /// Tool selected by the last successful switch
        active_tool: Option<Tool>,
    },
    /// Releasing the device
    Disconnecting,
}

/// Connection lifecycle and tool switching over a [`DeviceBackend`].
pub struct DeviceSession {
    backend: Arc<dyn DeviceBackend>,
    device: DeviceConfig,
    settle: SettleConfig,
    console: ConsoleLog,
    state: RwLock<SessionState>,
}

impl DeviceSession {
    /// A disconnected session over `backend`.
    pub fn new(
        backend: Arc<dyn DeviceBackend>,
        device: DeviceConfig,
        settle: SettleConfig,
        console: ConsoleLog,
    ) -> Self {
        Self {
            backend,
            device,
            settle,
            console,
            state: RwLock::new(SessionState::Disconnected),
        }
    }

    pub fn settle(&self) -> &SettleConfig {
        &self.settle
    }

    pub fn console(&self) -> &ConsoleLog {
        &self.console
    }

    pub async fn state(&self) -> SessionState {
        self.state.read().await.clone()
    }

    pub async fn is_connected(&self) -> bool {
        matches!(*self.state.read().await, SessionState::Connected { .. })
    }

    pub async fn active_tool(&self) -> Option<Tool> {
        match &*self.state.read().await {
            SessionState::Connected { active_tool, .. } => *active_tool,
            _ => None,
        }
    }

    /// URI of the connected device.
    pub async fn uri(&self) -> Option<String> {
        match &*self.state.read().await {
            SessionState::Connected { uri, .. } => Some(uri.clone()),
            _ => None,
        }
    }

    /// Connect to `uri` (or the configured device), falling back to the emulator.
    ///
    /// Returns `false` when neither answers; the session is then `Disconnected`.
    /// Already connected sessions return `true` without reconnecting.
    pub async fn connect_to_device(&self, uri: Option<&str>) -> bool {
        {
            let mut state = self.state.write().await;
            match *state {
                SessionState::Connected { .. } => return true,
                SessionState::Disconnected => *state = SessionState::Connecting,
                SessionState::Connecting | SessionState::Disconnecting => {
                    tracing::warn!(state = ?*state, "connect requested during a transition");
                    return false;
                }
            }
        }

        let primary = uri.unwrap_or(&self.device.uri).to_string();
        self.console
            .print(format!("Connecting to device: {}", primary));
        if let Some(device) = self.try_connect(&primary).await {
            self.console.print("✓ Successfully connected to device\n");
            return self.finish_connect(device, primary).await;
        }

        let emulator = self.device.emulator_uri.clone();
        if emulator != primary {
            self.console.print("Device not found, trying emulator...");
            if let Some(device) = self.try_connect(&emulator).await {
                self.console.print("✓ Successfully connected to emulator\n");
                return self.finish_connect(device, emulator).await;
            }
        }

        self.console
            .print("✗ Failed to connect to both device and emulator");
        *self.state.write().await = SessionState::Disconnected;
        tracing::error!(uri = %primary, "no device reachable");
        false
    }

    async fn try_connect(&self, uri: &str) -> Option<DeviceId> {
        let device = match self.backend.add_device(uri).await {
            Ok(device) => device,
            Err(e) => {
                tracing::debug!(uri, error = %e, "add_device failed");
                return None;
            }
        };

        match self.backend.connect_device(&device).await {
            Ok(true) => Some(device),
            outcome => {
                if let Err(e) = outcome {
                    tracing::debug!(uri, error = %e, "connect_device failed");
                }
                // drop the half-added device before trying anything else
                if let Err(e) = self.backend.remove_device(&device).await {
                    tracing::warn!(%device, error = %e, "remove_device after failed connect");
                }
                None
            }
        }
    }

    async fn finish_connect(&self, device: DeviceId, uri: String) -> bool {
        tracing::info!(%device, uri = %uri, "connected");
        *self.state.write().await = SessionState::Connected {
            device,
            uri,
            active_tool: None,
        };
        settle_delay(self.settle.connect()).await;
        true
    }

    /// Switch to a tool by its display name. Prints and returns `false` on failure.
    pub async fn switch_to_tool(&self, name: &str) -> bool {
        let result = match name.parse::<Tool>() {
            Ok(tool) => self.switch_to(tool).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                self.console
                    .print(format!("  ERROR: Failed to switch tool: {}", e));
                false
            }
        }
    }

    /// Typed tool switch.
    pub async fn switch_to(&self, tool: Tool) -> HarnessResult<()> {
        if !self.is_connected().await {
            return Err(HarnessError::NotConnected);
        }

        match self.backend.switch_tool(tool).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(HarnessError::Device(format!("Failed to switch to {}", tool)));
            }
            Err(e) => return Err(HarnessError::Device(format!("{:#}", e))),
        }

        {
            let mut state = self.state.write().await;
            match &mut *state {
                SessionState::Connected { active_tool, .. } => *active_tool = Some(tool),
                _ => return Err(HarnessError::NotConnected),
            }
        }

        tracing::debug!(%tool, "switched tool");
        self.console.print(format!("  Switched to {}", tool));
        settle_delay(self.settle.tool_switch()).await;
        Ok(())
    }

    /// Release the session. Safe to call when not connected.
    pub async fn disconnect_from_device(&self) {
        let device = {
            let mut state = self.state.write().await;
            match std::mem::replace(&mut *state, SessionState::Disconnecting) {
                SessionState::Connected { device, .. } => device,
                previous => {
                    *state = previous;
                    return;
                }
            }
        };

        let result = async {
            self.backend.disconnect_device(&device).await?;
            self.backend.remove_device(&device).await
        }
        .await;

        *self.state.write().await = SessionState::Disconnected;
        match result {
            Ok(()) => self.console.print("✓ Disconnected from device\n"),
            Err(e) => self
                .console
                .print(format!("Warning: Error disconnecting: {:#}", e)),
        }
        tracing::info!(%device, "disconnected");
    }

    async fn require(&self, tool: Tool) -> HarnessResult<()> {
        match &*self.state.read().await {
            SessionState::Connected { active_tool, .. } if *active_tool == Some(tool) => Ok(()),
            SessionState::Connected { active_tool, .. } => Err(HarnessError::ToolNotActive {
                requested: tool,
                active: *active_tool,
            }),
            _ => Err(HarnessError::NotConnected),
        }
    }

    /// The power supply panel; requires it to be the active tool.
    pub async fn power(&self) -> HarnessResult<Arc<dyn PowerSupplyPanel>> {
        self.require(Tool::PowerSupply).await?;
        Ok(self.backend.power_supply())
    }

    /// The voltmeter panel; requires it to be the active tool.
    pub async fn voltmeter(&self) -> HarnessResult<Arc<dyn VoltmeterPanel>> {
        self.require(Tool::Voltmeter).await?;
        Ok(self.backend.voltmeter())
    }

    /// The signal generator panel; requires it to be the active tool.
    pub async fn signal_generator(&self) -> HarnessResult<Arc<dyn SignalGeneratorPanel>> {
        self.require(Tool::SignalGenerator).await?;
        Ok(self.backend.signal_generator())
    }

    /// The oscilloscope panel; requires it to be the active tool.
    pub async fn oscilloscope(&self) -> HarnessResult<Arc<dyn OscilloscopePanel>> {
        self.require(Tool::Oscilloscope).await?;
        Ok(self.backend.oscilloscope())
    }
}
