//! Transport-agnostic command façade.
//!
//! [`CommandChannel`] owns one [`Transport`] and the [`ConnectionGuard`] that
//! serialises access to it. Every call that touches the wire takes the guard,
//! runs one exchange and releases it again; the outcome is always reported as a
//! [`CommandResult`], never as an `Err`, so callers can inspect device error
//! codes embedded in the reply text.
//!
//! # Example
//!
//! ```no_run
//! use pmac_remote::channel::CommandChannel;
//! use pmac_remote::config::{ConnectionConfig, TransportKind};
//!
//! # async fn demo() -> pmac_remote::error::PmacResult<()> {
//! let config = ConnectionConfig::new("172.23.243.156", Some(1025), TransportKind::Ethernet);
//! let channel = CommandChannel::new(config);
//! channel.connect().await?;
//!
//! let result = channel.send_command("i10").await;
//! if result.success {
//!     println!("I10 = {}", result.response.trim_end_matches(['\r', '\x06']));
//! }
//! channel.disconnect().await;
//! # Ok(())
//! # }
//! ```

use crate::addressing;
use crate::config::ConnectionConfig;
use crate::error::{PmacError, PmacResult};
use crate::error_codes;
use crate::guard::{ConnectionGuard, GuardPermit};
use crate::model::{self, ControllerFamily, ModelCache};
use crate::transport::{transport_for, Transport};
use futures::stream::{self, BoxStream};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Limit-switch disable bit in `Ixx24`.
const LIMITS_DISABLED_BIT: u32 = 0x20000;

/// Outcome of one command.
///
/// `success == false` means the exchange itself failed; `response` then holds
/// the error message. Device `ERRnnn` replies are successful exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Reply text, or the failure message.
    pub response: String,
    /// `true` if the controller answered.
    pub success: bool,
}

impl CommandResult {
    fn answered(response: String) -> Self {
        Self {
            response,
            success: true,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            response: message,
            success: false,
        }
    }
}

/// One line of a [`CommandChannel::send_series`] batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesLine {
    /// `false` if the exchange failed or the reply carries an `ERRnnn` code.
    pub success: bool,
    /// Caller-supplied line number.
    pub line_number: usize,
    /// Command as sent.
    pub command: String,
    /// Reply text, or the failure message.
    pub response: String,
}

/// Lazily evaluated batch results.
pub type SeriesStream<'a> = BoxStream<'a, SeriesLine>;

/// A motion helper's command together with its outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotionResult {
    /// Command that was sent, empty if nothing was sent.
    pub command: String,
    /// Reply text, or the failure message.
    pub response: String,
    /// `true` if the controller answered.
    pub success: bool,
}

impl MotionResult {
    fn from_command(command: String, result: CommandResult) -> Self {
        Self {
            command,
            response: result.response,
            success: result.success,
        }
    }

    fn nothing_sent() -> Self {
        Self {
            command: String::new(),
            response: String::new(),
            success: false,
        }
    }
}

/// Jog direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JogDirection {
    /// Towards positive counts.
    Positive,
    /// Towards negative counts.
    Negative,
}

impl FromStr for JogDirection {
    type Err = PmacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pos" => Ok(JogDirection::Positive),
            "neg" => Ok(JogDirection::Negative),
            other => Err(PmacError::InvalidDirection(other.to_string())),
        }
    }
}

struct SeriesState<'a, I> {
    channel: &'a CommandChannel,
    commands: I,
    cancel: Option<&'a AtomicBool>,
    permit: Option<GuardPermit>,
}

/// Synchronised command/response access to one controller.
pub struct CommandChannel {
    config: ConnectionConfig,
    family: ControllerFamily,
    guard: ConnectionGuard,
    link: Mutex<Box<dyn Transport>>,
    cache: Mutex<ModelCache>,
    open: AtomicBool,
}

impl fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandChannel")
            .field("hostname", &self.config.hostname)
            .field("transport", &self.config.transport)
            .field("open", &self.is_open())
            .finish()
    }
}

impl CommandChannel {
    /// Create a closed channel using the transport named in `config`.
    pub fn new(config: ConnectionConfig) -> Self {
        let transport = transport_for(config.transport);
        Self::with_transport(config, transport)
    }

    /// Create a channel over a caller-supplied transport.
    pub fn with_transport(config: ConnectionConfig, transport: Box<dyn Transport>) -> Self {
        let open = transport.is_open();
        Self {
            family: transport.family(),
            config,
            guard: ConnectionGuard::new(),
            link: Mutex::new(transport),
            cache: Mutex::new(ModelCache::default()),
            open: AtomicBool::new(open),
        }
    }

    /// Connection settings.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Command dialect of the active transport.
    pub fn family(&self) -> ControllerFamily {
        self.family
    }

    /// The guard shared by every caller of this connection.
    ///
    /// Hold a permit from it to run several commands back to back through
    /// [`send_command_with`](Self::send_command_with) with `wait_for_guard = false`.
    pub fn guard(&self) -> &ConnectionGuard {
        &self.guard
    }

    /// `true` between a successful `connect` and `disconnect`.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Open the link and run the transport handshake.
    pub async fn connect(&self) -> PmacResult<()> {
        let _permit = self.guard.acquire().await;
        let mut link = self.link.lock().await;
        link.connect(&self.config).await?;
        self.cache.lock().await.reset();
        self.open.store(true, Ordering::Release);
        info!(
            host = %self.config.hostname,
            transport = %self.config.transport,
            "connection open"
        );
        Ok(())
    }

    /// Close the link. Safe on a channel that was never connected.
    pub async fn disconnect(&self) {
        let _permit = self.guard.acquire().await;
        self.open.store(false, Ordering::Release);
        self.link.lock().await.disconnect().await;
    }

    /// Send one command, waiting for the guard.
    pub async fn send_command(&self, command: &str) -> CommandResult {
        self.send_command_with(command, true).await
    }

    /// Send one command.
    ///
    /// Pass `wait_for_guard = false` only while already holding a permit from
    /// [`guard`](Self::guard).
    pub async fn send_command_with(&self, command: &str, wait_for_guard: bool) -> CommandResult {
        let _permit = if wait_for_guard {
            Some(self.guard.acquire().await)
        } else {
            None
        };
        self.exchange(command).await
    }

    async fn exchange(&self, command: &str) -> CommandResult {
        let double_timeout = command.to_uppercase().contains("SAVE");
        let mut link = self.link.lock().await;
        match link.exchange(command, double_timeout).await {
            Ok(response) => CommandResult::answered(response),
            Err(PmacError::NullTerminator) if double_timeout => {
                debug!(command, "ignoring NULL terminator while saving");
                CommandResult::answered(String::new())
            }
            Err(err) => {
                if !err.is_transport_fault() {
                    error!(command, error = %err, "exchange failed");
                }
                CommandResult::failed(format!("I/O error during comm with PMAC: {err}"))
            }
        }
    }

    /// Replay numbered commands under a single guard acquisition.
    ///
    /// Results are produced as the stream is polled. The guard is released when
    /// the commands run out, when `cancel` is observed set before a line, or
    /// when the stream is dropped part way through.
    pub fn send_series<'a, I>(
        &'a self,
        commands: I,
        cancel: Option<&'a AtomicBool>,
    ) -> SeriesStream<'a>
    where
        I: IntoIterator<Item = (usize, String)>,
        I::IntoIter: Send + 'a,
    {
        let state = SeriesState {
            channel: self,
            commands: commands.into_iter(),
            cancel,
            permit: None,
        };
        Box::pin(stream::unfold(state, |mut state| async move {
            if state.cancel.is_some_and(|flag| flag.load(Ordering::Acquire)) {
                debug!("series cancelled");
                return None;
            }
            let (line_number, command) = state.commands.next()?;
            if state.permit.is_none() {
                state.permit = Some(state.channel.guard.acquire().await);
            }
            let result = state.channel.exchange(&command).await;
            let line = SeriesLine {
                success: result.success && error_codes::find_error_code(&result.response).is_none(),
                line_number,
                command,
                response: result.response,
            };
            if !line.success {
                warn!(
                    line = line.line_number,
                    response = %line.response.escape_debug(),
                    "series line failed"
                );
            }
            Some((line, state))
        }))
    }

    /// Identity code reported by `cid`, cached after the first query.
    pub async fn model_code(&self) -> PmacResult<u32> {
        if let Some(code) = self.cache.lock().await.code {
            return Ok(code);
        }
        let result = self.send_command("cid").await;
        if !result.success {
            return Err(PmacError::CommandFailed(format!(
                "Error talking to PMAC: {}",
                result.response
            )));
        }
        let code = model::parse_model_code(self.family, &result.response)?;
        self.cache.lock().await.code = Some(code);
        Ok(code)
    }

    /// Long model name; unknown codes are an error.
    pub async fn model_name(&self) -> PmacResult<&'static str> {
        if let Some(name) = self.cache.lock().await.name {
            return Ok(name);
        }
        let code = self.model_code().await?;
        let name = model::model_name(self.family, code)?;
        self.cache.lock().await.name = Some(name);
        Ok(name)
    }

    /// Short model name, with a generic fallback for unknown codes.
    pub async fn short_model_name(&self) -> PmacResult<&'static str> {
        if let Some(name) = self.cache.lock().await.short_name {
            return Ok(name);
        }
        let code = self.model_code().await?;
        let name = model::short_model_name(self.family, code);
        self.cache.lock().await.short_name = Some(name);
        Ok(name)
    }

    /// `true` for Geobrick and Clipper controllers.
    pub async fn is_geobrick(&self) -> PmacResult<bool> {
        if self.family == ControllerFamily::PowerPmac {
            return Ok(false);
        }
        Ok(model::is_geobrick(self.model_code().await?))
    }

    /// Forget the cached model and axis count.
    pub async fn reset_model_cache(&self) {
        self.cache.lock().await.reset();
    }

    /// Total number of axes, cached after the first query.
    pub async fn number_of_axes(&self) -> PmacResult<u32> {
        if let Some(n) = self.config.num_axes {
            return Ok(n);
        }
        if let Some(n) = self.cache.lock().await.num_axes {
            return Ok(n);
        }
        let n = match self.family {
            ControllerFamily::PowerPmac => self.power_pmac_axes().await?,
            ControllerFamily::Turbo => {
                let macro_axes = self.macro_station_axes().await?;
                if self.is_geobrick().await? {
                    addressing::ONBOARD_AXES as u32 + macro_axes
                } else {
                    macro_axes
                }
            }
        };
        debug!(axes = n, "counted axes");
        self.cache.lock().await.num_axes = Some(n);
        Ok(n)
    }

    async fn macro_station_axes(&self) -> PmacResult<u32> {
        let addresses = self.get_i_vars(0, &[20, 21, 22, 23]).await?;
        debug!(?addresses, "MACRO IC base addresses");
        Ok(addressing::macro_ic_axis_count(&addresses))
    }

    async fn power_pmac_axes(&self) -> PmacResult<u32> {
        let result = self.send_command("Sys.MaxMotors").await;
        if !result.success {
            return Err(PmacError::CommandFailed(result.response));
        }
        let max_motors: u32 = result
            .response
            .trim()
            .parse()
            .map_err(|_| PmacError::MalformedResponse(result.response.clone()))?;
        Ok(max_motors.saturating_sub(1))
    }

    /// Reject negative axes and axes beyond the controller's count.
    pub async fn check_axis_is_in_range(&self, axis: i32) -> PmacResult<()> {
        if axis < 0 {
            return Err(PmacError::NegativeAxis);
        }
        addressing::check_axis_is_in_range(axis, self.number_of_axes().await?)
    }

    /// `true` if the axis sits on the MACRO ring.
    pub async fn is_macro_station_axis(&self, axis: i32) -> PmacResult<bool> {
        self.check_axis_is_in_range(axis).await?;
        let num_axes = self.number_of_axes().await?;
        addressing::is_macro_station_axis(axis, num_axes, self.is_geobrick().await?)
    }

    /// MACRO-station number of a ring axis.
    pub async fn axis_macro_station_number(&self, axis: i32) -> PmacResult<u32> {
        self.check_axis_is_in_range(axis).await?;
        addressing::macro_station_number(
            axis,
            self.number_of_axes().await?,
            self.is_geobrick().await?,
            self.config.macro_start_offset,
        )
    }

    /// Base of the I7000+ block of an on-board Geobrick axis.
    pub async fn onboard_axis_i7000_plus_vars_base(&self, axis: i32) -> PmacResult<u32> {
        self.check_axis_is_in_range(axis).await?;
        let num_axes = self.number_of_axes().await?;
        addressing::onboard_i7000_base(axis, num_axes, self.is_geobrick().await?)
    }

    async fn query_values(&self, command: String) -> PmacResult<Vec<String>> {
        let result = self.send_command(&command).await;
        if !result.success {
            return Err(PmacError::CommandFailed(
                "Cannot retrieve variable: error communicating with PMAC".to_string(),
            ));
        }
        let mut values: Vec<String> = result.response.split('\r').map(str::to_string).collect();
        values.pop();
        Ok(values)
    }

    /// Read `I(base + offset)` for each offset in one command.
    pub async fn get_i_vars(&self, base: u32, offsets: &[u32]) -> PmacResult<Vec<String>> {
        let command: String = offsets
            .iter()
            .map(|offset| format!("i{} ", base + offset))
            .collect();
        self.query_values(command).await
    }

    /// Assign `name=value`.
    pub async fn set_var(&self, name: &str, value: impl fmt::Display) -> PmacResult<()> {
        let command = format!("{name}={value}");
        let result = self.send_command(&command).await;
        if !result.success {
            return Err(PmacError::CommandFailed(
                "Cannot set variable: error communicating with PMAC".to_string(),
            ));
        }
        Ok(())
    }

    /// Read the setup variables `Ixxyy` of an axis.
    pub async fn get_axis_setup_i_vars(
        &self,
        axis: i32,
        offsets: &[u32],
    ) -> PmacResult<Vec<String>> {
        self.check_axis_is_in_range(axis).await?;
        self.get_i_vars(addressing::axis_setup_i_var(axis, 0), offsets)
            .await
    }

    /// Write one setup variable `Ixxyy` of an axis.
    pub async fn set_axis_setup_i_var(
        &self,
        axis: i32,
        offset: u32,
        value: impl fmt::Display,
    ) -> PmacResult<()> {
        self.check_axis_is_in_range(axis).await?;
        let i_var = addressing::axis_setup_i_var(axis, offset);
        self.set_var(&format!("i{i_var}"), value).await
    }

    /// Read MACRO-station I-variables of a ring axis.
    pub async fn get_axis_ms_i_vars(
        &self,
        axis: i32,
        ms_i_vars: &[u32],
    ) -> PmacResult<Vec<String>> {
        let station = self.axis_macro_station_number(axis).await?;
        let command: String = ms_i_vars
            .iter()
            .map(|i_var| format!("ms{station},i{i_var} "))
            .collect();
        self.query_values(command).await
    }

    /// Write one MACRO-station I-variable of a ring axis.
    pub async fn set_axis_ms_i_var(
        &self,
        axis: i32,
        i_var: u32,
        value: impl fmt::Display,
    ) -> PmacResult<()> {
        let station = self.axis_macro_station_number(axis).await?;
        self.set_var(&format!("ms{station},i{i_var}"), value).await
    }

    /// Read I7000+ variables of an on-board Geobrick axis.
    pub async fn get_onboard_axis_i7000_plus_vars(
        &self,
        axis: i32,
        offsets: &[u32],
    ) -> PmacResult<Vec<String>> {
        let base = self.onboard_axis_i7000_plus_vars_base(axis).await?;
        self.get_i_vars(base, offsets).await
    }

    /// Write one I7000+ variable of an on-board Geobrick axis.
    pub async fn set_onboard_axis_i7000_plus_i_var(
        &self,
        axis: i32,
        offset: u32,
        value: impl fmt::Display,
    ) -> PmacResult<()> {
        let base = self.onboard_axis_i7000_plus_vars_base(axis).await?;
        self.set_var(&format!("i{}", base + offset), value).await
    }

    async fn motion(&self, command: String) -> MotionResult {
        let result = self.send_command(&command).await;
        MotionResult::from_command(command, result)
    }

    /// Incremental jog by `distance` counts.
    pub async fn jog_inc(
        &self,
        motor: u32,
        direction: JogDirection,
        distance: impl fmt::Display,
    ) -> MotionResult {
        let command = match direction {
            JogDirection::Positive => format!("#{motor}J^{distance}"),
            JogDirection::Negative => format!("#{motor}J^-{distance}"),
        };
        self.motion(command).await
    }

    /// Stop jogging.
    pub async fn jog_stop(&self, motor: u32) -> MotionResult {
        self.motion(format!("#{motor}J/")).await
    }

    /// Jog to an absolute position.
    pub async fn jog_to(&self, motor: u32, position: impl fmt::Display) -> MotionResult {
        self.motion(format!("#{motor}J={position}")).await
    }

    /// Jog until stopped.
    pub async fn jog_continuous(&self, motor: u32, direction: JogDirection) -> MotionResult {
        let command = match direction {
            JogDirection::Positive => format!("#{motor}J+"),
            JogDirection::Negative => format!("#{motor}J-"),
        };
        self.motion(command).await
    }

    /// Run the homing search.
    pub async fn home_command(&self, motor: u32) -> MotionResult {
        self.motion(format!("#{motor}HM")).await
    }

    /// Set or clear the limit-disable bit of `Ixx24`.
    ///
    /// Returns an empty, unsuccessful result without writing when the bit is
    /// already in the requested state.
    pub async fn disable_limits(&self, motor: u32, disable: bool) -> PmacResult<MotionResult> {
        let query = format!("i{motor}24");
        let result = self.send_command(&query).await;
        if !result.success {
            return Ok(MotionResult::from_command(query, result));
        }

        let digits = result
            .response
            .trim_matches(|c: char| c == '$' || c == '\r' || c == '\x06');
        let flags = u32::from_str_radix(digits, 16)
            .map_err(|_| PmacError::MalformedResponse(result.response.clone()))?;
        let currently_enabled = flags & LIMITS_DISABLED_BIT == 0;

        let setting = match (currently_enabled, disable) {
            (true, true) => flags | LIMITS_DISABLED_BIT,
            (false, false) => flags ^ LIMITS_DISABLED_BIT,
            _ => return Ok(MotionResult::nothing_sent()),
        };
        Ok(self.motion(format!("i{motor}24=${setting:x}")).await)
    }

    /// Copy a file from the controller (SSH links only).
    pub async fn get_file(&self, remote: &Path, local: &Path) -> PmacResult<()> {
        let _permit = self.guard.acquire().await;
        self.link.lock().await.get_file(remote, local).await
    }

    /// Copy a file to the controller (SSH links only).
    pub async fn put_file(&self, local: &Path, remote: &Path) -> PmacResult<()> {
        let _permit = self.guard.acquire().await;
        self.link.lock().await.put_file(local, remote).await
    }

    /// Run a command in the controller's Linux shell (SSH links only).
    pub async fn send_ssh_command(&self, command: &str) -> PmacResult<String> {
        let _permit = self.guard.acquire().await;
        self.link.lock().await.shell_command(command).await
    }
}
