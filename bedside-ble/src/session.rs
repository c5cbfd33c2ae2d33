//! Device session: the single owner of the BLE connection to the bed
//!
//! Every intent goes through [`DeviceSession::execute`], which holds one async
//! mutex for the whole exchange, so two HTTP requests never interleave writes.
//! All retry policy lives here:
//!
//! - `Busy` on connect is retried with bounded exponential backoff, then
//!   reported as [`SessionError::DeviceUnavailable`].
//! - An I/O failure while connected tears the link down and the whole
//!   operation is retried exactly once.
//! - After `idle_disconnect` without intents the link is released so the
//!   phone app can connect.
//!
//! A lift write is followed by a wait proportional to how far the actuator
//! has to travel, so the next command of a preset starts from rest.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use bedside_proto::{
    Characteristic, Codec, DecodeError, DeviceStatus, Exchange, Intent, InvalidPercent, Reading,
};

use crate::link::{ConnError, GattLink, IoError, PeripheralIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The last connection attempt failed, the next intent starts over
    Failed,
}

/// Bounded exponential backoff for a busy peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total connect attempts, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    /// Zero disables the idle monitor
    pub idle_disconnect: Duration,
    pub busy_retry: RetryPolicy,
    /// Pause between the commands of a preset
    pub preset_step_delay: Duration,
    /// Read a characteristic back after writing it
    pub confirm_writes: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            idle_disconnect: Duration::from_secs(60),
            busy_retry: RetryPolicy::default(),
            preset_step_delay: Duration::from_secs(1),
            confirm_writes: true,
        }
    }
}

/// Result of a successful intent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Written, nothing was read back
    Applied,
    /// Written, and the device reports this value
    Confirmed(Reading),
    /// Answer to a query
    Reading(Reading),
    /// The firmware can't report this value, this is what was last commanded
    LastCommanded(Reading),
    Status(DeviceStatus),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportFailure {
    #[error("connect failed: {0}")]
    Connect(#[from] ConnError),
    #[error(transparent)]
    Io(#[from] IoError),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] InvalidPercent),
    #[error("bed is in use by another controller (gave up after {attempts} attempts)")]
    DeviceUnavailable { attempts: u32 },
    #[error("transport error: {0}")]
    TransportError(#[from] TransportFailure),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Failure of one pass over an exchange
enum AttemptError {
    /// Retried once after a reconnect
    Io(IoError),
    Fatal(SessionError),
}

impl From<SessionError> for AttemptError {
    fn from(e: SessionError) -> Self {
        AttemptError::Fatal(e)
    }
}

struct Inner<H> {
    handle: Option<H>,
    last_activity: Instant,
    /// Last light state written in this process
    last_light: Option<bool>,
}

pub struct DeviceSession<L: GattLink> {
    link: L,
    identity: PeripheralIdentity,
    codec: Codec,
    config: SessionConfig,
    state: watch::Sender<ConnectionState>,
    inner: Mutex<Inner<L::Handle>>,
}

impl<L: GattLink> DeviceSession<L> {
    pub fn new(link: L, identity: PeripheralIdentity, codec: Codec, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            link,
            identity,
            codec,
            config,
            state,
            inner: Mutex::new(Inner {
                handle: None,
                last_activity: Instant::now(),
                last_light: None,
            }),
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn identity(&self) -> &PeripheralIdentity {
        &self.identity
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn transition(&self, to: ConnectionState) {
        let from = self.state.send_replace(to);
        if from != to {
            tracing::info!("{}: {from:?} -> {to:?}", self.identity.address);
        }
    }

    /// Run one intent to completion
    pub async fn execute(&self, intent: Intent) -> Result<Outcome, SessionError> {
        let exchange = self.codec.encode(&intent)?;

        let mut inner = self.inner.lock().await;
        tracing::info!("{intent}");

        let mut result = self.attempt(&mut inner, &exchange).await;
        if let Err(AttemptError::Io(e)) = &result {
            tracing::warn!("{intent}: {e}, reconnecting and retrying once");
            self.teardown(&mut inner).await;
            result = self.attempt(&mut inner, &exchange).await;
        }
        inner.last_activity = Instant::now();

        match result {
            Ok(outcome) => {
                if let Intent::LightSet(on) = intent {
                    inner.last_light = Some(on);
                }
                Ok(outcome)
            }
            Err(AttemptError::Io(e)) => {
                tracing::error!("{intent}: {e}");
                self.teardown(&mut inner).await;
                Err(TransportFailure::Io(e).into())
            }
            Err(AttemptError::Fatal(e)) => {
                tracing::warn!("{intent}: {e}");
                Err(e)
            }
        }
    }

    async fn attempt(
        &self,
        inner: &mut Inner<L::Handle>,
        exchange: &Exchange,
    ) -> Result<Outcome, AttemptError> {
        self.ensure_connected(inner).await?;
        let Some(handle) = inner.handle.as_ref() else {
            return Err(AttemptError::Io(IoError::Disconnected(
                "no connection after connect".to_string(),
            )));
        };

        match exchange {
            Exchange::Write { commands, observe } => {
                let timed = self.codec.profile().full_travel_ms > 0;
                for (i, command) in commands.iter().enumerate() {
                    if i > 0 && !self.config.preset_step_delay.is_zero() {
                        tokio::time::sleep(self.config.preset_step_delay).await;
                    }
                    let from = if command.target.is_lift() && timed {
                        Some(self.position(handle, command.target).await?)
                    } else {
                        None
                    };
                    tracing::debug!("write {} <- {:02x?}", command.target, command.payload);
                    self.link
                        .write(handle, command.target, &command.payload)
                        .await
                        .map_err(|e| match e {
                            IoError::NotExposed(target) => AttemptError::Fatal(
                                SessionError::Decode(DecodeError::Unsupported(target)),
                            ),
                            e => AttemptError::Io(e),
                        })?;
                    if let Some(from) = from {
                        let travel = self.codec.travel(command, from);
                        tracing::debug!("waiting {travel:?} for {} to get there", command.target);
                        tokio::time::sleep(travel).await;
                    }
                }
                match observe {
                    Some(target) if self.config.confirm_writes => {
                        self.confirm(handle, *target).await
                    }
                    _ => Ok(Outcome::Applied),
                }
            }
            Exchange::Read(targets) => match targets.as_slice() {
                [target] => match self.read(handle, *target).await? {
                    Ok(reading) => Ok(Outcome::Reading(reading)),
                    Err(e) => match (e, inner.last_light) {
                        (DecodeError::Unsupported(Characteristic::Light), Some(on)) => {
                            tracing::info!("light can't be read, reporting last commanded state");
                            Ok(Outcome::LastCommanded(Reading::Light(on)))
                        }
                        (e, _) => Err(SessionError::Decode(e).into()),
                    },
                },
                targets => {
                    let mut readings = Vec::with_capacity(targets.len());
                    for target in targets {
                        match self.read(handle, *target).await? {
                            Ok(reading) => readings.push(reading),
                            Err(DecodeError::Unsupported(Characteristic::Light)) => {
                                if let Some(on) = inner.last_light {
                                    readings.push(Reading::Light(on));
                                }
                            }
                            Err(e) => return Err(SessionError::Decode(e).into()),
                        }
                    }
                    DeviceStatus::from_readings(readings)
                        .map(Outcome::Status)
                        .map_err(|e| SessionError::Decode(e).into())
                }
            },
        }
    }

    /// Read and decode one characteristic; a characteristic the firmware
    /// won't let us read decodes as unsupported
    async fn read(
        &self,
        handle: &L::Handle,
        target: Characteristic,
    ) -> Result<Result<Reading, DecodeError>, AttemptError> {
        match self.link.read(handle, target).await {
            Ok(raw) => {
                tracing::debug!("read {target} -> {raw:02x?}");
                Ok(self.codec.decode(target, &raw))
            }
            Err(IoError::NotReadable(target) | IoError::NotExposed(target)) => {
                Ok(Err(DecodeError::Unsupported(target)))
            }
            Err(e) => Err(AttemptError::Io(e)),
        }
    }

    /// Where a lift is now, `None` when it can't be told
    async fn position(
        &self,
        handle: &L::Handle,
        target: Characteristic,
    ) -> Result<Option<u8>, AttemptError> {
        match self.read(handle, target).await? {
            Ok(reading) => Ok(reading.percent()),
            Err(e) => {
                tracing::warn!("{target} position unknown, assuming full travel: {e}");
                Ok(None)
            }
        }
    }

    async fn confirm(
        &self,
        handle: &L::Handle,
        target: Characteristic,
    ) -> Result<Outcome, AttemptError> {
        match self.read(handle, target).await? {
            Ok(reading) => Ok(Outcome::Confirmed(reading)),
            Err(e) => {
                tracing::warn!("could not confirm {target}: {e}");
                Ok(Outcome::Applied)
            }
        }
    }

    async fn ensure_connected(&self, inner: &mut Inner<L::Handle>) -> Result<(), SessionError> {
        if inner.handle.is_some() {
            return Ok(());
        }
        if self.state() == ConnectionState::Failed {
            self.transition(ConnectionState::Disconnected);
        }

        let policy = self.config.busy_retry;
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.transition(ConnectionState::Connecting);
            match self
                .link
                .connect(&self.identity, self.config.connect_timeout)
                .await
            {
                Ok(handle) => {
                    inner.handle = Some(handle);
                    self.transition(ConnectionState::Connected);
                    return Ok(());
                }
                Err(ConnError::Busy) if attempt < max_attempts => {
                    self.transition(ConnectionState::Failed);
                    let delay = policy.backoff(attempt);
                    tracing::warn!(
                        "{} busy (attempt {attempt}/{max_attempts}), retrying in {delay:?}",
                        self.identity.address
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(ConnError::Busy) => {
                    self.transition(ConnectionState::Failed);
                    return Err(SessionError::DeviceUnavailable { attempts: attempt });
                }
                Err(e) => {
                    self.transition(ConnectionState::Failed);
                    return Err(TransportFailure::Connect(e).into());
                }
            }
        }
    }

    async fn teardown(&self, inner: &mut Inner<L::Handle>) {
        if let Some(handle) = inner.handle.take() {
            self.link.disconnect(&handle).await;
        }
        self.transition(ConnectionState::Disconnected);
    }

    /// Release the link if nothing has run for `idle_disconnect`
    pub async fn disconnect_if_idle(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.handle.is_none() || inner.last_activity.elapsed() < self.config.idle_disconnect {
            return false;
        }
        tracing::info!(
            "idle for {:?}, releasing {}",
            self.config.idle_disconnect,
            self.identity.address
        );
        self.teardown(&mut inner).await;
        true
    }

    /// Disconnect for good, used at process exit
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        self.teardown(&mut inner).await;
    }
}

impl<L: GattLink + 'static> DeviceSession<L> {
    /// Periodically release an idle link. The task ends once the session is
    /// dropped; `None` when idle disconnect is disabled.
    pub fn spawn_idle_monitor(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let idle = self.config.idle_disconnect;
        if idle.is_zero() {
            return None;
        }
        let period = (idle / 4).clamp(Duration::from_millis(10), Duration::from_secs(5));
        let session: Weak<Self> = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(session) = session.upgrade() else {
                    break;
                };
                session.disconnect_if_idle().await;
            }
        }))
    }
}
