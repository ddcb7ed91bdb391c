use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use mac_address::MacAddress;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};

use crate::activity::{LawnMowerActivity, lawn_mower_activity};
use crate::error::{TransportError, UpdateError};
use crate::messages::{MowerCommand, RefreshOutcome, UpdateNotice};
use crate::session::{DeviceDiscovery, MowerActivity, MowerSession, MowerState, Snapshot};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// The snapshot fields, in the order they are polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    BatteryLevel,
    Activity,
    State,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Field::BatteryLevel => "battery level",
            Field::Activity => "activity",
            Field::State => "state",
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum FieldValue {
    BatteryLevel(u8),
    Activity(MowerActivity),
    State(MowerState),
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    pub fetch_timeout: Duration,
    /// How long `shutdown` waits for an in-flight cycle before abandoning it.
    pub shutdown_grace: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        CoordinatorSettings {
            poll_interval: DEFAULT_POLL_INTERVAL,
            connect_timeout: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Releases the in-flight flag when the cycle holding it ends.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Polls a mower session on a fixed cadence and keeps it connected.
///
/// Subscribers get an [`UpdateNotice`] after every completed cycle and read
/// [`Coordinator::last_snapshot`] and [`Coordinator::available`] themselves.
pub struct Coordinator<S, D> {
    address: MacAddress,
    settings: CoordinatorSettings,
    session: Mutex<S>,
    discovery: D,
    in_flight: AtomicBool,
    available: AtomicBool,
    snapshot: watch::Sender<Option<Snapshot>>,
    notices: broadcast::Sender<UpdateNotice>,
    stop: watch::Sender<bool>,
    stopped: AtomicBool,
    poller: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<S, D> Coordinator<S, D>
where
    S: MowerSession,
    D: DeviceDiscovery<Device = S::Device>,
{
    pub fn new(
        address: MacAddress,
        session: S,
        discovery: D,
        settings: CoordinatorSettings,
    ) -> Self {
        let (notices, _) = broadcast::channel(16);
        Coordinator {
            address,
            settings,
            session: Mutex::new(session),
            discovery,
            in_flight: AtomicBool::new(false),
            available: AtomicBool::new(false),
            snapshot: watch::Sender::new(None),
            notices,
            stop: watch::Sender::new(false),
            stopped: AtomicBool::new(false),
            poller: std::sync::Mutex::new(None),
        }
    }

    pub fn address(&self) -> MacAddress {
        self.address
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateNotice> {
        self.notices.subscribe()
    }

    pub fn last_snapshot(&self) -> Option<Snapshot> {
        *self.snapshot.borrow()
    }

    pub fn available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Starts the periodic schedule. The first cycle runs immediately.
    pub fn start(self: &Arc<Self>)
    where
        S: 'static,
        D: 'static,
    {
        let mut poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if poller.is_some() || self.stopped.load(Ordering::Acquire) {
            return;
        }

        let coordinator = Arc::clone(self);
        let mut stop = self.stop.subscribe();
        *poller = Some(tokio::spawn(async move {
            let mut ticks = interval(coordinator.settings.poll_interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = stop.changed() => break,
                    _ = ticks.tick() => {
                        coordinator.refresh().await;
                    }
                    _ = coordinator.discovery.disconnected(&coordinator.address) => {
                        coordinator.link_lost();
                    }
                }
            }
            debug!("Polling of {} stopped", coordinator.address);
        }));
    }

    /// Runs a cycle now. A no-op returning [`RefreshOutcome::Skipped`] if one
    /// is already running.
    pub async fn request_refresh(&self) -> RefreshOutcome {
        self.refresh().await
    }

    /// Connects if needed, sends `command`, then refreshes.
    pub async fn execute(&self, command: MowerCommand) -> Result<RefreshOutcome, UpdateError> {
        if self.stopped.load(Ordering::Acquire) {
            warn!("Dropping {:?}, coordinator is shut down", command);
            return Ok(RefreshOutcome::Skipped);
        }
        info!("Sending {:?} to {}", command, self.address);
        {
            let mut session = self.session.lock().await;
            self.ensure_connected(&mut session).await?;

            let docked = lawn_mower_activity(self.last_snapshot().as_ref())
                == Some(LawnMowerActivity::Docked);
            timeout(
                self.settings.fetch_timeout,
                Self::send(&mut session, command, docked),
            )
            .await
            .unwrap_or(Err(TransportError::Timeout))
            .map_err(UpdateError::Command)?;
        }
        Ok(self.refresh().await)
    }

    /// Stops polling and closes the session. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Shutdown");
        self.stop.send_replace(true);

        let poller = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut poller) = poller {
            if timeout(self.settings.shutdown_grace, &mut poller)
                .await
                .is_err()
            {
                warn!("Poll cycle still running after grace period, abandoning it");
                poller.abort();
            }
        }

        match timeout(self.settings.shutdown_grace, self.session.lock()).await {
            Ok(mut session) => {
                if session.is_connected().await {
                    if let Err(err) = session.disconnect().await {
                        warn!("Error disconnecting from {}: {}", self.address, err);
                    }
                }
            }
            Err(_) => warn!("Session still busy, leaving it connected"),
        }
        self.available.store(false, Ordering::Release);
    }

    /// The link dropped between cycles. The next cycle reconnects.
    fn link_lost(&self) {
        if !self.available.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Lost connection to {}", self.address);
        if self.notices.send(UpdateNotice::Disconnected).is_err() {
            debug!("No subscribers for update notice");
        }
    }

    async fn refresh(&self) -> RefreshOutcome {
        if self.stopped.load(Ordering::Acquire) {
            debug!("Coordinator is shut down, not refreshing");
            return RefreshOutcome::Skipped;
        }
        let Some(_in_flight) = InFlight::acquire(&self.in_flight) else {
            debug!("Refresh already in progress, skipping");
            return RefreshOutcome::Skipped;
        };

        debug!("Polling device {}", self.address);
        let mut session = self.session.lock().await;
        let (notice, outcome) = match self.poll(&mut session).await {
            Ok(snapshot) => {
                let connected = session.is_connected().await;
                self.snapshot.send_replace(Some(snapshot));
                self.available.store(connected, Ordering::Release);
                (UpdateNotice::Updated, RefreshOutcome::Updated)
            }
            Err(err) => {
                warn!("Update of {} failed: {}", self.address, err);
                self.available.store(false, Ordering::Release);
                let reason = err.to_string();
                (
                    UpdateNotice::Failed(reason.clone()),
                    RefreshOutcome::Failed(reason),
                )
            }
        };
        drop(session);

        if self.notices.send(notice).is_err() {
            debug!("No subscribers for update notice");
        }
        outcome
    }

    async fn poll(&self, session: &mut S) -> Result<Snapshot, UpdateError> {
        self.ensure_connected(session).await?;

        let battery_level = match self.fetch_field(session, Field::BatteryLevel).await? {
            Some(FieldValue::BatteryLevel(level)) => Some(level),
            _ => None,
        };
        let activity = match self.fetch_field(session, Field::Activity).await? {
            Some(FieldValue::Activity(activity)) => Some(activity),
            _ => None,
        };
        let state = match self.fetch_field(session, Field::State).await? {
            Some(FieldValue::State(state)) => Some(state),
            _ => None,
        };

        Ok(Snapshot {
            battery_level,
            activity,
            state,
        })
    }

    /// An absent value gets one reconnect and one refetch. A transport error
    /// gets one reconnect and then fails the cycle without a refetch.
    async fn fetch_field(
        &self,
        session: &mut S,
        field: Field,
    ) -> Result<Option<FieldValue>, UpdateError> {
        let result = match self.fetch(session, field).await {
            Ok(None) => {
                debug!("No {} from device, retrying", field);
                self.ensure_connected(session).await?;
                self.fetch(session, field).await
            }
            other => other,
        };

        match result {
            Ok(value) => {
                debug!("{}: {:?}", field, value);
                Ok(value)
            }
            Err(source) => {
                error!("Error getting {} from device: {}", field, source);
                self.ensure_connected(session).await?;
                Err(UpdateError::Fetch { field, source })
            }
        }
    }

    async fn fetch(
        &self,
        session: &mut S,
        field: Field,
    ) -> Result<Option<FieldValue>, TransportError> {
        timeout(self.settings.fetch_timeout, Self::read(session, field))
            .await
            .unwrap_or(Err(TransportError::Timeout))
    }

    async fn read(session: &mut S, field: Field) -> Result<Option<FieldValue>, TransportError> {
        Ok(match field {
            Field::BatteryLevel => session.battery_level().await?.map(FieldValue::BatteryLevel),
            Field::Activity => session.activity().await?.map(FieldValue::Activity),
            Field::State => session.state().await?.map(FieldValue::State),
        })
    }

    async fn send(session: &mut S, command: MowerCommand, docked: bool) -> Result<(), TransportError> {
        match command {
            MowerCommand::StartMowing => {
                session.resume().await?;
                if docked {
                    session.override_schedule().await?;
                }
                Ok(())
            }
            MowerCommand::Pause => session.pause().await,
            MowerCommand::Dock => session.park().await,
        }
    }

    async fn ensure_connected(&self, session: &mut S) -> Result<(), UpdateError> {
        if session.is_connected().await {
            return Ok(());
        }

        debug!("Trying to reconnect to {}", self.address);
        self.discovery.close_stale_connections(&self.address).await;

        let Some(device) = self.discovery.find_device(&self.address).await else {
            error!("Can't find device {}", self.address);
            return Err(UpdateError::DeviceNotFound(self.address));
        };

        let reason = match timeout(self.settings.connect_timeout, session.connect(device)).await {
            Ok(Ok(true)) => {
                info!("Connected to {}", self.address);
                return Ok(());
            }
            Ok(Ok(false)) => "device refused the connection".to_string(),
            Ok(Err(err)) => err.to_string(),
            Err(_) => TransportError::Timeout.to_string(),
        };
        Err(UpdateError::ConnectionFailed {
            address: self.address,
            reason,
        })
    }
}
