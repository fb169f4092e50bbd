use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, timeout};
use tracing::{debug, warn};

use super::protocol::{self, PayloadError};
use super::{BusError, BusEvent, BusTransport, CommandMessage, DeviceAddress, SensorReading};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Upper bound on a single request/response exchange.
    pub transact_timeout: Duration,
    /// Additional attempts after the first failure.
    pub retries: u32,
    /// Pause before each retry.
    pub backoff: Duration,
}

/// Owns the bus transport; the single place transactions happen, so only one
/// is ever in flight. Polls both boards on a fixed interval and executes
/// queued commands, reporting everything as [`BusEvent`]s.
pub struct BusClient<T: BusTransport> {
    transport: T,
    retry: RetryPolicy,
}

enum PollFailure {
    Bus(BusError),
    Payload(PayloadError),
}

impl From<BusError> for PollFailure {
    fn from(e: BusError) -> Self {
        PollFailure::Bus(e)
    }
}

impl From<PayloadError> for PollFailure {
    fn from(e: PayloadError) -> Self {
        PollFailure::Payload(e)
    }
}

impl<T: BusTransport> BusClient<T> {
    pub fn new(transport: T, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    /// One transaction with bounded retries and a per-attempt timeout. A board
    /// that stays silent through every retry is reported as failed, never
    /// waited on indefinitely.
    pub async fn transact(
        &mut self,
        address: DeviceAddress,
        request: &[u8],
        response: &mut [u8],
    ) -> Result<(), BusError> {
        let mut last = BusError::Timeout;
        for attempt in 0..=self.retry.retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry.backoff).await;
            }
            let transfer = self
                .transport
                .transfer(address.i2c_addr(), request, response);
            match timeout(self.retry.transact_timeout, transfer).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => {
                    debug!("Transaction with {} failed (attempt {}): {}", address, attempt + 1, e);
                    last = e;
                }
                Err(_) => {
                    debug!("Transaction with {} timed out (attempt {})", address, attempt + 1);
                    last = BusError::Timeout;
                }
            }
        }
        Err(last)
    }

    async fn poll_board(
        &mut self,
        address: DeviceAddress,
        at: Instant,
    ) -> Result<Vec<SensorReading>, PollFailure> {
        let mut buf = [0u8; protocol::MAX_REPORT_LEN];
        let response = &mut buf[..protocol::report_len(address)];
        self.transact(address, &[protocol::REQ_REPORT], response)
            .await?;
        Ok(protocol::decode_report(address, response, at)?)
    }

    async fn dispatch(&mut self, cmd: &CommandMessage) -> Result<(), BusError> {
        let (address, frame) = protocol::encode_command(cmd);
        let mut ack = [0u8; 1];
        self.transact(address, &frame, &mut ack).await?;
        if ack[0] != protocol::ACK {
            return Err(BusError::Nack);
        }
        Ok(())
    }

    /// Main bus loop. Poll failures degrade to [`BusEvent::Unreachable`] (the
    /// aggregator holds the last-known readings); malformed reports are
    /// discarded. Neither ever ends the loop.
    pub async fn run(
        mut self,
        event_tx: mpsc::Sender<BusEvent>,
        mut cmd_rx: mpsc::Receiver<CommandMessage>,
        poll_interval: Duration,
    ) {
        let mut poll_timer = tokio::time::interval(poll_interval);
        poll_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = poll_timer.tick() => {
                    for address in DeviceAddress::ALL {
                        let event = match self.poll_board(address, Instant::now()).await {
                            Ok(readings) => BusEvent::Readings(readings),
                            Err(PollFailure::Bus(e)) => {
                                warn!("{} unreachable: {}", address, e);
                                BusEvent::Unreachable(address)
                            }
                            Err(PollFailure::Payload(e)) => {
                                warn!("Discarding report from {}: {}", address, e);
                                continue;
                            }
                        };
                        if event_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { return };
                    let event = match self.dispatch(&cmd).await {
                        Ok(()) => BusEvent::CommandDone(cmd),
                        Err(e) => {
                            warn!("Failed to dispatch {:?}: {}", cmd, e);
                            BusEvent::CommandFailed(cmd)
                        }
                    };
                    if event_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
