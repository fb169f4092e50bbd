pub mod client;
pub mod protocol;

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// The two peripheral boards on the I2C bus. The topology is fixed by the
/// hardware, so this is a closed set rather than a runtime device list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceAddress {
    /// Uno 1: PIR, DHT, two LEDs, one toggle button.
    SensorBoard,
    /// Uno 2: open/close buttons, RFID reader, ultrasonic ranger, door servo.
    DoorBoard,
}

impl DeviceAddress {
    pub const ALL: [DeviceAddress; 2] = [DeviceAddress::SensorBoard, DeviceAddress::DoorBoard];

    pub fn i2c_addr(self) -> u8 {
        match self {
            DeviceAddress::SensorBoard => 8,
            DeviceAddress::DoorBoard => 9,
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceAddress::SensorBoard => write!(f, "sensor board (addr 8)"),
            DeviceAddress::DoorBoard => write!(f, "door board (addr 9)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedId {
    Pir,
    Button,
}

/// Command to a peripheral board. Idempotent: replaying a command leaves the
/// board in the same state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandMessage {
    /// Door servo target, integer degrees, 0..=180.
    SetServoAngle(u8),
    SetLed(LedId, bool),
}

/// One decoded sensor fact from a board report. Immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub source: DeviceAddress,
    pub kind: ReadingKind,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReadingKind {
    Motion(bool),
    Temperature(f32),
    Humidity(f32),
    /// Ultrasonic range in centimeters.
    Distance(f32),
    /// Level of the LED toggle button on the sensor board.
    ToggleButton(bool),
    /// Levels of the open/close buttons on the door board.
    DoorButtons { open: bool, close: bool },
    /// A card was held to the reader since the last poll.
    Card([u8; 4]),
}

/// What the bus task reports back to the control loop.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    Readings(Vec<SensorReading>),
    /// A command was dispatched and acknowledged by the board.
    CommandDone(CommandMessage),
    /// A command could not be delivered; the control loop may re-emit it.
    CommandFailed(CommandMessage),
    /// Polling a board failed after all retries; its last readings stay valid.
    Unreachable(DeviceAddress),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// No response within the transaction timeout.
    Timeout,
    /// The board answered with a NACK (or no ACK byte on a command).
    Nack,
    Io(String),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Timeout => write!(f, "bus transaction timed out"),
            BusError::Nack => write!(f, "peripheral NACKed the transaction"),
            BusError::Io(e) => write!(f, "bus I/O error: {e}"),
        }
    }
}

impl std::error::Error for BusError {}

/// One request/response exchange with an addressed board. The bus task is the
/// only owner of the transport, so transactions are serialized by construction.
pub trait BusTransport: Send {
    fn transfer(
        &mut self,
        address: u8,
        request: &[u8],
        response: &mut [u8],
    ) -> impl Future<Output = Result<(), BusError>> + Send;
}

/// Adapter from any `embedded_hal::i2c::I2c` device (on the master this is
/// `linux_embedded_hal::I2cdev`). The blocking write-read runs on the
/// blocking pool, so the timeout in `BusClient::transact` can abandon a hung
/// device instead of wedging the bus task.
pub struct I2cTransport<I2C> {
    device: Arc<Mutex<I2C>>,
}

impl<I2C> I2cTransport<I2C> {
    pub fn new(i2c: I2C) -> Self {
        Self {
            device: Arc::new(Mutex::new(i2c)),
        }
    }
}

impl<I2C> BusTransport for I2cTransport<I2C>
where
    I2C: embedded_hal::i2c::I2c + Send + 'static,
{
    fn transfer(
        &mut self,
        address: u8,
        request: &[u8],
        response: &mut [u8],
    ) -> impl Future<Output = Result<(), BusError>> + Send {
        let device = Arc::clone(&self.device);
        let request = request.to_vec();
        let read_len = response.len();

        async move {
            let task = tokio::task::spawn_blocking(move || {
                use embedded_hal::i2c::Error as _;

                // An abandoned transfer holds the lock until its I/O returns;
                // the next attempt queues behind it here, off the runtime.
                let mut dev = device.lock().unwrap_or_else(|e| e.into_inner());
                let mut buf = vec![0u8; read_len];
                dev.write_read(address, &request, &mut buf)
                    .map_err(|e| match e.kind() {
                        embedded_hal::i2c::ErrorKind::NoAcknowledge(_) => BusError::Nack,
                        kind => BusError::Io(format!("{kind:?}")),
                    })?;
                Ok(buf)
            });
            match task.await {
                Ok(Ok(buf)) => {
                    response.copy_from_slice(&buf);
                    Ok(())
                }
                Ok(Err(e)) => Err(e),
                Err(e) => Err(BusError::Io(format!("bus transfer task failed: {e}"))),
            }
        }
    }
}
