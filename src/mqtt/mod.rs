pub mod client;

/// A command received from the remote server, already parsed from its
/// control topic and payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCommand {
    /// Open (true) or close (false) the door.
    Door(bool),
    /// Switch the button LED.
    LedButton(bool),
    /// Arm or disarm intrusion detection.
    SecurityMode(bool),
}
