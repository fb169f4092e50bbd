use std::collections::HashSet;

use tracing::{info, warn};

pub type CardUid = [u8; 4];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorIntent {
    Open,
    Close,
    NoChange,
}

/// Decides door intent from the physical inputs: the open/close buttons on the
/// door board and the RFID reader. The allow-list is fixed at startup.
pub struct AccessControlPolicy {
    allow_list: HashSet<CardUid>,
}

impl AccessControlPolicy {
    pub fn new(allow_list: HashSet<CardUid>) -> Self {
        Self { allow_list }
    }

    pub fn is_allowed(&self, uid: &CardUid) -> bool {
        self.allow_list.contains(uid)
    }

    /// Button presses are explicit and win over the card reader. Pressing both
    /// buttons at once is a conflict and changes nothing. An allow-listed card
    /// toggles the door; an unknown card is a denied-access event and changes
    /// nothing.
    pub fn evaluate(
        &self,
        button_open: bool,
        button_close: bool,
        scanned: Option<CardUid>,
        door_open: bool,
    ) -> DoorIntent {
        if button_open && button_close {
            warn!("Open and close buttons pressed together, ignoring both");
            return DoorIntent::NoChange;
        }
        if button_open {
            return DoorIntent::Open;
        }
        if button_close {
            return DoorIntent::Close;
        }

        if let Some(uid) = scanned {
            if self.is_allowed(&uid) {
                info!("Card {} accepted", format_uid(&uid));
                return if door_open {
                    DoorIntent::Close
                } else {
                    DoorIntent::Open
                };
            }
            warn!("Access denied for card {}", format_uid(&uid));
        }
        DoorIntent::NoChange
    }
}

pub fn format_uid(uid: &CardUid) -> String {
    format!("{:02X}:{:02X}:{:02X}:{:02X}", uid[0], uid[1], uid[2], uid[3])
}
