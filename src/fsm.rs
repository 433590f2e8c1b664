//! States of the flashing protocol and the transitions between them.
//!
//! The table is kept free of I/O so it can be checked on its own; the engine decides which
//! [`Event`] happened and asks [`transition`] where to go next.

use std::fmt;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum State {
    /// Query the bootloader's capabilities.
    Info,
    /// Tell the device to stay in the bootloader.
    Boot,
    /// Prepare the buffer and plan of the next region. Sends nothing.
    Non,
    /// Synchronise before the first erase.
    Sync,
    /// Erase one page.
    Erase,
    /// Announce the data of one page.
    Write,
    /// Stream one data packet.
    Hex,
    /// Finish a region; after the last one, restart the device.
    Reboot,
    Done,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    /// The state's command was sent (and answered, where an answer is expected).
    Completed,
    /// A region has been prepared. `sync` is set for the first region only.
    Prepared { sync: bool },
    /// A data packet was sent and more of the current page remain.
    PacketSent,
    /// The last packet of a page was sent and more pages remain.
    PageDone,
    /// The last packet of the region was sent.
    RegionDone,
    /// Another region is left to flash.
    NextRegion,
    /// The device has been told to restart.
    Rebooted,
}

/// Looks up the successor of `state` on `event`. Returns `None` for combinations that cannot
/// happen in a well-formed run.
///
/// ```rust
/// use mikroflash::fsm::{transition, Event, State};
///
/// assert_eq!(transition(State::Non, Event::Prepared { sync: true }), Some(State::Sync));
/// assert_eq!(transition(State::Hex, Event::PageDone), Some(State::Erase));
/// assert_eq!(transition(State::Done, Event::Completed), None);
/// ```
pub fn transition(state: State, event: Event) -> Option<State> {
    use Event::*;
    use State::*;

    Some(match (state, event) {
        (Info, Completed) => Boot,
        (Boot, Completed) => Non,
        (Non, Prepared { sync: true }) => Sync,
        (Non, Prepared { sync: false }) => Erase,
        (Sync, Completed) => Erase,
        (Erase, Completed) => Write,
        (Write, Completed) => Hex,
        (Hex, PacketSent) => Hex,
        (Hex, PageDone) => Erase,
        (Hex, RegionDone) => Reboot,
        (Reboot, NextRegion) => Non,
        (Reboot, Rebooted) => Done,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Replays a run of one two-page region followed by a one-page region.
    #[test]
    fn full_sequence() {
        let events = [
            Event::Completed,
            Event::Completed,
            Event::Prepared { sync: true },
            Event::Completed,
            Event::Completed,
            Event::Completed,
            Event::PacketSent,
            Event::PageDone,
            Event::Completed,
            Event::Completed,
            Event::RegionDone,
            Event::NextRegion,
            Event::Prepared { sync: false },
            Event::Completed,
            Event::Completed,
            Event::RegionDone,
            Event::Rebooted,
        ];
        let mut state = State::Info;
        let mut visited = vec![state];
        for event in events.iter() {
            state = transition(state, *event).unwrap();
            visited.push(state);
        }

        use State::*;
        assert_eq!(
            visited,
            vec![
                Info, Boot, Non, Sync, Erase, Write, Hex, Hex, Erase, Write, Hex, Reboot, Non,
                Erase, Write, Hex, Reboot, Done
            ]
        );
    }

    #[test]
    fn sync_is_only_entered_from_non() {
        for state in [State::Info, State::Boot, State::Erase, State::Hex, State::Reboot].iter() {
            assert_ne!(
                transition(*state, Event::Prepared { sync: true }),
                Some(State::Sync)
            );
        }
    }

    #[test]
    fn done_is_terminal() {
        for event in [Event::Completed, Event::NextRegion, Event::Rebooted].iter() {
            assert_eq!(transition(State::Done, *event), None);
        }
    }
}
