use crate::error::Result;
use crate::fsm::State;

/// Progress of a long-running operation after one step.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Progress {
    /// The state whose command was just carried out.
    pub state: State,

    /// Index of the region being flashed (0 = program flash, 1 = boot vector page, 2 = config).
    pub region: usize,

    /// Bytes of the current region sent so far.
    pub region_written: u32,

    /// Bytes planned for the current region.
    pub region_planned: u32,

    /// Bytes sent over the whole run.
    pub written: u64,
}

/// A step-wise operation which reports its progress after every step. Iterating drives the
/// operation; the iterator is fused after the first error.
pub trait Operation: Iterator<Item = Result<Progress>> {
    /// Bytes planned so far. Grows as later parts of the operation are prepared.
    fn total(&self) -> u64;

    /// Runs the operation to completion.
    fn execute(&mut self) -> Result<()> {
        if let Some(Err(error)) = self.last() {
            Err(error)
        } else {
            Ok(())
        }
    }
}
