//! Commands a controller server drains from its task queue each cycle.

/// A [ControllerCommand] is a message sent from the manager to one
/// controller server over its task queue. Commands are applied in FIFO
/// order, after the inbound Switch report is processed and before the
/// outbound report is built.
#[derive(Debug, Clone)]
pub enum ControllerCommand {
    /// Queue macro text for execution under the given id
    Macro { text: String, id: String },
    /// Stop a queued or running macro by id
    StopMacro { id: String },
    /// Drop all queued and running macros
    ClearMacros,
}
