use super::Capabilities;

/// No receive command of its own: the enclosing process's own stdout is the
/// destination, pumped to directly by [`crate::flow::Flow`]'s `Sink::SelfStdout`
/// mode rather than through a spawned receiving process.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipeSink;

impl PipeSink {
    pub fn name(&self) -> String {
        "pipe-sink".to_string()
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            can_send: false,
            can_receive: true,
            needs_list_for_planning: false,
            supports_incremental_send: false,
        }
    }
}
