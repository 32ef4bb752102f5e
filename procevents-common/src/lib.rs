#![no_std]

pub const TASK_COMM_LEN: usize = 16;
pub const MAX_FILENAME_LEN: usize = 127;

/// Tracepoint program emitting a record on every successful exec.
pub const EXEC_PROGRAM: &str = "handle_exec";
/// Tracepoint program emitting a record when a thread group leader exits.
pub const EXIT_PROGRAM: &str = "handle_exit";
/// Remembers the parent of every new task for the records above.
pub const FORK_PROGRAM: &str = "handle_fork";
/// Remembers the status passed to `exit_group` for the exit record.
pub const EXIT_GROUP_PROGRAM: &str = "handle_exit_group";
/// Ring buffer map carrying `RawEvent` records to userspace.
pub const EVENTS_MAP: &str = "EVENTS";

/// One record as written into the `EVENTS` ring buffer.
///
/// The layout is packed and in the target's byte order; userspace decodes it
/// field by field rather than casting, so any change here needs a matching
/// change in the agent's decoder.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct RawEvent {
    pub pid: u32,
    pub ppid: u32,
    pub exit_code: u32,
    pub duration_ns: u64,
    pub comm: [u8; TASK_COMM_LEN],
    pub filename: [u8; MAX_FILENAME_LEN],
    pub exit_event: bool,
}

impl RawEvent {
    pub const SIZE: usize = core::mem::size_of::<RawEvent>();

    pub const fn zeroed() -> Self {
        Self {
            pid: 0,
            ppid: 0,
            exit_code: 0,
            duration_ns: 0,
            comm: [0; TASK_COMM_LEN],
            filename: [0; MAX_FILENAME_LEN],
            exit_event: false,
        }
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for RawEvent {}
