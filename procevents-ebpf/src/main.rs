#![cfg_attr(feature = "build-ebpf", no_std)]
#![cfg_attr(feature = "build-ebpf", no_main)]

#[cfg(feature = "build-ebpf")]
mod ebpf {
    use aya_ebpf::{
        EbpfContext,
        helpers::{bpf_get_current_comm, bpf_ktime_get_ns, bpf_probe_read_kernel_str_bytes},
        macros::{map, tracepoint},
        maps::{HashMap, LruHashMap, RingBuf},
        programs::TracePointContext,
    };
    use procevents_common::RawEvent;

    // sched_process_exec: `__data_loc char[] filename` follows the 8 byte common header.
    const EXEC_FILENAME_LOC_OFFSET: usize = 8;
    // sched_process_fork: `pid_t child_pid` after parent_comm, parent_pid and child_comm.
    const FORK_CHILD_PID_OFFSET: usize = 44;
    // sys_enter_exit_group: `int error_code`, widened to a syscall argument slot.
    const EXIT_GROUP_CODE_OFFSET: usize = 16;

    #[link_section = "license"]
    #[used]
    pub static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";

    #[map]
    static EVENTS: RingBuf = RingBuf::with_byte_size(256 * 1024, 0);

    // tgid -> exec timestamp, consumed by the exit handler
    #[map]
    static EXEC_START: HashMap<u32, u64> = HashMap::with_max_entries(8192, 0);

    // task pid -> parent tgid, filled on fork
    #[map]
    static PARENTS: LruHashMap<u32, u32> = LruHashMap::with_max_entries(16384, 0);

    // tgid -> exit status passed to exit_group
    #[map]
    static EXIT_CODES: LruHashMap<u32, u32> = LruHashMap::with_max_entries(8192, 0);

    #[tracepoint]
    pub fn handle_exec(ctx: TracePointContext) -> u32 {
        match try_handle_exec(&ctx) {
            Ok(ret) => ret,
            Err(ret) => ret,
        }
    }

    #[tracepoint]
    pub fn handle_exit(ctx: TracePointContext) -> u32 {
        match try_handle_exit(&ctx) {
            Ok(ret) => ret,
            Err(ret) => ret,
        }
    }

    #[tracepoint]
    pub fn handle_fork(ctx: TracePointContext) -> u32 {
        match try_handle_fork(&ctx) {
            Ok(ret) => ret,
            Err(ret) => ret,
        }
    }

    #[tracepoint]
    pub fn handle_exit_group(ctx: TracePointContext) -> u32 {
        match try_handle_exit_group(&ctx) {
            Ok(ret) => ret,
            Err(ret) => ret,
        }
    }

    fn try_handle_fork(ctx: &TracePointContext) -> Result<u32, u32> {
        // Runs in the parent, so the current tgid is the new task's parent.
        let parent = ctx.tgid();
        let child = unsafe { ctx.read_at::<i32>(FORK_CHILD_PID_OFFSET) }.map_err(|_| 0u32)? as u32;
        let _ = PARENTS.insert(&child, &parent, 0);
        Ok(0)
    }

    fn try_handle_exit_group(ctx: &TracePointContext) -> Result<u32, u32> {
        let code = unsafe { ctx.read_at::<i64>(EXIT_GROUP_CODE_OFFSET) }.map_err(|_| 0u32)?;
        // Same truncation the kernel applies to the wait status.
        let status = (code & 0xff) as u32;
        let _ = EXIT_CODES.insert(&ctx.tgid(), &status, 0);
        Ok(0)
    }

    fn parent_of(tgid: u32) -> u32 {
        unsafe { PARENTS.get(&tgid) }.copied().unwrap_or(0)
    }

    fn try_handle_exec(ctx: &TracePointContext) -> Result<u32, u32> {
        let tgid = ctx.tgid();
        let started = unsafe { bpf_ktime_get_ns() };
        let _ = EXEC_START.insert(&tgid, &started, 0);

        let Some(mut entry) = EVENTS.reserve::<RawEvent>(0) else {
            return Ok(0);
        };
        let event = entry.write(RawEvent::zeroed());
        event.pid = tgid;
        event.ppid = parent_of(tgid);
        event.comm = bpf_get_current_comm().unwrap_or_default();

        let data_loc: u32 = match unsafe { ctx.read_at::<u32>(EXEC_FILENAME_LOC_OFFSET) } {
            Ok(loc) => loc,
            Err(_) => {
                entry.discard(0);
                return Ok(0);
            }
        };
        let filename_offset = (data_loc & 0xFFFF) as usize;
        let src = unsafe { (ctx.as_ptr() as *const u8).add(filename_offset) };
        let _ = unsafe { bpf_probe_read_kernel_str_bytes(src, &mut event.filename) };

        entry.submit(0);
        Ok(0)
    }

    fn try_handle_exit(ctx: &TracePointContext) -> Result<u32, u32> {
        let pid = ctx.pid();
        let tgid = ctx.tgid();

        // Only the thread group leader ends the process.
        if pid != tgid {
            let _ = PARENTS.remove(&pid);
            return Ok(0);
        }

        let duration_ns = match unsafe { EXEC_START.get(&tgid) } {
            Some(started) => unsafe { bpf_ktime_get_ns() }.saturating_sub(*started),
            None => 0,
        };
        let _ = EXEC_START.remove(&tgid);
        let ppid = parent_of(tgid);
        let _ = PARENTS.remove(&tgid);
        let exit_code = unsafe { EXIT_CODES.get(&tgid) }.copied().unwrap_or(0);
        let _ = EXIT_CODES.remove(&tgid);

        let Some(mut entry) = EVENTS.reserve::<RawEvent>(0) else {
            return Ok(0);
        };
        let event = entry.write(RawEvent::zeroed());
        event.pid = tgid;
        event.ppid = ppid;
        event.exit_code = exit_code;
        event.duration_ns = duration_ns;
        event.comm = bpf_get_current_comm().unwrap_or_default();
        event.exit_event = true;

        entry.submit(0);
        Ok(0)
    }

    #[cfg(not(test))]
    #[panic_handler]
    fn panic(_info: &core::panic::PanicInfo) -> ! {
        loop {}
    }
}

// Host builds without the feature still need a main.
#[cfg(not(feature = "build-ebpf"))]
fn main() {
    eprintln!("procevents-ebpf built without 'build-ebpf' feature; skipping eBPF program");
}
