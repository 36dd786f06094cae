//! Remote stack unwinding against a peer sandboxee's memory.
//!
//! Runs inside the nested unwind sandbox (see [`crate::stack_trace`]): walks
//! the target's frame-pointer chain with `process_vm_readv` and symbolizes
//! return addresses against the mounted copy of `/proc/<pid>/maps`.

use crate::comms::Comms;
use crate::regs::Regs;
use crate::{Result, WardenError};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

/// Frame cap when the caller does not specify one.
pub const DEFAULT_MAX_FRAMES: u32 = 200;

/// Request shipped into the unwind sandbox.
#[derive(Debug, Serialize, Deserialize)]
pub struct UnwindSetup {
    pub pid: u32,
    /// Raw register block from [`Regs::raw_bytes`].
    pub regs: Vec<u8>,
    pub default_max_frames: u32,
}

/// Response from the unwind sandbox.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct UnwindResult {
    pub stacktrace: Vec<String>,
}

/// One mapped region parsed from a maps file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Mapping {
    start: u64,
    end: u64,
    file_offset: u64,
    path: String,
}

fn parse_maps(contents: &str) -> Vec<Mapping> {
    let mut out = Vec::new();
    for line in contents.lines() {
        let mut fields = line.split_whitespace();
        let Some(range) = fields.next() else { continue };
        let Some((start, end)) = range.split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(end)) =
            (u64::from_str_radix(start, 16), u64::from_str_radix(end, 16))
        else {
            continue;
        };
        let _perms = fields.next();
        let file_offset = fields
            .next()
            .and_then(|o| u64::from_str_radix(o, 16).ok())
            .unwrap_or(0);
        let _dev = fields.next();
        let _inode = fields.next();
        let path = fields.collect::<Vec<_>>().join(" ");
        out.push(Mapping {
            start,
            end,
            file_offset,
            path,
        });
    }
    out
}

fn symbolize(mappings: &[Mapping], addr: u64) -> String {
    let Some(mapping) = mappings.iter().find(|m| m.start <= addr && addr < m.end) else {
        return format!("({addr:#x})");
    };
    if mapping.path.is_empty() {
        return format!("(anonymous+{:#x})", addr - mapping.start);
    }
    let module = mapping
        .path
        .rsplit('/')
        .next()
        .unwrap_or(mapping.path.as_str());
    format!(
        "{module}+{:#x}({addr:#x})",
        addr - mapping.start + mapping.file_offset
    )
}

/// Reads two words at `addr` in the target: the saved frame pointer and the
/// return address.
fn read_frame_record(pid: Pid, addr: u64) -> Result<(u64, u64)> {
    let mut record = [0u64; 2];
    let local = libc::iovec {
        iov_base: record.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: std::mem::size_of_val(&record),
    };
    let remote = libc::iovec {
        iov_base: addr as *mut libc::c_void,
        iov_len: std::mem::size_of_val(&record),
    };
    // SAFETY: local iovec points at live storage; the kernel validates the
    // remote range.
    let read = unsafe { libc::process_vm_readv(pid.as_raw(), &local, 1, &remote, 1, 0) };
    if read != std::mem::size_of_val(&record) as isize {
        return Err(WardenError::StackTrace(format!(
            "unreadable frame record at {addr:#x}"
        )));
    }
    Ok((record[0], record[1]))
}

/// Walks the frame-pointer chain of a stopped target.
///
/// Frames in code compiled without frame pointers terminate the walk early;
/// the trace is best-effort by design.
pub fn unwind_remote(
    pid: Pid,
    regs: &Regs,
    maps_contents: &str,
    max_frames: u32,
) -> Result<Vec<String>> {
    let mappings = parse_maps(maps_contents);
    if mappings.is_empty() {
        return Err(WardenError::StackTrace("no usable memory mappings".into()));
    }
    let mut frames = vec![symbolize(&mappings, regs.instruction_pointer())];
    let mut fp = regs.frame_pointer();
    while frames.len() < max_frames as usize {
        if fp == 0 || fp % 8 != 0 {
            break;
        }
        let Ok((next_fp, ret_addr)) = read_frame_record(pid, fp) else {
            break;
        };
        if ret_addr == 0 {
            break;
        }
        frames.push(symbolize(&mappings, ret_addr));
        if next_fp <= fp {
            break;
        }
        fp = next_fp;
    }
    Ok(frames)
}

/// Runs in the unwind sandbox: answers exactly one request, then returns.
pub(crate) fn serve_unwind_request(comms: &Comms) -> Result<()> {
    let setup: UnwindSetup = comms.recv_msg()?;
    let pid = Pid::from_raw(setup.pid as i32);
    let outcome = Regs::from_raw_bytes(pid, &setup.regs).and_then(|regs| {
        let maps = std::fs::read_to_string(format!("/proc/{pid}/maps"))?;
        unwind_remote(pid, &regs, &maps, setup.default_max_frames)
    });
    match outcome {
        Ok(stacktrace) => {
            comms.send_bool(true)?;
            comms.send_msg(&UnwindResult { stacktrace })?;
        }
        Err(e) => {
            comms.send_bool(false)?;
            comms.send_string(&e.to_string())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d000000000-55d000010000 r-xp 00002000 fd:01 123 /usr/bin/target
55d000010000-55d000020000 rw-p 00000000 00:00 0
7f0000000000-7f0000100000 r-xp 00000000 fd:01 456 /usr/lib/libc.so.6
";

    #[test]
    fn parses_maps_lines() {
        let mappings = parse_maps(MAPS);
        assert_eq!(mappings.len(), 3);
        assert_eq!(mappings[0].path, "/usr/bin/target");
        assert_eq!(mappings[0].file_offset, 0x2000);
        assert!(mappings[1].path.is_empty());
    }

    #[test]
    fn symbolizes_with_module_and_offset() {
        let mappings = parse_maps(MAPS);
        let frame = symbolize(&mappings, 0x55d0_0000_1234);
        assert_eq!(frame, "target+0x3234(0x55d000001234)");
        let anon = symbolize(&mappings, 0x55d0_0001_0008);
        assert!(anon.starts_with("(anonymous+0x8"));
        let unknown = symbolize(&mappings, 0x1000);
        assert_eq!(unknown, "(0x1000)");
    }

    #[test]
    fn unwind_messages_round_trip() {
        let setup = UnwindSetup {
            pid: 42,
            regs: vec![1, 2, 3],
            default_max_frames: DEFAULT_MAX_FRAMES,
        };
        let bytes = rmp_serde::to_vec(&setup).unwrap();
        let back: UnwindSetup = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back.pid, 42);
        assert_eq!(back.default_max_frames, DEFAULT_MAX_FRAMES);
    }
}
