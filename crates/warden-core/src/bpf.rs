//! Hand-assembled seccomp BPF: instruction helpers, a label-based jump
//! language with a fix-up pass, and a small interpreter used to re-evaluate
//! a policy against `seccomp_data` in user space.
//!
//! Instruction encoding follows `linux/filter.h`; the two-instruction
//! conditional forms mirror the classic seccomp helper macros.

use crate::{Result, WardenError};
pub use seccompiler::{BpfProgram, sock_filter};

/// Maximum instruction count the kernel accepts for one filter.
pub const BPF_MAXINSNS: usize = 4096;

/// Seccomp return action for user-space notification; not exported by libc.
pub const SECCOMP_RET_USER_NOTIF: u32 = 0x7fc0_0000;

/// Sentinel jt/jf marking an unresolved jump to a label.
const JUMP_SENTINEL: u8 = 0xff;
/// Sentinel jt/jf marking a label definition.
const LABEL_SENTINEL: u8 = 0xfe;

const SIZE_OF_SECCOMP_DATA: usize = 64;
const OFF_NR: u32 = 0;
const OFF_ARCH: u32 = 4;
const OFF_ARGS: u32 = 16;

#[must_use]
pub const fn stmt(code: u16, k: u32) -> sock_filter {
    sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

#[must_use]
pub const fn jump_insn(code: u16, k: u32, jt: u8, jf: u8) -> sock_filter {
    sock_filter { code, jt, jf, k }
}

const CODE_LD_ABS: u16 = (libc::BPF_LD | libc::BPF_W | libc::BPF_ABS) as u16;
const CODE_LD_MEM: u16 = (libc::BPF_LD | libc::BPF_MEM) as u16;
const CODE_ST: u16 = libc::BPF_ST as u16;
const CODE_ALU_AND: u16 = (libc::BPF_ALU | libc::BPF_AND | libc::BPF_K) as u16;
const CODE_JA: u16 = (libc::BPF_JMP | libc::BPF_JA) as u16;
const CODE_JEQ: u16 = (libc::BPF_JMP | libc::BPF_JEQ | libc::BPF_K) as u16;
const CODE_JGT: u16 = (libc::BPF_JMP | libc::BPF_JGT | libc::BPF_K) as u16;
const CODE_JGE: u16 = (libc::BPF_JMP | libc::BPF_JGE | libc::BPF_K) as u16;
const CODE_JSET: u16 = (libc::BPF_JMP | libc::BPF_JSET | libc::BPF_K) as u16;
const CODE_RET: u16 = (libc::BPF_RET | libc::BPF_K) as u16;

/// Loads the audit architecture word into the accumulator.
#[must_use]
pub const fn load_arch() -> sock_filter {
    stmt(CODE_LD_ABS, OFF_ARCH)
}

/// Loads the syscall number into the accumulator.
#[must_use]
pub const fn load_syscall_nr() -> sock_filter {
    stmt(CODE_LD_ABS, OFF_NR)
}

/// Loads the low 32 bits of syscall argument `idx` into the accumulator.
#[must_use]
pub const fn arg32(idx: u32) -> sock_filter {
    stmt(CODE_LD_ABS, OFF_ARGS + idx * 8)
}

/// Masks the accumulator with a constant.
#[must_use]
pub const fn and32(mask: u32) -> sock_filter {
    stmt(CODE_ALU_AND, mask)
}

#[must_use]
pub const fn allow() -> sock_filter {
    stmt(CODE_RET, libc::SECCOMP_RET_ALLOW)
}

#[must_use]
pub const fn kill() -> sock_filter {
    stmt(CODE_RET, libc::SECCOMP_RET_KILL_THREAD)
}

#[must_use]
pub const fn errno(err: u16) -> sock_filter {
    stmt(CODE_RET, libc::SECCOMP_RET_ERRNO | err as u32)
}

#[must_use]
pub const fn trace(data: u16) -> sock_filter {
    stmt(CODE_RET, libc::SECCOMP_RET_TRACE | data as u32)
}

#[must_use]
pub const fn user_notif() -> sock_filter {
    stmt(CODE_RET, SECCOMP_RET_USER_NOTIF)
}

/// True for `RET KILL` statements, the actions the unotify backend rewrites.
#[must_use]
pub fn is_kill(insn: &sock_filter) -> bool {
    insn.code == CODE_RET && insn.k == libc::SECCOMP_RET_KILL_THREAD
}

/// True for `RET TRACE(data)` statements carrying the given data value.
#[must_use]
pub fn is_trace(insn: &sock_filter, data: u16) -> bool {
    insn.code == CODE_RET && insn.k == (libc::SECCOMP_RET_TRACE | u32::from(data))
}

/// `if A == value: action` — two instructions, falls through otherwise.
#[must_use]
pub const fn jeq32(value: u32, action: sock_filter) -> [sock_filter; 2] {
    [jump_insn(CODE_JEQ, value, 0, 1), action]
}

/// `if A != value: action`.
#[must_use]
pub const fn jne32(value: u32, action: sock_filter) -> [sock_filter; 2] {
    [jump_insn(CODE_JEQ, value, 1, 0), action]
}

/// `if A & value: action`.
#[must_use]
pub const fn ja32(value: u32, action: sock_filter) -> [sock_filter; 2] {
    [jump_insn(CODE_JSET, value, 0, 1), action]
}

/// `if A >= value: action`.
#[must_use]
pub const fn jge32(value: u32, action: sock_filter) -> [sock_filter; 2] {
    [jump_insn(CODE_JGE, value, 0, 1), action]
}

/// `if A > value: action`.
#[must_use]
pub const fn jgt32(value: u32, action: sock_filter) -> [sock_filter; 2] {
    [jump_insn(CODE_JGT, value, 0, 1), action]
}

/// Compares the accumulator against a syscall number; two instructions.
#[must_use]
pub const fn syscall_nr(nr: u32, action: sock_filter) -> [sock_filter; 2] {
    jeq32(nr, action)
}

/// Label book-keeping for one program. Labels are referenced by name while
/// emitting and resolved to relative offsets by [`resolve_jumps`].
#[derive(Debug, Default)]
pub struct BpfLabels {
    names: Vec<String>,
}

impl BpfLabels {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn id_of(&mut self, name: &str) -> u32 {
        if let Some(pos) = self.names.iter().position(|n| n == name) {
            return pos as u32;
        }
        self.names.push(name.to_string());
        (self.names.len() - 1) as u32
    }

    /// An unconditional jump to `name`, resolved later.
    pub fn jump(&mut self, name: &str) -> sock_filter {
        let id = self.id_of(name);
        jump_insn(CODE_JA, id, JUMP_SENTINEL, JUMP_SENTINEL)
    }

    /// Defines `name` at the position this instruction lands in.
    pub fn label(&mut self, name: &str) -> sock_filter {
        let id = self.id_of(name);
        jump_insn(CODE_JA, id, LABEL_SENTINEL, LABEL_SENTINEL)
    }

    fn name(&self, id: u32) -> &str {
        self.names
            .get(id as usize)
            .map_or("<bad label id>", String::as_str)
    }
}

/// Rewrites label jumps into relative offsets, failing on duplicate labels,
/// unresolved labels, and backward jumps. On success the program contains no
/// sentinel-encoded instructions.
pub fn resolve_jumps(labels: &BpfLabels, filter: &mut [sock_filter]) -> Result<()> {
    if filter.is_empty() || filter.len() > BPF_MAXINSNS {
        return Err(WardenError::Bpf(format!(
            "program has {} instructions, must be 1..={BPF_MAXINSNS}",
            filter.len()
        )));
    }

    let mut locations: Vec<Option<usize>> = vec![None; labels.names.len()];
    for (offset, insn) in filter.iter().enumerate() {
        if insn.code == CODE_JA && insn.jt == LABEL_SENTINEL && insn.jf == LABEL_SENTINEL {
            let slot = locations
                .get_mut(insn.k as usize)
                .ok_or_else(|| WardenError::Bpf("label id out of range".into()))?;
            if slot.is_some() {
                return Err(WardenError::Bpf(format!(
                    "duplicate label '{}'",
                    labels.name(insn.k)
                )));
            }
            *slot = Some(offset);
        }
    }

    for offset in 0..filter.len() {
        let insn = &mut filter[offset];
        if insn.code != CODE_JA {
            continue;
        }
        match (insn.jt, insn.jf) {
            (JUMP_SENTINEL, JUMP_SENTINEL) => {
                let target = locations
                    .get(insn.k as usize)
                    .copied()
                    .flatten()
                    .ok_or_else(|| {
                        WardenError::Bpf(format!("unresolved label '{}'", labels.name(insn.k)))
                    })?;
                if target <= offset {
                    return Err(WardenError::Bpf(format!(
                        "backward jump to label '{}'",
                        labels.name(insn.k)
                    )));
                }
                insn.k = (target - offset - 1) as u32;
                insn.jt = 0;
                insn.jf = 0;
            }
            (LABEL_SENTINEL, LABEL_SENTINEL) => {
                // Labels fall through.
                insn.k = 0;
                insn.jt = 0;
                insn.jf = 0;
            }
            _ => {}
        }
    }
    Ok(())
}

/// True if any instruction still carries a sentinel label encoding.
#[must_use]
pub fn has_unresolved_jumps(filter: &[sock_filter]) -> bool {
    filter.iter().any(|insn| {
        insn.code == CODE_JA
            && (insn.jt == JUMP_SENTINEL || insn.jt == LABEL_SENTINEL)
            && insn.jt == insn.jf
    })
}

fn seccomp_data_bytes(data: &libc::seccomp_data) -> [u8; SIZE_OF_SECCOMP_DATA] {
    let mut out = [0u8; SIZE_OF_SECCOMP_DATA];
    out[0..4].copy_from_slice(&data.nr.to_ne_bytes());
    out[4..8].copy_from_slice(&data.arch.to_ne_bytes());
    out[8..16].copy_from_slice(&data.instruction_pointer.to_ne_bytes());
    for (i, arg) in data.args.iter().enumerate() {
        out[16 + i * 8..24 + i * 8].copy_from_slice(&arg.to_ne_bytes());
    }
    out
}

/// Interprets a resolved filter against one `seccomp_data`, returning the
/// raw seccomp action word. Supports exactly the instruction set this module
/// emits.
pub fn evaluate(prog: &[sock_filter], data: &libc::seccomp_data) -> Result<u32> {
    let bytes = seccomp_data_bytes(data);
    let mut acc: u32 = 0;
    let mut mem = [0u32; 16];
    let mut pc = 0usize;
    for _ in 0..=prog.len() {
        let insn = prog
            .get(pc)
            .ok_or_else(|| WardenError::Bpf("program counter out of range".into()))?;
        pc += 1;
        match insn.code {
            CODE_LD_ABS => {
                let off = insn.k as usize;
                if off + 4 > SIZE_OF_SECCOMP_DATA {
                    return Err(WardenError::Bpf("load outside seccomp_data".into()));
                }
                acc = u32::from_ne_bytes(bytes[off..off + 4].try_into().unwrap());
            }
            CODE_LD_MEM => {
                acc = *mem
                    .get(insn.k as usize)
                    .ok_or_else(|| WardenError::Bpf("scratch load out of range".into()))?;
            }
            CODE_ST => {
                *mem.get_mut(insn.k as usize)
                    .ok_or_else(|| WardenError::Bpf("scratch store out of range".into()))? = acc;
            }
            CODE_ALU_AND => acc &= insn.k,
            CODE_JA => pc += insn.k as usize,
            CODE_JEQ | CODE_JGT | CODE_JGE | CODE_JSET => {
                let taken = match insn.code {
                    CODE_JEQ => acc == insn.k,
                    CODE_JGT => acc > insn.k,
                    CODE_JGE => acc >= insn.k,
                    _ => acc & insn.k != 0,
                };
                pc += usize::from(if taken { insn.jt } else { insn.jf });
            }
            CODE_RET => return Ok(insn.k),
            code => {
                return Err(WardenError::Bpf(format!(
                    "unsupported instruction {code:#06x}"
                )));
            }
        }
    }
    Err(WardenError::Bpf("program did not return".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_for(nr: i32, arch: u32, args: [u64; 6]) -> libc::seccomp_data {
        libc::seccomp_data {
            nr,
            arch,
            instruction_pointer: 0,
            args,
        }
    }

    #[test]
    fn resolves_forward_jumps() {
        let mut l = BpfLabels::new();
        let mut prog = vec![l.jump("out"), kill(), l.label("out"), allow()];
        resolve_jumps(&l, &mut prog).unwrap();
        assert!(!has_unresolved_jumps(&prog));
        assert_eq!(prog[0].k, 1);
        let ret = evaluate(&prog, &data_for(0, 0, [0; 6])).unwrap();
        assert_eq!(ret, libc::SECCOMP_RET_ALLOW);
    }

    #[test]
    fn rejects_unresolved_label() {
        let mut l = BpfLabels::new();
        let mut prog = vec![l.jump("nowhere"), allow()];
        assert!(resolve_jumps(&l, &mut prog).is_err());
    }

    #[test]
    fn rejects_duplicate_label() {
        let mut l = BpfLabels::new();
        let mut prog = vec![l.label("x"), l.label("x"), allow()];
        assert!(resolve_jumps(&l, &mut prog).is_err());
    }

    #[test]
    fn rejects_backward_jump() {
        let mut l = BpfLabels::new();
        let mut prog = vec![l.label("back"), allow(), l.jump("back")];
        assert!(resolve_jumps(&l, &mut prog).is_err());
    }

    #[test]
    fn rejects_oversized_program() {
        let l = BpfLabels::new();
        let mut prog = vec![allow(); BPF_MAXINSNS + 1];
        assert!(resolve_jumps(&l, &mut prog).is_err());
    }

    #[test]
    fn evaluates_syscall_match() {
        let mut prog = Vec::new();
        prog.push(load_syscall_nr());
        prog.extend(syscall_nr(42, allow()));
        prog.push(kill());
        assert_eq!(
            evaluate(&prog, &data_for(42, 0, [0; 6])).unwrap(),
            libc::SECCOMP_RET_ALLOW
        );
        assert_eq!(
            evaluate(&prog, &data_for(41, 0, [0; 6])).unwrap(),
            libc::SECCOMP_RET_KILL_THREAD
        );
    }

    #[test]
    fn evaluates_argument_checks() {
        // Allow only when arg2 has the 0x4 bit set.
        let mut prog = Vec::new();
        prog.push(arg32(2));
        prog.extend(ja32(0x4, allow()));
        prog.push(errno(libc::EPERM as u16));
        let mut args = [0u64; 6];
        args[2] = 0x6;
        assert_eq!(
            evaluate(&prog, &data_for(0, 0, args)).unwrap(),
            libc::SECCOMP_RET_ALLOW
        );
        args[2] = 0x2;
        assert_eq!(
            evaluate(&prog, &data_for(0, 0, args)).unwrap(),
            libc::SECCOMP_RET_ERRNO | u32::from(libc::EPERM as u16)
        );
    }

    #[test]
    fn futex_op_mask_evaluates() {
        // The same shape AllowFutexOp emits: mask the op then compare.
        let mut prog = Vec::new();
        prog.push(arg32(1));
        prog.push(and32(libc::FUTEX_CMD_MASK as u32));
        prog.extend(jeq32(libc::FUTEX_WAKE as u32, allow()));
        prog.push(kill());
        let mut args = [0u64; 6];
        args[1] = (libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG) as u64;
        assert_eq!(
            evaluate(&prog, &data_for(0, 0, args)).unwrap(),
            libc::SECCOMP_RET_ALLOW
        );
    }
}
