//! Opcode tables for the one- and two-byte x86 opcode maps.
//!
//! Each byte value maps to the operand shape that follows the opcode. Group
//! opcodes defer to a second table keyed by the ModRM `reg` field.

/// Operand layout that follows an opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Nothing follows
    None,
    /// 8-bit immediate
    Ib,
    /// 16-bit immediate
    Iw,
    /// 16- or 32-bit immediate, by operand size
    Iz,
    /// 8-bit relative branch
    Jb,
    /// 16- or 32-bit relative branch, by operand size
    Jz,
    /// ModRM operand
    E,
    /// ModRM operand, register form only (mod bits ignored)
    R,
    /// ModRM operand then an 8-bit immediate
    EIb,
    /// ModRM operand then a 16- or 32-bit immediate
    EIz,
    /// ModRM operand that has to address memory
    EMem,
    /// Absolute memory offset sized by address size
    Moffs,
    /// Far pointer: offset sized by operand size, then a 16-bit selector
    Ap,
    /// 16-bit immediate then 8-bit immediate (`enter`)
    IwIb,
    /// Group opcode, index into [`GROUPS`]
    Group(u8),
    /// `0F 38` map: one more opcode byte, then ModRM
    ThreeByte,
    /// `0F 3A` map: one more opcode byte, ModRM, then an 8-bit immediate
    ThreeByteIb,
    /// Legacy prefix byte
    Prefix,
    /// `0F` escape into the two-byte map
    Escape,
    /// Unassigned slot
    Invalid,
}

use Shape::*;

pub const GRP1A: u8 = 0;
pub const GRP11_B: u8 = 1;
pub const GRP11_Z: u8 = 2;
pub const GRP3_B: u8 = 3;
pub const GRP3_Z: u8 = 4;
pub const GRP4: u8 = 5;
pub const GRP5: u8 = 6;
pub const GRP6: u8 = 7;
pub const GRP8: u8 = 8;
pub const GRP9: u8 = 9;

/// Group extension tables, indexed by ModRM `reg`.
pub const GROUPS: [[Shape; 8]; 10] = [
    // GRP1A (8F): pop r/m
    [E, Invalid, Invalid, Invalid, Invalid, Invalid, Invalid, Invalid],
    // GRP11 (C6): mov r/m8, imm8
    [EIb, Invalid, Invalid, Invalid, Invalid, Invalid, Invalid, Invalid],
    // GRP11 (C7): mov r/m, imm
    [EIz, Invalid, Invalid, Invalid, Invalid, Invalid, Invalid, Invalid],
    // GRP3 (F6): test imm8, test imm8, not, neg, mul, imul, div, idiv
    [EIb, EIb, E, E, E, E, E, E],
    // GRP3 (F7)
    [EIz, EIz, E, E, E, E, E, E],
    // GRP4 (FE): inc, dec
    [E, E, Invalid, Invalid, Invalid, Invalid, Invalid, Invalid],
    // GRP5 (FF): inc, dec, call, call far, jmp, jmp far, push
    [E, E, E, EMem, E, EMem, E, Invalid],
    // GRP6 (0F 00): sldt, str, lldt, ltr, verr, verw
    [E, E, E, E, E, E, Invalid, Invalid],
    // GRP8 (0F BA): bt, bts, btr, btc
    [Invalid, Invalid, Invalid, Invalid, EIb, EIb, EIb, EIb],
    // GRP9 (0F C7): cmpxchg8b, rdrand, rdseed
    [Invalid, EMem, Invalid, Invalid, Invalid, Invalid, E, E],
];

/// One-byte opcode map.
pub const ONE_BYTE: [Shape; 256] = [
    // 0x00: add, push/pop es, or, push cs, escape
    E, E, E, E, Ib, Iz, None, None, E, E, E, E, Ib, Iz, None, Escape,
    // 0x10: adc, sbb
    E, E, E, E, Ib, Iz, None, None, E, E, E, E, Ib, Iz, None, None,
    // 0x20: and, es:, daa, sub, cs:, das
    E, E, E, E, Ib, Iz, Prefix, None, E, E, E, E, Ib, Iz, Prefix, None,
    // 0x30: xor, ss:, aaa, cmp, ds:, aas
    E, E, E, E, Ib, Iz, Prefix, None, E, E, E, E, Ib, Iz, Prefix, None,
    // 0x40: inc/dec reg
    None, None, None, None, None, None, None, None,
    None, None, None, None, None, None, None, None,
    // 0x50: push/pop reg
    None, None, None, None, None, None, None, None,
    None, None, None, None, None, None, None, None,
    // 0x60: pusha, popa, bound, arpl, fs:, gs:, opsize, addrsize, push, imul, push, imul, ins/outs
    None, None, EMem, E, Prefix, Prefix, Prefix, Prefix,
    Iz, EIz, Ib, EIb, None, None, None, None,
    // 0x70: jcc rel8
    Jb, Jb, Jb, Jb, Jb, Jb, Jb, Jb, Jb, Jb, Jb, Jb, Jb, Jb, Jb, Jb,
    // 0x80: group 1, test, xchg, mov, mov sreg, lea, mov sreg, pop
    EIb, EIz, EIb, EIb, E, E, E, E, E, E, E, E, E, EMem, E, Group(GRP1A),
    // 0x90: xchg, cbw, cwd, call far, wait, pushf, popf, sahf, lahf
    None, None, None, None, None, None, None, None,
    None, None, Ap, None, None, None, None, None,
    // 0xA0: mov moffs, string ops, test
    Moffs, Moffs, Moffs, Moffs, None, None, None, None,
    Ib, Iz, None, None, None, None, None, None,
    // 0xB0: mov reg, imm
    Ib, Ib, Ib, Ib, Ib, Ib, Ib, Ib, Iz, Iz, Iz, Iz, Iz, Iz, Iz, Iz,
    // 0xC0: shifts, ret imm, ret, les, lds, mov, enter, leave, retf, int3, int, into, iret
    EIb, EIb, Iw, None, EMem, EMem, Group(GRP11_B), Group(GRP11_Z),
    IwIb, None, Iw, None, None, Ib, None, None,
    // 0xD0: shifts, aam, aad, salc, xlat, x87 escapes
    E, E, E, E, Ib, Ib, None, None, E, E, E, E, E, E, E, E,
    // 0xE0: loop, jcxz, in/out, call, jmp, jmp far, jmp short, in/out dx
    Jb, Jb, Jb, Jb, Ib, Ib, Ib, Ib, Jz, Jz, Ap, Jb, None, None, None, None,
    // 0xF0: lock, int1, repne, rep, hlt, cmc, group 3, flag ops, group 4, group 5
    Prefix, None, Prefix, Prefix, None, None, Group(GRP3_B), Group(GRP3_Z),
    None, None, None, None, None, None, Group(GRP4), Group(GRP5),
];

/// Two-byte opcode map (`0F xx`).
pub const TWO_BYTE: [Shape; 256] = [
    // 0x00: group 6, group 7, lar, lsl, syscall, clts, sysret, invd, wbinvd, ud2, prefetch, femms
    Group(GRP6), E, E, E, Invalid, None, None, None,
    None, None, Invalid, None, Invalid, E, None, Invalid,
    // 0x10: sse moves, prefetch hints, multi-byte nop
    E, E, E, E, E, E, E, E, E, E, E, E, E, E, E, E,
    // 0x20: mov cr/dr, sse
    R, R, R, R, Invalid, Invalid, Invalid, Invalid, E, E, E, E, E, E, E, E,
    // 0x30: wrmsr, rdtsc, rdmsr, rdpmc, sysenter, sysexit, getsec, 38/3A escapes
    None, None, None, None, None, None, Invalid, None,
    ThreeByte, Invalid, ThreeByteIb, Invalid, Invalid, Invalid, Invalid, Invalid,
    // 0x40: cmovcc
    E, E, E, E, E, E, E, E, E, E, E, E, E, E, E, E,
    // 0x50: sse
    E, E, E, E, E, E, E, E, E, E, E, E, E, E, E, E,
    // 0x60: mmx/sse
    E, E, E, E, E, E, E, E, E, E, E, E, E, E, E, E,
    // 0x70: pshuf, shift groups, pcmpeq, emms, vmread, vmwrite, movd/movq
    EIb, EIb, EIb, EIb, E, E, E, None, E, E, Invalid, Invalid, E, E, E, E,
    // 0x80: jcc rel16/32
    Jz, Jz, Jz, Jz, Jz, Jz, Jz, Jz, Jz, Jz, Jz, Jz, Jz, Jz, Jz, Jz,
    // 0x90: setcc
    E, E, E, E, E, E, E, E, E, E, E, E, E, E, E, E,
    // 0xA0: push/pop fs, cpuid, bt, shld, push/pop gs, rsm, bts, shrd, group 15, imul
    None, None, None, E, EIb, E, Invalid, Invalid,
    None, None, None, E, EIb, E, E, E,
    // 0xB0: cmpxchg, lss, btr, lfs, lgs, movzx, popcnt, ud1, group 8, btc, bsf, bsr, movsx
    E, E, E, E, E, E, E, E, E, E, Group(GRP8), E, E, E, E, E,
    // 0xC0: xadd, cmpps, movnti, pinsrw, pextrw, shufps, group 9, bswap
    E, E, EIb, E, EIb, EIb, EIb, Group(GRP9),
    None, None, None, None, None, None, None, None,
    // 0xD0: mmx/sse
    E, E, E, E, E, E, E, E, E, E, E, E, E, E, E, E,
    // 0xE0: mmx/sse
    E, E, E, E, E, E, E, E, E, E, E, E, E, E, E, E,
    // 0xF0: mmx/sse, ud0
    E, E, E, E, E, E, E, E, E, E, E, E, E, E, E, E,
];

/// Whether a one-byte opcode is a legacy prefix.
pub fn is_prefix(byte: u8) -> bool {
    ONE_BYTE[byte as usize] == Prefix
}

/// One-byte opcodes whose 8-bit immediate is sign-extended to operand size.
pub fn sign_extends_imm8(opcode: u8) -> bool {
    matches!(opcode, 0x6a | 0x6b | 0x83)
}
