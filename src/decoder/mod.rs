//! Table-driven x86 instruction decoder (16/32-bit, legacy prefixes).
//!
//! The decoder is pure: it reads from a bounded byte window and returns a
//! structured instruction record. It never touches the classification map,
//! which is what lets the driver use it for speculative probes.

mod tables;

use std::fmt;
use std::ops::Range;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::image::ByteStore;
use crate::{Address, MAX_INSTRUCTION_SIZE};
use self::tables::{Shape, GROUPS, ONE_BYTE, TWO_BYTE};

/// Default operand and address size of the code being decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CpuMode {
    /// 16-bit code
    Bits16,
    /// 32-bit protected-mode code
    #[default]
    Bits32,
}

impl fmt::Display for CpuMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuMode::Bits16 => write!(f, "16-bit"),
            CpuMode::Bits32 => write!(f, "32-bit"),
        }
    }
}

/// Which opcode map an instruction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpcodeMap {
    OneByte,
    /// `0F xx`
    TwoByte,
    /// `0F 38 xx`
    ThreeByte38,
    /// `0F 3A xx`
    ThreeByte3A,
}

impl fmt::Display for OpcodeMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpcodeMap::OneByte => write!(f, "primary"),
            OpcodeMap::TwoByte => write!(f, "0f"),
            OpcodeMap::ThreeByte38 => write!(f, "0f38"),
            OpcodeMap::ThreeByte3A => write!(f, "0f3a"),
        }
    }
}

/// Why a byte sequence is not an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum DecodeFailure {
    #[error("instruction runs past the end of the code region")]
    EndOfRegion,
    #[error("opcode {opcode:#04x} is unassigned in the {map} map")]
    UnassignedOpcode { map: OpcodeMap, opcode: u8 },
    #[error("group opcode {opcode:#04x} has no member /{reg}")]
    UndefinedGroupMember { opcode: u8, reg: u8 },
    #[error("opcode {opcode:#04x} requires a memory operand")]
    RegisterFormNotAllowed { opcode: u8 },
    #[error("instruction exceeds {} bytes", MAX_INSTRUCTION_SIZE)]
    TooLong,
}

/// Decoded ModRM byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModRm {
    pub mode: u8,
    pub reg: u8,
    pub rm: u8,
}

impl ModRm {
    pub fn from_byte(b: u8) -> Self {
        Self {
            mode: b >> 6,
            reg: (b >> 3) & 7,
            rm: b & 7,
        }
    }

    pub fn is_register(&self) -> bool {
        self.mode == 3
    }
}

/// Decoded SIB byte. `scale` is the multiplier (1, 2, 4 or 8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sib {
    pub scale: u8,
    pub index: u8,
    pub base: u8,
}

impl Sib {
    pub fn from_byte(b: u8) -> Self {
        Self {
            scale: 1 << (b >> 6),
            index: (b >> 3) & 7,
            base: b & 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressSize {
    Bits16,
    Bits32,
}

/// Memory operand `[base + index * scale + displacement]`.
///
/// Registers use the hardware numbering (0 = eax ... 7 = edi). 16-bit forms
/// are expressed the same way, e.g. `[bx+si]` is base 3, index 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EffectiveAddress {
    pub base: Option<u8>,
    pub index: Option<u8>,
    pub scale: u8,
    pub displacement: i32,
    pub address_size: AddressSize,
}

impl EffectiveAddress {
    fn absolute_at(displacement: i32, address_size: AddressSize) -> Self {
        Self {
            base: None,
            index: None,
            scale: 1,
            displacement,
            address_size,
        }
    }

    /// The address itself when the expression has no registers.
    pub fn absolute(&self) -> Option<Address> {
        if self.base.is_some() || self.index.is_some() {
            return None;
        }
        Some(match self.address_size {
            AddressSize::Bits16 => self.displacement as u16 as Address,
            AddressSize::Bits32 => self.displacement as Address,
        })
    }
}

/// An immediate operand. `value` is already extended to 32 bits: sign
/// extension for relative branches and the sign-extending 8-bit ALU forms,
/// zero extension otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Immediate {
    pub value: u32,
    /// Encoded size in bytes
    pub size: u8,
}

/// How an instruction affects control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    Sequential,
    Call,
    CallIndirect,
    Jump,
    JumpIndirect,
    ConditionalJump,
    Return,
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedInstruction {
    pub address: Address,
    pub opcode_map: OpcodeMap,
    /// Last opcode byte
    pub opcode: u8,
    /// Legacy prefixes in encoding order
    pub prefixes: Vec<u8>,
    pub operand_size_override: bool,
    pub addr_size_override: bool,
    pub modrm: Option<ModRm>,
    pub sib: Option<Sib>,
    pub memory: Option<EffectiveAddress>,
    pub immediate: Option<Immediate>,
    /// Selector of a far pointer, or the nesting level of `enter`
    pub extra_immediate: Option<Immediate>,
    pub length: u8,
    /// Resolved absolute target or memory address inside the image
    pub computed_reference: Option<Address>,
    pub flow: FlowKind,
}

impl DecodedInstruction {
    /// Address one past the last byte
    pub fn end(&self) -> Address {
        self.address.wrapping_add(self.length as Address)
    }

    /// Returns, unconditional jumps; execution never falls through.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self.flow,
            FlowKind::Return | FlowKind::Jump | FlowKind::JumpIndirect
        )
    }

    /// Target of a direct call or jump
    pub fn branch_target(&self) -> Option<Address> {
        match self.flow {
            FlowKind::Call | FlowKind::Jump | FlowKind::ConditionalJump => self.computed_reference,
            _ => None,
        }
    }

    /// In-image address of an absolute memory operand
    pub fn memory_reference(&self) -> Option<Address> {
        self.memory
            .and_then(|m| m.absolute())
            .and(self.computed_reference)
    }

    /// Base of the table for `jmp [disp32 + index*4]`
    pub fn jump_table_base(&self) -> Option<Address> {
        let mem = self.memory?;
        if self.flow != FlowKind::JumpIndirect || mem.address_size != AddressSize::Bits32 {
            return None;
        }
        match (mem.base, mem.index, mem.scale) {
            (None, Some(_), 4) => Some(mem.displacement as Address),
            _ => None,
        }
    }

    /// 32-bit immediate loaded or pushed as a value (`push imm32`,
    /// `mov r32, imm32`, `mov r/m32, imm32`).
    pub fn immediate_value32(&self) -> Option<u32> {
        if self.opcode_map != OpcodeMap::OneByte {
            return None;
        }
        let imm = self.immediate?;
        match self.opcode {
            0x68 | 0xb8..=0xbf | 0xc7 if imm.size == 4 => Some(imm.value),
            _ => None,
        }
    }
}

/// Decoder trait: turns the bytes at a cursor into one instruction.
pub trait Decoder: Send + Sync {
    /// Decode one instruction from the start of `bytes`, which sits at
    /// address `at`. `bytes` ends where the code region ends.
    fn decode(&self, bytes: &[u8], at: Address) -> Result<DecodedInstruction, DecodeFailure>;
}

/// Per-instruction cursor and prefix state.
struct DecodeState<'b> {
    bytes: &'b [u8],
    pos: usize,
    prefixes: Vec<u8>,
    operand_override: bool,
    address_override: bool,
}

impl<'b> DecodeState<'b> {
    fn new(bytes: &'b [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            prefixes: Vec::new(),
            operand_override: false,
            address_override: false,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'b [u8], DecodeFailure> {
        let end = self.pos + n;
        if end > MAX_INSTRUCTION_SIZE {
            return Err(DecodeFailure::TooLong);
        }
        let bytes = self.bytes.get(self.pos..end).ok_or(DecodeFailure::EndOfRegion)?;
        self.pos = end;
        Ok(bytes)
    }

    fn peek(&self) -> Result<u8, DecodeFailure> {
        if self.pos >= MAX_INSTRUCTION_SIZE {
            return Err(DecodeFailure::TooLong);
        }
        self.bytes.get(self.pos).copied().ok_or(DecodeFailure::EndOfRegion)
    }

    fn u8(&mut self) -> Result<u8, DecodeFailure> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeFailure> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeFailure> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn imm8(&mut self, sign_extend: bool) -> Result<Immediate, DecodeFailure> {
        let b = self.u8()?;
        let value = if sign_extend { b as i8 as i32 as u32 } else { b as u32 };
        Ok(Immediate { value, size: 1 })
    }

    fn imm16(&mut self, sign_extend: bool) -> Result<Immediate, DecodeFailure> {
        let w = self.u16()?;
        let value = if sign_extend { w as i16 as i32 as u32 } else { w as u32 };
        Ok(Immediate { value, size: 2 })
    }

    fn imm32(&mut self) -> Result<Immediate, DecodeFailure> {
        Ok(Immediate { value: self.u32()?, size: 4 })
    }
}

/// Table-driven decoder for 16- and 32-bit x86 code.
#[derive(Debug, Clone)]
pub struct X86Decoder {
    mode: CpuMode,
    reference_range: Range<Address>,
}

impl X86Decoder {
    /// `reference_range` bounds which absolute addresses count as references.
    pub fn new(mode: CpuMode, reference_range: Range<Address>) -> Self {
        Self {
            mode,
            reference_range,
        }
    }

    /// Decoder whose references are bounded by the mapped image.
    pub fn for_store(store: &ByteStore<'_>, mode: CpuMode) -> Self {
        Self::new(mode, store.image_range())
    }

    pub fn mode(&self) -> CpuMode {
        self.mode
    }

    fn in_range(&self, addr: Address) -> Option<Address> {
        self.reference_range.contains(&addr).then_some(addr)
    }

    fn operand_16(&self, st: &DecodeState<'_>) -> bool {
        (self.mode == CpuMode::Bits16) != st.operand_override
    }

    fn address_size(&self, st: &DecodeState<'_>) -> AddressSize {
        if (self.mode == CpuMode::Bits16) != st.address_override {
            AddressSize::Bits16
        } else {
            AddressSize::Bits32
        }
    }

    fn imm_z(&self, st: &mut DecodeState<'_>, sign_extend: bool) -> Result<Immediate, DecodeFailure> {
        if self.operand_16(st) {
            st.imm16(sign_extend)
        } else {
            st.imm32()
        }
    }

    /// Decode the addressing bytes that follow a ModRM byte.
    fn decode_memory(
        &self,
        st: &mut DecodeState<'_>,
        m: ModRm,
    ) -> Result<(Option<Sib>, Option<EffectiveAddress>), DecodeFailure> {
        if m.is_register() {
            return Ok((None, None));
        }
        match self.address_size(st) {
            AddressSize::Bits16 => {
                let (base, index) = match m.rm {
                    0 => (Some(3), Some(6)),
                    1 => (Some(3), Some(7)),
                    2 => (Some(5), Some(6)),
                    3 => (Some(5), Some(7)),
                    4 => (Some(6), None),
                    5 => (Some(7), None),
                    6 => (Some(5), None),
                    _ => (Some(3), None),
                };
                let ea = match m.mode {
                    0 if m.rm == 6 => {
                        EffectiveAddress::absolute_at(st.u16()? as i16 as i32, AddressSize::Bits16)
                    }
                    mode => {
                        let displacement = match mode {
                            0 => 0,
                            1 => st.u8()? as i8 as i32,
                            _ => st.u16()? as i16 as i32,
                        };
                        EffectiveAddress {
                            base,
                            index,
                            scale: 1,
                            displacement,
                            address_size: AddressSize::Bits16,
                        }
                    }
                };
                Ok((None, Some(ea)))
            }
            AddressSize::Bits32 => {
                let mut sib = None;
                let mut base = Some(m.rm);
                let mut index = None;
                let mut scale = 1;
                if m.rm == 4 {
                    let s = Sib::from_byte(st.u8()?);
                    base = Some(s.base);
                    index = (s.index != 4).then_some(s.index);
                    scale = s.scale;
                    sib = Some(s);
                }
                let displacement = match m.mode {
                    0 if m.rm == 5 => {
                        base = None;
                        st.u32()? as i32
                    }
                    0 if sib.is_some_and(|s| s.base == 5) => {
                        base = None;
                        st.u32()? as i32
                    }
                    0 => 0,
                    1 => st.u8()? as i8 as i32,
                    _ => st.u32()? as i32,
                };
                Ok((
                    sib,
                    Some(EffectiveAddress {
                        base,
                        index,
                        scale,
                        displacement,
                        address_size: AddressSize::Bits32,
                    }),
                ))
            }
        }
    }

    /// Resolve a relative branch against the end of the instruction.
    fn branch_target(&self, next: Address, rel: u32, operand_16: bool) -> Address {
        let target = next.wrapping_add(rel);
        if !operand_16 {
            return target;
        }
        match self.mode {
            // 16-bit operand size in 32-bit code truncates EIP
            CpuMode::Bits32 => target & 0xffff,
            // 16-bit code wraps within its 64 KiB segment
            CpuMode::Bits16 => (next & 0xffff_0000) | (target & 0xffff),
        }
    }
}

fn flow_of(map: OpcodeMap, opcode: u8, modrm: Option<ModRm>) -> FlowKind {
    match map {
        OpcodeMap::OneByte => match opcode {
            0x70..=0x7f | 0xe0..=0xe3 => FlowKind::ConditionalJump,
            0xe8 | 0x9a => FlowKind::Call,
            0xe9 | 0xea | 0xeb => FlowKind::Jump,
            0xc2 | 0xc3 | 0xca | 0xcb | 0xcf => FlowKind::Return,
            0xff => match modrm.map(|m| m.reg) {
                Some(2) | Some(3) => FlowKind::CallIndirect,
                Some(4) | Some(5) => FlowKind::JumpIndirect,
                _ => FlowKind::Sequential,
            },
            _ => FlowKind::Sequential,
        },
        OpcodeMap::TwoByte if (0x80..=0x8f).contains(&opcode) => FlowKind::ConditionalJump,
        _ => FlowKind::Sequential,
    }
}

impl Decoder for X86Decoder {
    fn decode(&self, bytes: &[u8], at: Address) -> Result<DecodedInstruction, DecodeFailure> {
        let mut st = DecodeState::new(bytes);

        // Legacy prefixes
        loop {
            let b = st.peek()?;
            if !tables::is_prefix(b) {
                break;
            }
            st.pos += 1;
            match b {
                0x66 => st.operand_override = true,
                0x67 => st.address_override = true,
                _ => {}
            }
            st.prefixes.push(b);
        }

        // Opcode, through the escape bytes
        let mut map = OpcodeMap::OneByte;
        let mut opcode = st.u8()?;
        let mut shape = ONE_BYTE[opcode as usize];
        if shape == Shape::Escape {
            map = OpcodeMap::TwoByte;
            opcode = st.u8()?;
            shape = TWO_BYTE[opcode as usize];
            match shape {
                Shape::ThreeByte => {
                    map = OpcodeMap::ThreeByte38;
                    opcode = st.u8()?;
                    shape = Shape::E;
                }
                Shape::ThreeByteIb => {
                    map = OpcodeMap::ThreeByte3A;
                    opcode = st.u8()?;
                    shape = Shape::EIb;
                }
                _ => {}
            }
        }

        // Group opcodes select their shape by ModRM.reg
        let mut modrm = None;
        if let Shape::Group(group) = shape {
            let m = ModRm::from_byte(st.u8()?);
            shape = GROUPS[group as usize][m.reg as usize];
            if shape == Shape::Invalid {
                return Err(DecodeFailure::UndefinedGroupMember { opcode, reg: m.reg });
            }
            modrm = Some(m);
        }

        let operand_16 = self.operand_16(&st);
        let mut sib = None;
        let mut memory = None;
        let mut immediate = None;
        let mut extra_immediate = None;
        let mut relative = false;

        match shape {
            Shape::None => {}
            Shape::Ib => {
                let sign_extend = map == OpcodeMap::OneByte && tables::sign_extends_imm8(opcode);
                immediate = Some(st.imm8(sign_extend)?);
            }
            Shape::Iw => immediate = Some(st.imm16(false)?),
            Shape::Iz => immediate = Some(self.imm_z(&mut st, false)?),
            Shape::Jb => {
                immediate = Some(st.imm8(true)?);
                relative = true;
            }
            Shape::Jz => {
                immediate = Some(self.imm_z(&mut st, true)?);
                relative = true;
            }
            Shape::E | Shape::R | Shape::EIb | Shape::EIz | Shape::EMem => {
                let m = match modrm {
                    Some(m) => m,
                    None => ModRm::from_byte(st.u8()?),
                };
                modrm = Some(m);
                if shape == Shape::EMem && m.is_register() {
                    return Err(DecodeFailure::RegisterFormNotAllowed { opcode });
                }
                if shape != Shape::R {
                    (sib, memory) = self.decode_memory(&mut st, m)?;
                }
                match shape {
                    Shape::EIb => {
                        let sign_extend =
                            map == OpcodeMap::OneByte && tables::sign_extends_imm8(opcode);
                        immediate = Some(st.imm8(sign_extend)?);
                    }
                    Shape::EIz => immediate = Some(self.imm_z(&mut st, false)?),
                    _ => {}
                }
            }
            Shape::Moffs => {
                let address_size = self.address_size(&st);
                let displacement = match address_size {
                    AddressSize::Bits16 => st.u16()? as i32,
                    AddressSize::Bits32 => st.u32()? as i32,
                };
                memory = Some(EffectiveAddress::absolute_at(displacement, address_size));
            }
            Shape::Ap => {
                immediate = Some(self.imm_z(&mut st, false)?);
                extra_immediate = Some(st.imm16(false)?);
            }
            Shape::IwIb => {
                immediate = Some(st.imm16(false)?);
                extra_immediate = Some(st.imm8(false)?);
            }
            Shape::Invalid
            | Shape::Prefix
            | Shape::Escape
            | Shape::Group(_)
            | Shape::ThreeByte
            | Shape::ThreeByteIb => {
                return Err(DecodeFailure::UnassignedOpcode { map, opcode });
            }
        }

        let length = st.pos as u8;
        let next = at.wrapping_add(length as Address);
        let computed_reference = if relative {
            immediate.and_then(|imm| self.in_range(self.branch_target(next, imm.value, operand_16)))
        } else if shape == Shape::Ap {
            immediate.and_then(|imm| self.in_range(imm.value))
        } else {
            memory.and_then(|m| m.absolute()).and_then(|a| self.in_range(a))
        };

        Ok(DecodedInstruction {
            address: at,
            opcode_map: map,
            opcode,
            prefixes: st.prefixes,
            operand_size_override: st.operand_override,
            addr_size_override: st.address_override,
            modrm,
            sib,
            memory,
            immediate,
            extra_immediate,
            length,
            computed_reference,
            flow: flow_of(map, opcode, modrm),
        })
    }
}
