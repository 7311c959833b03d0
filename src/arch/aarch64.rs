//! AArch64 inline hooking.
//!
//! The entry of the target is overwritten with either a single `B` (when the
//! interceptor is within +/-128MiB) or an absolute `LDR X17, #8; BR X17` stub.
//! The overwritten instructions are relocated into a trampoline that then
//! branches back to the first untouched instruction.

use crate::error::{NativeError, Result};
use crate::hook::memory::{ProtectedMemory, TrampolinePage};
use std::ptr;

pub const NOP: u32 = 0xd503201f;
pub const BR_X17: u32 = 0xd61f0220;
/// `LDR X17, #8`
pub const LDR_X17_LIT8: u32 = 0x58000051;
/// `LDR X17, #12`
const LDR_X17_LIT12: u32 = 0x58000071;
/// `ADR X30, #16`
const ADR_X30_16: u32 = 0x1000009e;

const OP_B: u32 = 0x14000000;
const OP_BL: u32 = 0x94000000;
const IMM26_MASK: u32 = 0x03ffffff;
const IMM19_MASK: u32 = 0x7ffff << 5;
const IMM14_MASK: u32 = 0x3fff << 5;

fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value as i64) << shift) >> shift
}

fn fits(words: i64, bits: u32) -> bool {
    let limit = 1i64 << (bits - 1);
    (-limit..limit).contains(&words)
}

fn encode_b(words: i64) -> u32 {
    OP_B | (words as u32 & IMM26_MASK)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImmField {
    Imm26,
    Imm19,
    Imm14,
}

impl ImmField {
    fn bits(self) -> u32 {
        match self {
            ImmField::Imm26 => 26,
            ImmField::Imm19 => 19,
            ImmField::Imm14 => 14,
        }
    }

    fn with_offset(self, insn: u32, words: i64) -> u32 {
        match self {
            ImmField::Imm26 => (insn & !IMM26_MASK) | (words as u32 & IMM26_MASK),
            ImmField::Imm19 => (insn & !IMM19_MASK) | ((words as u32) << 5 & IMM19_MASK),
            ImmField::Imm14 => (insn & !IMM14_MASK) | ((words as u32) << 5 & IMM14_MASK),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Insn {
    Branch { link: bool, target: u64 },
    Conditional { field: ImmField, target: u64 },
    Literal { bytes: usize, target: u64 },
    Prefetch,
    Address { rd: u32, target: u64 },
    Plain,
}

fn decode(insn: u32, pc: u64) -> Result<Insn> {
    let offset = |imm: u32, bits: u32| pc.wrapping_add((sign_extend(imm, bits) * 4) as u64);

    let decoded = match insn {
        _ if insn & 0xfc000000 == OP_B || insn & 0xfc000000 == OP_BL => Insn::Branch {
            link: insn & 0xfc000000 == OP_BL,
            target: offset(insn & IMM26_MASK, 26),
        },
        // B.cond, CBZ/CBNZ
        _ if insn & 0xff000010 == 0x54000000 || insn & 0x7e000000 == 0x34000000 => {
            Insn::Conditional {
                field: ImmField::Imm19,
                target: offset((insn >> 5) & 0x7ffff, 19),
            }
        }
        // TBZ/TBNZ
        _ if insn & 0x7e000000 == 0x36000000 => Insn::Conditional {
            field: ImmField::Imm14,
            target: offset((insn >> 5) & 0x3fff, 14),
        },
        // LDR (literal), LDRSW (literal), PRFM (literal), SIMD LDR (literal)
        _ if insn & 0x3b000000 == 0x18000000 => {
            let simd = insn & (1 << 26) != 0;
            let bytes = match (insn >> 30, simd) {
                (0b00, _) => 4,
                (0b01, _) => 8,
                (0b10, false) => 4,
                (0b10, true) => 16,
                (0b11, false) => return Ok(Insn::Prefetch),
                _ => return Err(NativeError::HookFailed(format!("unallocated literal load {:#010x}", insn))),
            };
            Insn::Literal {
                bytes,
                target: offset((insn >> 5) & 0x7ffff, 19),
            }
        }
        // ADR/ADRP
        _ if insn & 0x1f000000 == 0x10000000 => {
            let imm = ((insn >> 5) & 0x7ffff) << 2 | (insn >> 29) & 0x3;
            let imm = sign_extend(imm, 21);
            let target = if insn & 0x80000000 != 0 {
                (pc & !0xfff).wrapping_add((imm << 12) as u64)
            } else {
                pc.wrapping_add(imm as u64)
            };
            Insn::Address {
                rd: insn & 0x1f,
                target,
            }
        }
        _ => Insn::Plain,
    };

    Ok(decoded)
}

struct Fixup {
    at: usize,
    field: ImmField,
    source_index: usize,
}

/// Rewrites instructions copied from `source` so they behave the same when
/// executed at `dest`.
pub struct Relocator {
    source: u64,
    dest: u64,
    count: usize,
    out: Vec<u32>,
    slots: Vec<usize>,
    fixups: Vec<Fixup>,
}

impl Relocator {
    pub fn new(source: u64, dest: u64, count: usize) -> Self {
        Self {
            source,
            dest,
            count,
            out: Vec::with_capacity(count * 8),
            slots: Vec::with_capacity(count),
            fixups: Vec::new(),
        }
    }

    fn pc(&self) -> u64 {
        self.dest + (self.out.len() as u64) * 4
    }

    fn source_end(&self) -> u64 {
        self.source + (self.count as u64) * 4
    }

    fn relocated_index(&self, target: u64) -> Option<usize> {
        if target >= self.source && target < self.source_end() && target % 4 == 0 {
            Some(((target - self.source) / 4) as usize)
        } else {
            None
        }
    }

    /// Pads with NOPs until the word `ahead` slots from here is 8-byte aligned.
    fn align_literal(&mut self, ahead: u64) {
        while (self.pc() + ahead * 4) % 8 != 0 {
            self.out.push(NOP);
        }
    }

    fn push_address(&mut self, value: u64) {
        self.out.push(value as u32);
        self.out.push((value >> 32) as u32);
    }

    fn push_absolute_jump(&mut self, target: u64) {
        self.align_literal(2);
        self.out.push(LDR_X17_LIT8);
        self.out.push(BR_X17);
        self.push_address(target);
    }

    /// Emits `insn` with its displacement retargeted into the trampoline.
    fn push_internal(&mut self, insn: u32, field: ImmField, source_index: usize) {
        let at = self.out.len();
        match self.slots.get(source_index) {
            Some(&slot) => {
                let words = slot as i64 - at as i64;
                self.out.push(field.with_offset(insn, words));
            }
            None => {
                self.fixups.push(Fixup {
                    at,
                    field,
                    source_index,
                });
                self.out.push(insn);
            }
        }
    }

    fn relocate_branch(&mut self, insn: u32, link: bool, target: u64) {
        if let Some(index) = self.relocated_index(target) {
            self.push_internal(insn, ImmField::Imm26, index);
            return;
        }

        let words = (target as i64 - self.pc() as i64) >> 2;
        if fits(words, 26) {
            self.out.push(ImmField::Imm26.with_offset(insn, words));
        } else if link {
            self.align_literal(3);
            self.out.push(LDR_X17_LIT12);
            self.out.push(ADR_X30_16);
            self.out.push(BR_X17);
            self.push_address(target);
        } else {
            self.push_absolute_jump(target);
        }
    }

    fn relocate_conditional(&mut self, insn: u32, field: ImmField, target: u64) {
        if let Some(index) = self.relocated_index(target) {
            self.push_internal(insn, field, index);
            return;
        }

        let words = (target as i64 - self.pc() as i64) >> 2;
        if fits(words, field.bits()) {
            self.out.push(field.with_offset(insn, words));
            return;
        }

        // taken: skip to the absolute jump; not taken: branch over it
        self.align_literal(4);
        self.out.push(field.with_offset(insn, 2));
        self.out.push(encode_b(5));
        self.out.push(LDR_X17_LIT8);
        self.out.push(BR_X17);
        self.push_address(target);
    }

    unsafe fn relocate_literal(&mut self, insn: u32, bytes: usize, target: u64) {
        // The literal is copied inline: `LDR <t>, #8; B <past data>; <data>`.
        if bytes >= 8 {
            self.align_literal(2);
        }
        let words = bytes / 4;
        self.out.push(ImmField::Imm19.with_offset(insn, 2));
        self.out.push(encode_b(1 + words as i64));

        let data = target as *const u32;
        for i in 0..words {
            self.out.push(ptr::read_unaligned(data.add(i)));
        }
    }

    fn relocate_address(&mut self, rd: u32, target: u64) {
        // LDR <Xd>, #8; B #12; <target>
        self.align_literal(2);
        self.out.push(0x58000040 | rd);
        self.out.push(encode_b(3));
        self.push_address(target);
    }

    /// Relocates `code`, which must be the `count` words found at `source`.
    ///
    /// # Safety
    /// Literal loads in `code` are resolved by reading the memory they point at.
    pub unsafe fn relocate(mut self, code: &[u32]) -> Result<Vec<u32>> {
        for (index, &insn) in code.iter().take(self.count).enumerate() {
            let pc = self.source + (index as u64) * 4;
            self.slots.push(self.out.len());

            match decode(insn, pc)? {
                Insn::Branch { link, target } => self.relocate_branch(insn, link, target),
                Insn::Conditional { field, target } => {
                    self.relocate_conditional(insn, field, target)
                }
                Insn::Literal { bytes, target } => self.relocate_literal(insn, bytes, target),
                Insn::Prefetch => self.out.push(NOP),
                Insn::Address { rd, target } => self.relocate_address(rd, target),
                Insn::Plain => self.out.push(insn),
            }
        }

        let resume = self.source_end();
        let words = (resume as i64 - self.pc() as i64) >> 2;
        if fits(words, 26) {
            self.out.push(encode_b(words));
        } else {
            self.push_absolute_jump(resume);
        }

        for fixup in std::mem::take(&mut self.fixups) {
            let slot = self.slots[fixup.source_index];
            let words = slot as i64 - fixup.at as i64;
            self.out[fixup.at] = fixup.field.with_offset(self.out[fixup.at], words);
        }

        Ok(self.out)
    }
}

/// The words written over the entry of `target` to reach `interceptor`.
pub fn redirect_words(target: u64, interceptor: u64) -> Vec<u32> {
    let words = (interceptor as i64 - target as i64) >> 2;
    if fits(words, 26) {
        return vec![encode_b(words)];
    }

    let mut patch = Vec::with_capacity(5);
    if target % 8 != 0 {
        patch.push(NOP);
    }
    patch.push(LDR_X17_LIT8);
    patch.push(BR_X17);
    patch.push(interceptor as u32);
    patch.push((interceptor >> 32) as u32);
    patch
}

/// Redirects `target` to `interceptor`.
///
/// `publish` receives the trampoline before the first patched byte is written,
/// so an interceptor running concurrently with the install already sees it.
///
/// # Safety
/// `target` must be the entry of a function at least as long as the redirect.
pub unsafe fn hook_function_aarch64(
    target: usize,
    interceptor: usize,
    publish: impl FnOnce(usize),
) -> Result<usize> {
    if target == 0 || interceptor == 0 {
        return Err(NativeError::NullPointer);
    }

    let patch = redirect_words(target as u64, interceptor as u64);
    let original = std::slice::from_raw_parts(target as *const u32, patch.len()).to_vec();

    let mut page = TrampolinePage::allocate()?;
    let code = Relocator::new(target as u64, page.address() as u64, patch.len()).relocate(&original)?;
    page.write_words(&code)?;

    let code_guard = ProtectedMemory::new(target as *mut u8, patch.len() * 4)?;
    let trampoline = page.seal()?;
    publish(trampoline);

    ptr::copy_nonoverlapping(patch.as_ptr(), target as *mut u32, patch.len());
    drop(code_guard);

    Ok(trampoline)
}
