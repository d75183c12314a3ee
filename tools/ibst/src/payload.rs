//! Generated experiment payloads.
//!
//! Every payload is a counted loop around one instruction under study:
//!
//! ```text
//!         mov   esi, count
//!   top:  <setup>
//!         <target>
//!         sub   rsi, 1
//!         jne   top
//!         mov   eax, 42
//!         ret
//! ```
//!
//! The target's offset is reported alongside the bytes so samples can be
//! matched against `code_base + target_offset`. rdi (the scratch page) and
//! the callee-saved registers are left alone.

/// Value every generated payload returns.
pub const PAYLOAD_RETURN: u64 = 42;

/// A generated program and the offset of its instruction under study.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    /// Machine code, ending in `ret`.
    pub code: Vec<u8>,
    /// Offset of the target instruction within `code`.
    pub target_offset: usize,
}

impl Payload {
    /// Address of the target instruction once uploaded at `code_base`.
    pub fn target_rip(&self, code_base: u64) -> u64 {
        code_base + self.target_offset as u64
    }
}

/// Wraps `setup` and `target` in a loop that runs `count` times.
///
/// `count` must be non-zero; zero would wrap rsi and loop 2^64 times.
pub fn counted_loop(count: u32, setup: &[u8], target: &[u8]) -> Payload {
    let mut code = Vec::with_capacity(24 + setup.len() + target.len());
    // mov esi, imm32 (zero-extends into rsi)
    code.push(0xbe);
    code.extend_from_slice(&count.to_le_bytes());

    let top = code.len();
    code.extend_from_slice(setup);
    let target_offset = code.len();
    code.extend_from_slice(target);

    // sub rsi, 1
    code.extend_from_slice(&[0x48, 0x83, 0xee, 0x01]);
    emit_jne(&mut code, top);
    // mov eax, 42
    code.push(0xb8);
    code.extend_from_slice(&42u32.to_le_bytes());
    code.push(0xc3);

    Payload { code, target_offset }
}

/// `rdmsr` of `msr`, repeated `count` times.
pub fn rdmsr_loop(msr: u32, count: u32) -> Payload {
    let mut setup = vec![0xb9]; // mov ecx, imm32
    setup.extend_from_slice(&msr.to_le_bytes());
    counted_loop(count, &setup, &[0x0f, 0x32])
}

/// `cpuid` of `leaf` (subleaf 0), repeated `count` times.
pub fn cpuid_loop(leaf: u32, count: u32) -> Payload {
    let mut setup = vec![0xb8]; // mov eax, imm32
    setup.extend_from_slice(&leaf.to_le_bytes());
    setup.extend_from_slice(&[0x31, 0xc9]); // xor ecx, ecx
    counted_loop(count, &setup, &[0x0f, 0xa2])
}

/// Emits `jne` back to `dest`, short form when the displacement fits.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn emit_jne(code: &mut Vec<u8>, dest: usize) {
    // Displacements are relative to the end of the jump.
    let short = dest as isize - (code.len() as isize + 2);
    if let Ok(rel) = i8::try_from(short) {
        code.extend_from_slice(&[0x75, rel as u8]);
        return;
    }
    let near = dest as isize - (code.len() as isize + 6);
    code.extend_from_slice(&[0x0f, 0x85]);
    code.extend_from_slice(&(near as i32).to_le_bytes());
}
