//! Decoding and relocation of the instructions displaced by the entry-point jump.
//!
//! Everything here works on byte buffers and addresses only, so it is independent of the
//! process being patched.

use crate::intercept::HookError;
use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, FlowControl, Instruction,
    InstructionBlock,
};

/// `jmp qword ptr [rip+0]` followed by the absolute destination.
pub const ABS_JMP_LEN: usize = 14;
/// `jmp rel32`, the only thing ever written over an entry point.
pub const REL_JMP_LEN: usize = 5;
/// Bytes read from the entry point when planning a patch.
pub const MAX_PROLOGUE: usize = 32;
/// Offset of the relocated prologue in the trampoline page on x64. The relay jump to the
/// detour sits in front of it.
pub const RELAY_SLOT: usize = 16;

#[cfg(target_arch = "x86_64")]
pub const NATIVE_BITNESS: u32 = 64;
#[cfg(target_arch = "x86")]
pub const NATIVE_BITNESS: u32 = 32;

/// Encode an unconditional jump placed at `from` that lands on `to`, reaching anywhere.
pub fn encode_jump(bitness: u32, from: u64, to: u64) -> Vec<u8> {
    if bitness == 64 {
        let mut bytes = Vec::with_capacity(ABS_JMP_LEN);
        bytes.extend_from_slice(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
        bytes.extend_from_slice(&to.to_le_bytes());
        bytes
    } else {
        let rel = (to as u32).wrapping_sub((from as u32).wrapping_add(REL_JMP_LEN as u32));
        let mut bytes = Vec::with_capacity(REL_JMP_LEN);
        bytes.push(0xE9);
        bytes.extend_from_slice(&rel.to_le_bytes());
        bytes
    }
}

/// `jmp rel32` at `from` landing on `to`, or `None` when `to` is out of reach on x64.
pub fn encode_rel_jump(bitness: u32, from: u64, to: u64) -> Option<[u8; REL_JMP_LEN]> {
    let next = from.wrapping_add(REL_JMP_LEN as u64);
    let rel = if bitness == 64 {
        i32::try_from((to as i64).checked_sub(next as i64)?).ok()?
    } else {
        (to as u32).wrapping_sub(next as u32) as i32
    };

    let mut bytes = [0xE9, 0, 0, 0, 0];
    bytes[1..].copy_from_slice(&rel.to_le_bytes());
    Some(bytes)
}

/// Bytes written over the entry point: `jmp rel32` to `to`, NOP-padded to `len`.
pub fn patch_bytes(bitness: u32, from: u64, to: u64, len: usize) -> Result<Vec<u8>, HookError> {
    let jump = encode_rel_jump(bitness, from, to).ok_or_else(|| {
        HookError::Memory(format!("{to:#x} is out of rel32 reach of {from:#x}"))
    })?;
    let mut bytes = jump.to_vec();
    bytes.resize(len.max(REL_JMP_LEN), 0x90);
    Ok(bytes)
}

/// Placement of a detour in its trampoline page.
///
/// On x64 the entry point jumps to a relay at the start of the page, which jumps on to the
/// detour; the relocated prologue follows at [`RELAY_SLOT`]. On x86 the entry point reaches
/// the detour directly and the page holds only the prologue.
#[derive(Debug)]
pub struct Layout {
    /// Code for the start of the page. Empty without a relay.
    pub relay: Vec<u8>,
    /// Where the relocated prologue goes. Calling it runs the original function.
    pub original_at: u64,
    /// Bytes for the entry point.
    pub patch: Vec<u8>,
}

impl Layout {
    pub fn plan(
        bitness: u32,
        target: u64,
        trampoline: u64,
        detour: u64,
        stolen_len: usize,
    ) -> Result<Self, HookError> {
        let (relay, original_at, entry_to) = if bitness == 64 {
            (
                encode_jump(64, trampoline, detour),
                trampoline + RELAY_SLOT as u64,
                trampoline,
            )
        } else {
            (Vec::new(), trampoline, detour)
        };

        Ok(Self {
            patch: patch_bytes(bitness, target, entry_to, stolen_len)?,
            relay,
            original_at,
        })
    }

    pub fn has_relay(&self) -> bool {
        !self.relay.is_empty()
    }
}

/// Whole instructions at the entry point covering at least one jump.
#[derive(Debug)]
pub struct Prologue {
    address: u64,
    instructions: Vec<Instruction>,
    stolen_len: usize,
}

impl Prologue {
    pub fn decode(code: &[u8], address: u64, bitness: u32) -> Result<Self, HookError> {
        let needed = REL_JMP_LEN;
        let mut decoder = Decoder::with_ip(bitness, code, address, DecoderOptions::NONE);
        let mut instructions = Vec::new();
        let mut stolen_len = 0;

        while stolen_len < needed {
            if !decoder.can_decode() {
                return Err(HookError::TooShort { address });
            }

            let instruction = decoder.decode();
            if instruction.is_invalid() {
                return Err(HookError::Undecodable {
                    address: instruction.ip(),
                });
            }

            stolen_len += instruction.len();
            instructions.push(instruction);

            // Patching past the end of the function would clobber whatever follows it.
            if stolen_len < needed
                && matches!(
                    instruction.flow_control(),
                    FlowControl::Return
                        | FlowControl::UnconditionalBranch
                        | FlowControl::IndirectBranch
                        | FlowControl::Interrupt
                )
            {
                return Err(HookError::TooShort { address });
            }
        }

        Ok(Self {
            address,
            instructions,
            stolen_len,
        })
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn stolen_len(&self) -> usize {
        self.stolen_len
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }
}

/// The stolen instructions re-encoded for the trampoline, followed by a jump back.
#[derive(Debug)]
pub struct Relocated {
    code: Vec<u8>,
    target: u64,
    trampoline: u64,
    /// `(offset in prologue, offset in trampoline)` for every instruction boundary, ending
    /// with the pair for the first byte after the stolen range.
    boundaries: Vec<(u64, u64)>,
}

impl Relocated {
    /// Re-encode `prologue` to run at `trampoline`.
    pub fn build(prologue: &Prologue, trampoline: u64, bitness: u32) -> Result<Self, HookError> {
        let block = InstructionBlock::new(prologue.instructions(), trampoline);
        let encoded = BlockEncoder::encode(
            bitness,
            block,
            BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS,
        )
        .map_err(|e| HookError::Relocation(e.to_string()))?;

        let target = prologue.address();
        let mut boundaries: Vec<(u64, u64)> = prologue
            .instructions()
            .iter()
            .zip(&encoded.new_instruction_offsets)
            .map(|(instruction, &new)| (instruction.ip() - target, u64::from(new)))
            .collect();

        let mut code = encoded.code_buffer;
        let back_at = trampoline + code.len() as u64;
        boundaries.push((prologue.stolen_len() as u64, code.len() as u64));
        code.extend(encode_jump(
            bitness,
            back_at,
            target + prologue.stolen_len() as u64,
        ));

        Ok(Self {
            code,
            target,
            trampoline,
            boundaries,
        })
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Where a thread paused at `ip` inside the stolen range should resume once the entry
    /// point is patched. `None` when `ip` needs no move.
    ///
    /// A thread paused at the entry itself is left alone and will take the detour.
    pub fn to_trampoline(&self, ip: u64) -> Option<u64> {
        let offset = ip.checked_sub(self.target)?;
        self.boundaries
            .iter()
            .filter(|&&(original, _)| original != 0)
            .find(|&&(original, _)| original == offset)
            .filter(|&&(original, _)| original < self.stolen_len())
            .map(|&(_, relocated)| self.trampoline + relocated)
    }

    /// Where a thread paused at `ip` inside the trampoline should resume once the trampoline
    /// is about to be released.
    pub fn to_original(&self, ip: u64) -> Option<u64> {
        let offset = ip.checked_sub(self.trampoline)?;
        self.boundaries
            .iter()
            .find(|&&(_, relocated)| relocated == offset)
            .map(|&(original, _)| self.target + original)
    }

    fn stolen_len(&self) -> u64 {
        self.boundaries.last().map_or(0, |&(original, _)| original)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: u64 = 0x7ff6_1000_1000;
    const TRAMPOLINE: u64 = 0x7ff6_1001_0000;
    const DETOUR: u64 = 0x7ffe_2000_0000;
    const ORIGINAL: u64 = TRAMPOLINE + RELAY_SLOT as u64;

    // push rbx (with a redundant REX prefix); sub rsp, 20h; mov rbx, rcx; ret
    const PROLOGUE: [u8; 10] = [0x40, 0x53, 0x48, 0x83, 0xEC, 0x20, 0x48, 0x8B, 0xD9, 0xC3];

    // mov rax, [rip+10h]; ret
    const RIP_LOAD: [u8; 8] = [0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00, 0xC3];

    // jmp qword ptr [rip+1234h], as found in import thunks
    const THUNK: [u8; 7] = [0x48, 0xFF, 0x25, 0x34, 0x12, 0x00, 0x00];

    fn padded(code: &[u8]) -> Vec<u8> {
        let mut code = code.to_vec();
        code.resize(MAX_PROLOGUE, 0xCC);
        code
    }

    #[test]
    fn absolute_jump_layout() {
        let bytes = encode_jump(64, TARGET, 0x1122_3344_5566_7788);
        assert_eq!(bytes.len(), ABS_JMP_LEN);
        assert_eq!(&bytes[..6], &[0xFF, 0x25, 0, 0, 0, 0]);
        assert_eq!(&bytes[6..], &0x1122_3344_5566_7788u64.to_le_bytes());
    }

    #[test]
    fn relative_jump_layout() {
        assert_eq!(encode_jump(32, 0x1000, 0x2000), [0xE9, 0xFB, 0x0F, 0x00, 0x00]);
        assert_eq!(encode_jump(32, 0x2000, 0x1000), [0xE9, 0xFB, 0xEF, 0xFF, 0xFF]);
        assert_eq!(encode_rel_jump(32, 0x2000, 0x1000), Some([0xE9, 0xFB, 0xEF, 0xFF, 0xFF]));
    }

    #[test]
    fn rel32_reach_is_checked_on_x64() {
        assert_eq!(
            encode_rel_jump(64, TARGET, TRAMPOLINE),
            Some([0xE9, 0xFB, 0xEF, 0x00, 0x00])
        );
        assert_eq!(encode_rel_jump(64, TARGET, DETOUR), None);
        assert!(matches!(
            patch_bytes(64, TARGET, DETOUR, 5),
            Err(HookError::Memory(_))
        ));
    }

    #[test]
    fn patch_is_padded_to_whole_instructions() {
        let patch = patch_bytes(64, TARGET, TRAMPOLINE, 7).unwrap();
        assert_eq!(patch, [0xE9, 0xFB, 0xEF, 0x00, 0x00, 0x90, 0x90]);
    }

    #[test]
    fn x64_entry_goes_through_relay() {
        let layout = Layout::plan(64, TARGET, TRAMPOLINE, DETOUR, 6).unwrap();
        assert!(layout.has_relay());
        assert_eq!(layout.relay, encode_jump(64, TRAMPOLINE, DETOUR));
        assert!(layout.relay.len() <= RELAY_SLOT);
        assert_eq!(layout.original_at, ORIGINAL);
        assert_eq!(layout.patch, patch_bytes(64, TARGET, TRAMPOLINE, 6).unwrap());
    }

    #[test]
    fn x86_entry_jumps_straight_to_detour() {
        let layout = Layout::plan(32, 0x7710_0000, 0x0100_0000, 0x6000_1000, 5).unwrap();
        assert!(!layout.has_relay());
        assert_eq!(layout.original_at, 0x0100_0000);
        assert_eq!(layout.patch, encode_jump(32, 0x7710_0000, 0x6000_1000));
    }

    #[test]
    fn prologue_steals_whole_instructions() {
        let prologue = Prologue::decode(&PROLOGUE, TARGET, 64).unwrap();
        assert_eq!(prologue.stolen_len(), 6);
        assert_eq!(prologue.instructions().len(), 2);
    }

    #[test]
    fn import_thunk_is_hookable() {
        let prologue = Prologue::decode(&padded(&THUNK), TARGET, 64).unwrap();
        assert_eq!(prologue.stolen_len(), THUNK.len());

        let relocated = Relocated::build(&prologue, ORIGINAL, 64).unwrap();
        let mut decoder = Decoder::with_ip(64, relocated.code(), ORIGINAL, DecoderOptions::NONE);
        let jump = decoder.decode();
        assert_eq!(jump.flow_control(), FlowControl::IndirectBranch);
        assert_eq!(jump.ip_rel_memory_address(), TARGET + 7 + 0x1234);
    }

    #[test]
    fn short_function_is_rejected() {
        // xor eax, eax; ret
        assert!(matches!(
            Prologue::decode(&padded(&[0x31, 0xC0, 0xC3]), TARGET, 64),
            Err(HookError::TooShort { .. })
        ));
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        assert!(matches!(
            Prologue::decode(&PROLOGUE[..2], TARGET, 64),
            Err(HookError::TooShort { .. })
        ));
    }

    #[test]
    fn relocation_preserves_rip_relative_operand() {
        let prologue = Prologue::decode(&RIP_LOAD, TARGET, 64).unwrap();
        let relocated = Relocated::build(&prologue, ORIGINAL, 64).unwrap();

        let mut decoder = Decoder::with_ip(64, relocated.code(), ORIGINAL, DecoderOptions::NONE);
        let load = decoder
            .iter()
            .find(|i| i.is_ip_rel_memory_operand())
            .unwrap();
        assert_eq!(load.ip_rel_memory_address(), TARGET + 7 + 0x10);
    }

    #[test]
    fn trampoline_jumps_back_past_stolen_bytes() {
        let prologue = Prologue::decode(&PROLOGUE, TARGET, 64).unwrap();
        let relocated = Relocated::build(&prologue, ORIGINAL, 64).unwrap();
        let code = relocated.code();
        let tail = &code[code.len() - ABS_JMP_LEN..];
        assert_eq!(&tail[..6], &[0xFF, 0x25, 0, 0, 0, 0]);
        assert_eq!(&tail[6..], &(TARGET + 6).to_le_bytes());
    }

    #[test]
    fn thread_addresses_map_between_copies() {
        let prologue = Prologue::decode(&PROLOGUE, TARGET, 64).unwrap();
        let relocated = Relocated::build(&prologue, ORIGINAL, 64).unwrap();

        assert_eq!(relocated.to_trampoline(TARGET), None);
        assert_eq!(relocated.to_trampoline(TARGET + 3), None);
        assert_eq!(relocated.to_trampoline(TARGET + 6), None);

        // The encoder drops the redundant REX prefix of `push rbx`, so `sub rsp` starts one
        // byte into the copy.
        assert_eq!(relocated.to_trampoline(TARGET + 2), Some(ORIGINAL + 1));
        assert_eq!(relocated.to_original(ORIGINAL + 1), Some(TARGET + 2));
        assert_eq!(relocated.to_original(ORIGINAL), Some(TARGET));

        let back = (relocated.code().len() - ABS_JMP_LEN) as u64;
        assert_eq!(relocated.to_original(ORIGINAL + back), Some(TARGET + 6));
        assert_eq!(relocated.to_original(TARGET), None);
    }
}
