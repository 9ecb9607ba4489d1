//! The dynamic assembler state: a byte sink with PC-labels and fixups.
//!
//! Emission happens in one forward pass. Branches to labels that are not
//! bound yet leave a zeroed displacement field behind and record a fixup;
//! [`CodeBuffer::finish`] patches every fixup once all labels are bound.
//! `finish` consumes the buffer, so nothing can observe the encoded bytes
//! before label resolution has run.

use crate::CodegenError;

/// An opaque identifier for a position in the emitted code, resolved to a
/// byte offset when the buffer is finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Label(u32);

impl Label {
    pub fn index(self) -> u32 {
        self.0
    }
}

/// How a recorded label use patches the bytes at its fixup site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LabelUse {
    /// A 32-bit PC-relative displacement as used by x86-64 `jcc`/`jmp`.
    /// The fixup offset points at the 4 displacement bytes; the
    /// displacement is relative to the end of those bytes.
    X64JmpRel32,
    /// The 19-bit scaled immediate at bits [23:5] of an AArch64
    /// `cbz`/`cbnz`/`b.cond` word. The fixup offset points at the
    /// instruction word itself.
    A64Branch19,
}

struct Fixup {
    offset: u32,
    label: Label,
    kind: LabelUse,
}

/// Growable code buffer with an expandable pool of PC-labels.
#[derive(Default)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
    labels: Vec<Option<u32>>,
    fixups: Vec<Fixup>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-size the label pool. Purely an allocation hint; `get_label`
    /// grows the pool on demand.
    pub fn reserve_labels(&mut self, n: usize) {
        self.labels.reserve(n);
    }

    /// Allocate a fresh, unbound label.
    pub fn get_label(&mut self) -> Label {
        let label = Label(u32::try_from(self.labels.len()).expect("label pool overflow"));
        self.labels.push(None);
        label
    }

    /// Pin `label` to the current offset.
    pub fn bind_label(&mut self, label: Label) {
        let offset = self.cur_offset();
        let slot = &mut self.labels[label.0 as usize];
        debug_assert!(slot.is_none(), "label {} bound twice", label.0);
        *slot = Some(offset);
    }

    /// Record that the bytes at `offset` must be patched with the resolved
    /// position of `label`.
    pub fn use_label_at_offset(&mut self, offset: u32, label: Label, kind: LabelUse) {
        self.fixups.push(Fixup {
            offset,
            label,
            kind,
        });
    }

    pub fn cur_offset(&self) -> u32 {
        u32::try_from(self.bytes.len()).expect("code buffer overflow")
    }

    pub fn put1(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    pub fn put2(&mut self, half: u16) {
        self.bytes.extend_from_slice(&half.to_le_bytes());
    }

    pub fn put4(&mut self, word: u32) {
        self.bytes.extend_from_slice(&word.to_le_bytes());
    }

    pub fn put8(&mut self, quad: u64) {
        self.bytes.extend_from_slice(&quad.to_le_bytes());
    }

    /// Resolve every fixup and seal the buffer.
    pub fn finish(mut self) -> Result<FinishedCode, CodegenError> {
        for fixup in &self.fixups {
            let target = self.labels[fixup.label.0 as usize].ok_or(CodegenError::UnboundLabel {
                label: fixup.label.0,
                offset: fixup.offset,
            })?;
            let site = fixup.offset as usize;
            match fixup.kind {
                LabelUse::X64JmpRel32 => {
                    let displacement = i64::from(target) - (i64::from(fixup.offset) + 4);
                    let rel = i32::try_from(displacement).map_err(|_| {
                        CodegenError::BranchOutOfRange {
                            offset: fixup.offset,
                            displacement,
                        }
                    })?;
                    self.bytes[site..site + 4].copy_from_slice(&rel.to_le_bytes());
                }
                LabelUse::A64Branch19 => {
                    let displacement = i64::from(target) - i64::from(fixup.offset);
                    debug_assert_eq!(displacement % 4, 0, "misaligned AArch64 branch target");
                    let words = displacement >> 2;
                    if words < -(1 << 18) || words >= (1 << 18) {
                        return Err(CodegenError::BranchOutOfRange {
                            offset: fixup.offset,
                            displacement,
                        });
                    }
                    let mut insn =
                        u32::from_le_bytes(self.bytes[site..site + 4].try_into().unwrap());
                    insn |= ((words as u32) & 0x7ffff) << 5;
                    self.bytes[site..site + 4].copy_from_slice(&insn.to_le_bytes());
                }
            }
        }
        log::debug!(
            "finished code buffer: {} bytes, {} labels, {} fixups",
            self.bytes.len(),
            self.labels.len(),
            self.fixups.len()
        );
        Ok(FinishedCode {
            bytes: self.bytes,
            labels: self.labels,
        })
    }
}

/// The sealed output of a [`CodeBuffer`]: encoded bytes plus the resolved
/// label table. The only way to get one is through [`CodeBuffer::finish`],
/// after which every label use has been patched.
pub struct FinishedCode {
    bytes: Vec<u8>,
    labels: Vec<Option<u32>>,
}

impl FinishedCode {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The resolved byte offset of `label`, if it was ever bound.
    pub fn label_offset(&self, label: Label) -> Option<u32> {
        self.labels.get(label.index() as usize).copied().flatten()
    }
}
