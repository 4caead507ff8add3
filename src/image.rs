use memflow::prelude::v1::*;

use crate::version::KernelVersion;

/// Size of a kernel pointer on the target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PointerWidth {
    Bits32,
    Bits64,
}

impl PointerWidth {
    pub fn bytes(self) -> usize {
        match self {
            PointerWidth::Bits32 => 4,
            PointerWidth::Bits64 => 8,
        }
    }
}

/// Read-only view of a kernel memory image together with the metadata
/// needed to interpret it.
///
/// Implementations never write to the image. Every read may fail, since the
/// image may be truncated or the address may be garbage.
pub trait KernelImage {
    /// Reads a target sized pointer.
    fn read_word(&mut self, addr: Address) -> Result<Address>;

    fn read_u32(&mut self, addr: Address) -> Result<u32>;

    /// Reads at most `max_len` bytes, cut at the first NUL, with control
    /// characters removed.
    fn read_cstring(&mut self, addr: Address, max_len: usize) -> Result<String>;

    /// Byte offset of `field` within `struct ty`.
    fn field_offset(&self, ty: &str, field: &str) -> Result<usize>;

    /// Reads a pointer sized field of the structure at `base`.
    fn read_field(&mut self, base: Address, ty: &str, field: &str) -> Result<Address> {
        let off = self.field_offset(ty, field)?;
        self.read_word(at_offset(base, off))
    }

    /// Resolves an address to the symbol containing it and the offset into it.
    fn lookup_symbol(&self, addr: Address) -> Option<(&str, usize)>;

    /// All processes (thread group leaders) of the image.
    fn processes(&mut self) -> Result<Vec<Address>>;

    /// All threads of the process `task`, possibly including `task` itself.
    fn threads(&mut self, task: Address) -> Result<Vec<Address>>;

    fn pointer_width(&self) -> PointerWidth;

    fn kernel_version(&self) -> KernelVersion;
}

/// Address of a field `off` bytes into the structure at `base`.
///
/// Wraps instead of overflowing, garbage pointers are common in dumps.
pub fn at_offset(base: Address, off: usize) -> Address {
    Address::from(base.to_umem().wrapping_add(off as umem))
}

/// Cuts `buf` at the first NUL and drops control characters.
pub fn cleanup_string(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end])
        .chars()
        .filter(|c| !c.is_control())
        .collect()
}
