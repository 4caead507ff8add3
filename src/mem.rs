use memflow::prelude::v1::*;

use goblin::elf::program_header::PT_LOAD;
use goblin::elf::Elf;

use log::*;

use crate::image::PointerWidth;

/// Raw, read-only byte access to a captured memory image.
pub trait DumpMemory {
    fn read_raw_into(&mut self, addr: Address, out: &mut [u8]) -> Result<()>;

    fn read_pod<T: ::dataview::Pod>(&mut self, addr: Address) -> Result<T> {
        let mut val = T::zeroed();
        self.read_raw_into(addr, val.as_bytes_mut())?;
        Ok(val)
    }
}

/// Any memflow memory view, such as a connector wrapped in `VirtualDma`.
pub struct MemflowMemory<V>(pub V);

impl<V: MemoryView> DumpMemory for MemflowMemory<V> {
    fn read_raw_into(&mut self, addr: Address, out: &mut [u8]) -> Result<()> {
        self.0.read_raw_into(addr, out).data_part()
    }
}

#[derive(Clone, Debug)]
struct Segment {
    base: umem,
    data: Vec<u8>,
}

impl Segment {
    fn end(&self) -> umem {
        self.base.saturating_add(self.data.len() as umem)
    }
}

/// A memory image held in process, as a set of non-overlapping segments.
///
/// Reads may span adjacent segments, but any byte outside every segment
/// fails the whole read.
#[derive(Clone, Debug, Default)]
pub struct SnapshotMemory {
    segments: Vec<Segment>,
}

impl SnapshotMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `data` at `base`. Segments that overlap an existing one are rejected.
    pub fn add_segment(&mut self, base: Address, data: Vec<u8>) -> Result<()> {
        let seg = Segment {
            base: base.to_umem(),
            data,
        };

        let idx = self.segments.partition_point(|s| s.base < seg.base);

        let overlaps_prev = idx > 0 && self.segments[idx - 1].end() > seg.base;
        let overlaps_next = idx < self.segments.len() && seg.end() > self.segments[idx].base;

        if overlaps_prev || overlaps_next {
            return Err(Error(ErrorOrigin::Memory, ErrorKind::InvalidArgument));
        }

        self.segments.insert(idx, seg);
        Ok(())
    }

    /// Loads every `PT_LOAD` segment of an ELF core file (a vmcore) at its
    /// virtual address. Returns the image together with the target pointer width.
    pub fn from_elf_core(bytes: &[u8]) -> Result<(Self, PointerWidth)> {
        let elf = Elf::parse(bytes).map_err(|e| {
            warn!("unable to parse elf core: {}", e);
            Error(ErrorOrigin::OsLayer, ErrorKind::InvalidArgument)
        })?;

        let width = if elf.is_64 {
            PointerWidth::Bits64
        } else {
            PointerWidth::Bits32
        };

        let mut mem = Self::new();

        for ph in elf.program_headers.iter().filter(|ph| ph.p_type == PT_LOAD) {
            let start = ph.p_offset as usize;
            let data = match bytes.get(start..start.saturating_add(ph.p_filesz as usize)) {
                Some(data) if !data.is_empty() => data,
                _ => {
                    debug!("skipping truncated segment at {:x}", ph.p_vaddr);
                    continue;
                }
            };

            if let Err(e) = mem.add_segment(Address::from(ph.p_vaddr), data.to_vec()) {
                warn!("skipping overlapping segment at {:x}: {}", ph.p_vaddr, e);
            }
        }

        info!("loaded {} segments from elf core", mem.segments.len());

        Ok((mem, width))
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    fn segment_idx(&self, addr: umem) -> Option<usize> {
        let idx = self.segments.partition_point(|s| s.base <= addr);
        if idx > 0 && addr < self.segments[idx - 1].end() {
            Some(idx - 1)
        } else {
            None
        }
    }

    /// Overwrites bytes of an already mapped range. Used to build images in code.
    pub fn write_bytes(&mut self, addr: Address, bytes: &[u8]) -> Result<()> {
        let mut cur = addr.to_umem();
        let mut done = 0;

        while done < bytes.len() {
            let idx = self
                .segment_idx(cur)
                .ok_or(Error(ErrorOrigin::Memory, ErrorKind::OutOfBounds))?;
            let seg = &mut self.segments[idx];
            let off = (cur - seg.base) as usize;
            let n = std::cmp::min(bytes.len() - done, seg.data.len() - off);
            seg.data[off..off + n].copy_from_slice(&bytes[done..done + n]);
            done += n;
            cur = cur.wrapping_add(n as umem);
        }

        Ok(())
    }
}

impl DumpMemory for SnapshotMemory {
    fn read_raw_into(&mut self, addr: Address, out: &mut [u8]) -> Result<()> {
        let mut cur = addr.to_umem();
        let mut done = 0;

        while done < out.len() {
            let seg = self
                .segment_idx(cur)
                .map(|idx| &self.segments[idx])
                .ok_or(Error(ErrorOrigin::Memory, ErrorKind::OutOfBounds))?;
            let off = (cur - seg.base) as usize;
            let n = std::cmp::min(out.len() - done, seg.data.len() - off);
            out[done..done + n].copy_from_slice(&seg.data[off..off + n]);
            done += n;
            cur = cur.wrapping_add(n as umem);
        }

        Ok(())
    }
}
