use memflow::prelude::v1::*;

use log::*;

use crate::image::{cleanup_string, KernelImage, PointerWidth};
use crate::layout::TypeLayout;
use crate::mem::DumpMemory;
use crate::symbols::SymbolTable;
use crate::version::KernelVersion;

pub mod tasks;

pub use tasks::{TaskListOffsets, TaskOffsets};

const LINUX_BANNER_LEN: usize = 256;

/// A kernel memory image with everything needed to interpret it.
pub struct Ramdump<M> {
    mem: M,
    layout: TypeLayout,
    symbols: SymbolTable,
    width: PointerWidth,
    version: KernelVersion,
    init_task: Address,
}

impl<M: DumpMemory> Ramdump<M> {
    /// Requires the `init_task` symbol. The kernel version is read from
    /// `linux_banner`, if that fails it stays at 0.0.0 until overridden with
    /// [`Ramdump::with_kernel_version`].
    pub fn new(
        mem: M,
        layout: TypeLayout,
        symbols: SymbolTable,
        width: PointerWidth,
    ) -> Result<Self> {
        let init_task = symbols.address_of("init_task").ok_or_else(|| {
            warn!("init_task symbol not found");
            Error(ErrorOrigin::OsLayer, ErrorKind::NotFound)
        })?;

        debug!("init_task: {:x}", init_task.to_umem());

        let mut dump = Self {
            mem,
            layout,
            symbols,
            width,
            version: KernelVersion::default(),
            init_task,
        };

        match dump.detect_version() {
            Ok(version) => {
                info!("kernel version: {}", version);
                dump.version = version;
            }
            Err(e) => warn!("unable to detect kernel version: {}", e),
        }

        Ok(dump)
    }

    pub fn with_kernel_version(mut self, version: KernelVersion) -> Self {
        self.version = version;
        self
    }

    pub fn init_task(&self) -> Address {
        self.init_task
    }

    fn detect_version(&mut self) -> Result<KernelVersion> {
        let banner = self
            .symbols
            .address_of("linux_banner")
            .ok_or(Error(ErrorOrigin::OsLayer, ErrorKind::NotFound))?;

        let banner = self.read_cstring(banner, LINUX_BANNER_LEN)?;
        trace!("linux_banner: {}", banner);

        KernelVersion::from_banner(&banner).ok_or(Error(ErrorOrigin::OsLayer, ErrorKind::NotFound))
    }
}

impl<M: DumpMemory> KernelImage for Ramdump<M> {
    fn read_word(&mut self, addr: Address) -> Result<Address> {
        match self.width {
            PointerWidth::Bits64 => self
                .mem
                .read_pod::<u64>(addr)
                .map(|v| Address::from(u64::from_le(v))),
            PointerWidth::Bits32 => self
                .mem
                .read_pod::<u32>(addr)
                .map(|v| Address::from(u32::from_le(v) as u64)),
        }
    }

    fn read_u32(&mut self, addr: Address) -> Result<u32> {
        self.mem.read_pod::<u32>(addr).map(u32::from_le)
    }

    fn read_cstring(&mut self, addr: Address, max_len: usize) -> Result<String> {
        let mut buf = vec![0u8; max_len];

        if let Err(e) = self.mem.read_raw_into(addr, &mut buf) {
            // Short strings may sit right before an unmapped page.
            let page_size = size::kb(4);
            let in_page = page_size - (addr.to_umem() as usize % page_size);
            if in_page >= max_len {
                return Err(e);
            }
            buf.truncate(in_page);
            self.mem.read_raw_into(addr, &mut buf)?;
        }

        Ok(cleanup_string(&buf))
    }

    fn field_offset(&self, ty: &str, field: &str) -> Result<usize> {
        self.layout.offset(ty, field)
    }

    fn lookup_symbol(&self, addr: Address) -> Option<(&str, usize)> {
        self.symbols.lookup(addr)
    }

    fn processes(&mut self) -> Result<Vec<Address>> {
        let init_task = self.init_task;
        tasks::process_list(self, init_task)
    }

    fn threads(&mut self, task: Address) -> Result<Vec<Address>> {
        tasks::thread_list(self, task)
    }

    fn pointer_width(&self) -> PointerWidth {
        self.width
    }

    fn kernel_version(&self) -> KernelVersion {
        self.version
    }
}
