//! Synthetic kernel images for tests.

use memflow::prelude::v1::*;

use crate::image::{at_offset, PointerWidth};
use crate::kernel::tasks::TASK_COMM_LEN;
use crate::kernel::Ramdump;
use crate::layout::TypeLayout;
use crate::mem::{DumpMemory, SnapshotMemory};
use crate::symbols::SymbolTable;

const BASE_64: u64 = 0xffff_ff80_1000_0000;
const BASE_32: u64 = 0xc100_0000;
const SIZE: usize = 0x10_0000;

const LIST_NEXT: usize = 0x0;

const TASK_TASKS: usize = 0x10;
const TASK_PID: usize = 0x20;
const TASK_COMM: usize = 0x28;
const TASK_FILES: usize = 0x40;
const TASK_SIGNAL: usize = 0x48;
const TASK_THREAD_NODE: usize = 0x50;
const TASK_SIZE: usize = 0x80;

const SIGNAL_THREAD_HEAD: usize = 0x10;
const SIGNAL_SIZE: usize = 0x40;

const FILES_FDT: usize = 0x20;
const FILES_SIZE: usize = 0x40;

const FDT_MAX_FDS: usize = 0x0;
const FDT_FD: usize = 0x8;
const FDT_SIZE: usize = 0x20;

const FILE_F_PATH: usize = 0x10;
const FILE_F_OP: usize = 0x28;
const FILE_PRIVATE_DATA: usize = 0x30;
const FILE_SIZE: usize = 0x40;

const PATH_MNT: usize = 0x0;
const PATH_DENTRY: usize = 0x8;

const MOUNT_PARENT: usize = 0x10;
const MOUNT_MOUNTPOINT: usize = 0x18;
const MOUNT_MNT: usize = 0x20;
const MOUNT_SIZE: usize = 0x60;

const DENTRY_PARENT: usize = 0x18;
const DENTRY_NAME: usize = 0x20;
const DENTRY_SIZE: usize = 0x40;

const QSTR_LEN: usize = 0x4;
const QSTR_NAME: usize = 0x8;

const BANNER_LEN: usize = 0x100;

/// Lays out kernel structures in a [`SnapshotMemory`].
///
/// Structure offsets are the same for both pointer widths, every field has
/// room for a 64-bit pointer. Only `list_head.prev` moves.
pub struct Fixture {
    mem: SnapshotMemory,
    width: PointerWidth,
    base: u64,
    layout: TypeLayout,
    symbols: SymbolTable,
    next_free: u64,
    init_task: Address,
    banner: Address,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_width(PointerWidth::Bits64)
    }

    pub fn bits32() -> Self {
        Self::with_width(PointerWidth::Bits32)
    }

    fn with_width(width: PointerWidth) -> Self {
        let base = match width {
            PointerWidth::Bits64 => BASE_64,
            PointerWidth::Bits32 => BASE_32,
        };

        let mut mem = SnapshotMemory::new();
        mem.add_segment(Address::from(base), vec![0; SIZE]).unwrap();

        let layout = TypeLayout::new()
            .with_field("list_head", "next", LIST_NEXT)
            .with_field("list_head", "prev", width.bytes())
            .with_field("task_struct", "tasks", TASK_TASKS)
            .with_field("task_struct", "pid", TASK_PID)
            .with_field("task_struct", "comm", TASK_COMM)
            .with_field("task_struct", "files", TASK_FILES)
            .with_field("task_struct", "signal", TASK_SIGNAL)
            .with_field("task_struct", "thread_node", TASK_THREAD_NODE)
            .with_field("signal_struct", "thread_head", SIGNAL_THREAD_HEAD)
            .with_field("files_struct", "fdt", FILES_FDT)
            .with_field("fdtable", "max_fds", FDT_MAX_FDS)
            .with_field("fdtable", "fd", FDT_FD)
            .with_field("file", "f_path", FILE_F_PATH)
            .with_field("file", "f_op", FILE_F_OP)
            .with_field("file", "private_data", FILE_PRIVATE_DATA)
            .with_field("path", "mnt", PATH_MNT)
            .with_field("path", "dentry", PATH_DENTRY)
            .with_field("mount", "mnt_parent", MOUNT_PARENT)
            .with_field("mount", "mnt_mountpoint", MOUNT_MOUNTPOINT)
            .with_field("mount", "mnt", MOUNT_MNT)
            .with_field("dentry", "d_parent", DENTRY_PARENT)
            .with_field("dentry", "d_name", DENTRY_NAME)
            .with_field("qstr", "len", QSTR_LEN)
            .with_field("qstr", "name", QSTR_NAME);

        let mut fx = Self {
            mem,
            width,
            base,
            layout,
            symbols: SymbolTable::new(),
            next_free: base + 0x1000,
            init_task: Address::NULL,
            banner: Address::NULL,
        };

        fx.init_task = fx.alloc(TASK_SIZE);
        fx.init_list(at_offset(fx.init_task, TASK_TASKS));
        fx.write_str(at_offset(fx.init_task, TASK_COMM), "swapper/0");

        fx.banner = fx.alloc(BANNER_LEN);
        fx.set_banner("Linux version 5.10.43-android12-9 (build-user@build-host) #1 SMP PREEMPT");

        let (init_task, banner) = (fx.init_task, fx.banner);
        fx.symbols.insert(init_task, "init_task", Some(TASK_SIZE));
        fx.symbols.insert(banner, "linux_banner", Some(BANNER_LEN));

        fx
    }

    pub fn build(self) -> Ramdump<SnapshotMemory> {
        Ramdump::new(self.mem, self.layout, self.symbols, self.width).unwrap()
    }

    /// Zeroed, 16 byte aligned.
    pub fn alloc(&mut self, size: usize) -> Address {
        let addr = self.next_free;
        self.next_free += ((size as u64) + 0xf) & !0xf;
        assert!(self.next_free <= self.base + SIZE as u64, "fixture is out of memory");
        Address::from(addr)
    }

    pub fn write_word(&mut self, addr: Address, val: Address) {
        let bytes = (val.to_umem() as u64).to_le_bytes();
        self.mem
            .write_bytes(addr, &bytes[..self.width.bytes()])
            .unwrap();
    }

    pub fn write_u32(&mut self, addr: Address, val: u32) {
        self.mem.write_bytes(addr, &val.to_le_bytes()).unwrap();
    }

    pub fn write_str(&mut self, addr: Address, s: &str) {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.mem.write_bytes(addr, &bytes).unwrap();
    }

    fn read_word(&mut self, addr: Address) -> Address {
        match self.width {
            PointerWidth::Bits64 => {
                Address::from(u64::from_le(self.mem.read_pod::<u64>(addr).unwrap()))
            }
            PointerWidth::Bits32 => {
                Address::from(u32::from_le(self.mem.read_pod::<u32>(addr).unwrap()) as u64)
            }
        }
    }

    fn list_prev(&self) -> usize {
        self.width.bytes()
    }

    pub fn set_banner(&mut self, banner: &str) {
        assert!(banner.len() < BANNER_LEN);
        let banner_addr = self.banner;
        self.mem
            .write_bytes(banner_addr, &[0; BANNER_LEN])
            .unwrap();
        self.write_str(banner_addr, banner);
    }

    pub fn remove_field(&mut self, ty: &str, field: &str) {
        let mut layout = TypeLayout::new();
        for (t, f, off) in self.fields() {
            if t != ty || f != field {
                layout.insert(t, f, off);
            }
        }
        self.layout = layout;
    }

    fn fields(&self) -> Vec<(&'static str, &'static str, usize)> {
        vec![
            ("list_head", "next", LIST_NEXT),
            ("list_head", "prev", self.list_prev()),
            ("task_struct", "tasks", TASK_TASKS),
            ("task_struct", "pid", TASK_PID),
            ("task_struct", "comm", TASK_COMM),
            ("task_struct", "files", TASK_FILES),
            ("task_struct", "signal", TASK_SIGNAL),
            ("task_struct", "thread_node", TASK_THREAD_NODE),
            ("signal_struct", "thread_head", SIGNAL_THREAD_HEAD),
            ("files_struct", "fdt", FILES_FDT),
            ("fdtable", "max_fds", FDT_MAX_FDS),
            ("fdtable", "fd", FDT_FD),
            ("file", "f_path", FILE_F_PATH),
            ("file", "f_op", FILE_F_OP),
            ("file", "private_data", FILE_PRIVATE_DATA),
            ("path", "mnt", PATH_MNT),
            ("path", "dentry", PATH_DENTRY),
            ("mount", "mnt_parent", MOUNT_PARENT),
            ("mount", "mnt_mountpoint", MOUNT_MOUNTPOINT),
            ("mount", "mnt", MOUNT_MNT),
            ("dentry", "d_parent", DENTRY_PARENT),
            ("dentry", "d_name", DENTRY_NAME),
            ("qstr", "len", QSTR_LEN),
            ("qstr", "name", QSTR_NAME),
        ]
        .into_iter()
        .filter(|(ty, field, _)| self.layout.offset(ty, field).is_ok())
        .collect()
    }

    /// A named object to point `f_op` at.
    pub fn symbol(&mut self, name: &str) -> Address {
        let addr = self.alloc(0x100);
        self.symbols.insert(addr, name, None);
        addr
    }

    /// `INIT_LIST_HEAD`
    pub fn init_list(&mut self, head: Address) {
        let prev = self.list_prev();
        self.write_word(at_offset(head, LIST_NEXT), head);
        self.write_word(at_offset(head, prev), head);
    }

    /// `list_add_tail`
    pub fn list_add_tail(&mut self, head: Address, link: Address) {
        let prev = self.list_prev();
        let last = self.read_word(at_offset(head, prev));
        self.write_word(at_offset(link, LIST_NEXT), head);
        self.write_word(at_offset(link, prev), last);
        self.write_word(at_offset(last, LIST_NEXT), link);
        self.write_word(at_offset(head, prev), link);
    }

    pub fn set_next(&mut self, link: Address, next: Address) {
        self.write_word(at_offset(link, LIST_NEXT), next);
    }

    /// An anchor with `len` containers linked at `link_offset`. Returns the
    /// anchor and the link of every container, in list order.
    pub fn list(&mut self, len: usize, link_offset: usize) -> (Address, Vec<Address>) {
        let anchor = self.alloc(0x10);
        self.init_list(anchor);

        let links = (0..len)
            .map(|_| {
                let container = self.alloc(link_offset + 0x10);
                let link = at_offset(container, link_offset);
                self.list_add_tail(anchor, link);
                link
            })
            .collect();

        (anchor, links)
    }

    /// A dentry named `name`. Without a parent it is its own parent, like a
    /// filesystem root.
    pub fn dentry(&mut self, name: &str, parent: Option<Address>) -> Address {
        let dentry = self.alloc(DENTRY_SIZE);
        let name_addr = self.alloc(name.len() + 1);
        self.write_str(name_addr, name);

        let qstr = at_offset(dentry, DENTRY_NAME);
        self.write_u32(at_offset(qstr, QSTR_LEN), name.len() as u32);
        self.write_word(at_offset(qstr, QSTR_NAME), name_addr);
        self.set_parent(dentry, parent.unwrap_or(dentry));

        dentry
    }

    pub fn set_parent(&mut self, dentry: Address, parent: Address) {
        self.write_word(at_offset(dentry, DENTRY_PARENT), parent);
    }

    pub fn set_name_ptr(&mut self, dentry: Address, name: Address) {
        let qstr = at_offset(dentry, DENTRY_NAME);
        self.write_word(at_offset(qstr, QSTR_NAME), name);
    }

    /// A `struct mount` on `mountpoint`. Without a parent it is its own parent.
    pub fn mount(&mut self, mountpoint: Address, parent: Option<Address>) -> Address {
        let mount = self.alloc(MOUNT_SIZE);
        self.write_word(at_offset(mount, MOUNT_MOUNTPOINT), mountpoint);
        self.write_word(at_offset(mount, MOUNT_PARENT), parent.unwrap_or(mount));
        mount
    }

    pub fn set_mount_parent(&mut self, mount: Address, parent: Address) {
        self.write_word(at_offset(mount, MOUNT_PARENT), parent);
    }

    /// The root mount and the root dentry of its filesystem.
    pub fn root_mount(&mut self) -> (Address, Address) {
        let root = self.dentry("/", None);
        let mount = self.mount(root, None);
        (mount, root)
    }

    /// A `struct file` opened through `mount` (a `struct mount`, or null).
    pub fn file(&mut self, f_op: Address, private_data: Address, mount: Address, dentry: Address) -> Address {
        let file = self.alloc(FILE_SIZE);
        let vfsmount = if mount.is_null() {
            Address::NULL
        } else {
            at_offset(mount, MOUNT_MNT)
        };

        let f_path = at_offset(file, FILE_F_PATH);
        self.write_word(at_offset(f_path, PATH_MNT), vfsmount);
        self.write_word(at_offset(f_path, PATH_DENTRY), dentry);
        self.write_word(at_offset(file, FILE_F_OP), f_op);
        self.write_word(at_offset(file, FILE_PRIVATE_DATA), private_data);

        file
    }

    /// A `files_struct` whose descriptor array holds `slots`.
    pub fn files(&mut self, slots: &[Address]) -> Address {
        let width = self.width.bytes();
        let fd = self.alloc(slots.len() * width);
        for (i, &slot) in slots.iter().enumerate() {
            self.write_word(at_offset(fd, i * width), slot);
        }

        let fdt = self.alloc(FDT_SIZE);
        self.write_u32(at_offset(fdt, FDT_MAX_FDS), slots.len() as u32);
        self.write_word(at_offset(fdt, FDT_FD), fd);

        let files = self.alloc(FILES_SIZE);
        self.write_word(at_offset(files, FILES_FDT), fdt);

        files
    }

    pub fn set_max_fds(&mut self, files: Address, max_fds: u32) {
        let fdt = self.read_word(at_offset(files, FILES_FDT));
        self.write_u32(at_offset(fdt, FDT_MAX_FDS), max_fds);
    }

    fn task(&mut self, comm: &str, pid: i32, files: Address) -> Address {
        let task = self.alloc(TASK_SIZE);
        let comm = &comm.as_bytes()[..comm.len().min(TASK_COMM_LEN - 1)];
        let comm = String::from_utf8_lossy(comm).into_owned();
        self.write_str(at_offset(task, TASK_COMM), &comm);
        self.write_u32(at_offset(task, TASK_PID), pid as u32);
        self.write_word(at_offset(task, TASK_FILES), files);
        task
    }

    /// A thread group leader on the process list, with its own signal struct.
    pub fn process(&mut self, comm: &str, pid: i32, files: Address) -> Address {
        let task = self.task(comm, pid, files);
        let init_task = self.init_task;
        self.list_add_tail(at_offset(init_task, TASK_TASKS), at_offset(task, TASK_TASKS));

        let signal = self.alloc(SIGNAL_SIZE);
        self.init_list(at_offset(signal, SIGNAL_THREAD_HEAD));
        self.write_word(at_offset(task, TASK_SIGNAL), signal);
        self.list_add_tail(
            at_offset(signal, SIGNAL_THREAD_HEAD),
            at_offset(task, TASK_THREAD_NODE),
        );

        task
    }

    /// A thread sharing the signal struct of `process`.
    pub fn thread(&mut self, process: Address, comm: &str, pid: i32, files: Address) -> Address {
        let task = self.task(comm, pid, files);
        let signal = self.read_word(at_offset(process, TASK_SIGNAL));
        self.write_word(at_offset(task, TASK_SIGNAL), signal);
        self.list_add_tail(
            at_offset(signal, SIGNAL_THREAD_HEAD),
            at_offset(task, TASK_THREAD_NODE),
        );
        task
    }

    /// A task with neither files nor signal struct, not on the process list.
    pub fn kthread(&mut self, comm: &str, pid: i32) -> Address {
        self.task(comm, pid, Address::NULL)
    }
}
