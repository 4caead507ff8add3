//! Open file tables of every task in the image, in the manner of `lsof`.

use memflow::prelude::v1::*;

use std::fmt;
use std::io::Write;

use log::*;

use crate::image::{at_offset, KernelImage};
use crate::kernel::tasks::{TaskInfo, TaskListOffsets, TaskOffsets};
use crate::version::KernelVersion;

pub mod path;

use path::PathOffsets;

/// `sysctl_nr_open` can not be raised above this.
pub const NR_OPEN_MAX: usize = 1 << 20;

pub const SECTION_SEPARATOR: &str = "*********************************";

#[derive(Clone, Debug)]
pub struct LsofConfig {
    /// Older kernels lay out `files_struct` and `file` differently.
    pub min_version: KernelVersion,
    /// Descriptors whose `f_op` symbol starts with this also report `private_data`.
    pub special_fops_prefix: String,
    /// Upper bound for `fdtable.max_fds`.
    pub max_fds: usize,
    /// Upper bound for dentry and mount chains.
    pub max_path_depth: usize,
}

impl Default for LsofConfig {
    fn default() -> Self {
        Self {
            min_version: KernelVersion::new(3, 18, 0),
            special_fops_prefix: "ion_fops".to_string(),
            max_fds: NR_OPEN_MAX,
            max_path_depth: path::MAX_PATH_DEPTH,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FdtOffsets {
    /// `files_struct.fdt`
    pub fdt: usize,
    /// `fdtable.max_fds`
    pub max_fds: usize,
    /// `fdtable.fd`
    pub fd: usize,
}

impl FdtOffsets {
    pub fn resolve<I: KernelImage + ?Sized>(image: &I) -> Result<Self> {
        Ok(Self {
            fdt: image.field_offset("files_struct", "fdt")?,
            max_fds: image.field_offset("fdtable", "max_fds")?,
            fd: image.field_offset("fdtable", "fd")?,
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FileOffsets {
    pub f_op: usize,
    pub private_data: usize,
}

impl FileOffsets {
    pub fn resolve<I: KernelImage + ?Sized>(image: &I) -> Result<Self> {
        Ok(Self {
            f_op: image.field_offset("file", "f_op")?,
            private_data: image.field_offset("file", "private_data")?,
        })
    }
}

/// One open descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenFile {
    pub index: usize,
    pub file: Address,
    /// Symbol of `file->f_op`.
    pub fops: String,
    pub path: String,
    /// Only kept for descriptors matching [`LsofConfig::special_fops_prefix`].
    pub private_data: Option<Address>,
}

impl fmt::Display for OpenFile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            " {:8} file : 0x{:16x} {:32} {:32}",
            self.index,
            self.file.to_umem(),
            self.fops,
            self.path
        )?;
        if let Some(private_data) = self.private_data {
            write!(f, " client : 0x{:x}", private_data.to_umem())?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskKind {
    Process,
    Thread,
}

/// Header line of one task in the report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskHeader {
    pub kind: TaskKind,
    pub info: TaskInfo,
}

impl fmt::Display for TaskHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let info = &self.info;
        match self.kind {
            TaskKind::Process => write!(
                f,
                " Task: 0x{:x}, comm: {}, pid : {}, files : 0x{:x}",
                info.task.to_umem(),
                info.comm,
                info.pid,
                info.files.to_umem()
            ),
            TaskKind::Thread => write!(
                f,
                " Thread: 0x{:x}, thread_name: {}, thread_pid : {}, thread_files : 0x{:x}",
                info.task.to_umem(),
                info.comm,
                info.pid,
                info.files.to_umem()
            ),
        }
    }
}

fn write_error(e: std::io::Error) -> Error {
    warn!("unable to write report: {}", e);
    Error(ErrorOrigin::Other, ErrorKind::UnableToWriteFile)
}

/// Writes the open files of every process and thread to `out`.
///
/// Kernels older than [`LsofConfig::min_version`] get a single line saying
/// so. Only missing layout entries and failed writes are errors, anything
/// unreadable in the image is skipped.
pub fn dump_lsof<I, W>(image: &mut I, config: &LsofConfig, out: &mut W) -> Result<()>
where
    I: KernelImage + ?Sized,
    W: Write,
{
    let version = image.kernel_version();

    if version < config.min_version {
        info!("kernel {} is not supported", version);
        writeln!(
            out,
            "Kernel version {}.{} and above are supported, current version {}.{}",
            config.min_version.major, config.min_version.minor, version.major, version.minor
        )
        .map_err(write_error)?;
        return Ok(());
    }

    Lsof::new(image, config)?.dump(out)
}

/// Reads descriptor tables of one image.
pub struct Lsof<'a, I: ?Sized> {
    image: &'a mut I,
    config: &'a LsofConfig,
    task: TaskOffsets,
    fdt: FdtOffsets,
    file: FileOffsets,
    path: PathOffsets,
}

impl<'a, I: KernelImage + ?Sized> Lsof<'a, I> {
    /// Fails if the image layout lacks any field the tasks are enumerated or
    /// the tables are read through, so nothing is written for such an image.
    pub fn new(image: &'a mut I, config: &'a LsofConfig) -> Result<Self> {
        TaskListOffsets::resolve(&*image)?;
        let task = TaskOffsets::resolve(&*image)?;
        let fdt = FdtOffsets::resolve(&*image)?;
        let file = FileOffsets::resolve(&*image)?;
        let path = PathOffsets::resolve(&*image)?;

        Ok(Self {
            image,
            config,
            task,
            fdt,
            file,
            path,
        })
    }

    pub fn dump<W: Write>(&mut self, out: &mut W) -> Result<()> {
        let processes = self.image.processes()?;

        info!("dumping open files of {} processes", processes.len());

        for process in processes {
            let header = self.task_header(process, TaskKind::Process);
            writeln!(out, "{}", header).map_err(write_error)?;

            let mut tables = vec![header.info.files];
            self.write_open_files(header.info.files, out)?;

            for thread in self.image.threads(process)? {
                if thread == process {
                    continue;
                }

                let header = self.task_header(thread, TaskKind::Thread);
                writeln!(out, "{}", header).map_err(write_error)?;

                let files = header.info.files;
                if files.is_null() || tables.contains(&files) {
                    trace!("thread {:x} shares its file table", thread.to_umem());
                    continue;
                }

                tables.push(files);
                self.write_open_files(files, out)?;
            }

            writeln!(out, "{}", SECTION_SEPARATOR).map_err(write_error)?;
        }

        Ok(())
    }

    pub fn task_header(&mut self, task: Address, kind: TaskKind) -> TaskHeader {
        TaskHeader {
            kind,
            info: TaskInfo::read(&mut *self.image, &self.task, task),
        }
    }

    fn write_open_files<W: Write>(&mut self, files: Address, out: &mut W) -> Result<()> {
        for open_file in self.open_files(files) {
            writeln!(out, "{}", open_file).map_err(write_error)?;
        }
        Ok(())
    }

    /// Every open descriptor of the `files_struct` at `files`.
    ///
    /// Empty slots, unreadable files and files whose operations do not
    /// resolve to a symbol are left out.
    pub fn open_files(&mut self, files: Address) -> Vec<OpenFile> {
        if files.is_null() {
            return vec![];
        }

        let (fd, max_fds) = match self.fd_array(files) {
            Ok(table) => table,
            Err(e) => {
                debug!("unable to read fd table of {:x}: {}", files.to_umem(), e);
                return vec![];
            }
        };

        let width = self.image.pointer_width().bytes();

        (0..max_fds)
            .filter_map(|index| {
                let file = self.image.read_word(at_offset(fd, index * width)).ok()?;
                if file.is_null() {
                    None
                } else {
                    self.open_file(index, file)
                }
            })
            .collect()
    }

    /// Base and length of the descriptor array.
    fn fd_array(&mut self, files: Address) -> Result<(Address, usize)> {
        let fdt = self.image.read_word(at_offset(files, self.fdt.fdt))?;
        if fdt.is_null() {
            return Ok((Address::NULL, 0));
        }

        let max_fds = self.image.read_u32(at_offset(fdt, self.fdt.max_fds))? as usize;
        let fd = self.image.read_word(at_offset(fdt, self.fdt.fd))?;

        if max_fds > self.config.max_fds {
            warn!(
                "fdtable {:x} claims {} descriptors, reading the first {}",
                fdt.to_umem(),
                max_fds,
                self.config.max_fds
            );
            return Ok((fd, self.config.max_fds));
        }

        Ok((fd, max_fds))
    }

    fn open_file(&mut self, index: usize, file: Address) -> Option<OpenFile> {
        let f_op = self.image.read_word(at_offset(file, self.file.f_op)).ok()?;
        let private_data = self
            .image
            .read_word(at_offset(file, self.file.private_data))
            .unwrap_or(Address::NULL);

        let fops = match self.image.lookup_symbol(f_op) {
            Some((name, _)) => name.to_string(),
            None => {
                debug!("fd {}: f_op {:x} does not resolve", index, f_op.to_umem());
                return None;
            }
        };

        let path = path::file_path(&mut *self.image, &self.path, file, self.config.max_path_depth);

        let private_data = if fops.starts_with(self.config.special_fops_prefix.as_str()) {
            Some(private_data)
        } else {
            None
        };

        Some(OpenFile {
            index,
            file,
            fops,
            path,
            private_data,
        })
    }
}
