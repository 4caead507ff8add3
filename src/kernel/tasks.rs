use memflow::prelude::v1::*;

use log::*;

use crate::image::{at_offset, KernelImage};
use crate::list::ListWalker;

/// `TASK_COMM_LEN`, including the terminating NUL.
pub const TASK_COMM_LEN: usize = 16;

/// Offsets into `struct task_struct` needed to describe a task.
#[derive(Clone, Copy, Debug)]
pub struct TaskOffsets {
    pub comm: usize,
    pub pid: usize,
    pub files: usize,
}

impl TaskOffsets {
    pub fn resolve<I: KernelImage + ?Sized>(image: &I) -> Result<Self> {
        Ok(Self {
            comm: image.field_offset("task_struct", "comm")?,
            pid: image.field_offset("task_struct", "pid")?,
            files: image.field_offset("task_struct", "files")?,
        })
    }
}

/// Offsets of the lists tasks are enumerated through.
#[derive(Clone, Copy, Debug)]
pub struct TaskListOffsets {
    /// `task_struct.tasks`, linked from `init_task.tasks`
    pub tasks: usize,
    pub signal: usize,
    /// `signal_struct.thread_head`
    pub thread_head: usize,
    /// `task_struct.thread_node`, linked from `thread_head`
    pub thread_node: usize,
}

impl TaskListOffsets {
    pub fn resolve<I: KernelImage + ?Sized>(image: &I) -> Result<Self> {
        Ok(Self {
            tasks: image.field_offset("task_struct", "tasks")?,
            signal: image.field_offset("task_struct", "signal")?,
            thread_head: image.field_offset("signal_struct", "thread_head")?,
            thread_node: image.field_offset("task_struct", "thread_node")?,
        })
    }
}

/// Identity of one task as read from the image.
///
/// Fields that can not be read come back empty rather than failing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskInfo {
    pub task: Address,
    pub comm: String,
    pub pid: i32,
    pub files: Address,
}

impl TaskInfo {
    pub fn read<I: KernelImage + ?Sized>(image: &mut I, offsets: &TaskOffsets, task: Address) -> Self {
        let comm = image
            .read_cstring(at_offset(task, offsets.comm), TASK_COMM_LEN)
            .unwrap_or_default();
        let pid = image
            .read_u32(at_offset(task, offsets.pid))
            .map(|pid| pid as i32)
            .unwrap_or(0);
        let files = image
            .read_word(at_offset(task, offsets.files))
            .unwrap_or_else(|e| {
                debug!("unable to read files of task {:x}: {}", task.to_umem(), e);
                Address::NULL
            });

        Self {
            task,
            comm,
            pid,
            files,
        }
    }
}

/// Every process on `init_task.tasks`, not including `init_task` itself.
pub fn process_list<I: KernelImage + ?Sized>(image: &mut I, init_task: Address) -> Result<Vec<Address>> {
    let offsets = TaskListOffsets::resolve(&*image)?;

    let procs = ListWalker::new(image, at_offset(init_task, offsets.tasks), offsets.tasks)
        .collect::<Vec<_>>();

    debug!("found {} processes", procs.len());

    Ok(procs)
}

/// Every thread on `task->signal->thread_head`, the group leader included.
pub fn thread_list<I: KernelImage + ?Sized>(image: &mut I, task: Address) -> Result<Vec<Address>> {
    let offsets = TaskListOffsets::resolve(&*image)?;

    let signal = match image.read_word(at_offset(task, offsets.signal)) {
        Ok(signal) if !signal.is_null() => signal,
        Ok(_) => return Ok(vec![]),
        Err(e) => {
            debug!("unable to read signal of task {:x}: {}", task.to_umem(), e);
            return Ok(vec![]);
        }
    };

    let head = at_offset(signal, offsets.thread_head);
    Ok(ListWalker::new(image, head, offsets.thread_node).collect())
}
