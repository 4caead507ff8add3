//! Open file reconstruction for captured Linux kernel memory images.
//!
//! A [`Ramdump`] combines raw memory ([`SnapshotMemory`] or any memflow
//! view through [`MemflowMemory`]) with structure offsets ([`TypeLayout`])
//! and kernel symbols ([`SymbolTable`]). On top of it, [`ListWalker`]
//! traverses intrusive `list_head` lists and [`dump_lsof`] lists every open
//! descriptor of every task with its path.
//!
//! Nothing in the image is trusted. Broken lists and parent chains end the
//! affected walk with a warning and the rest of the report carries on.

pub mod image;
pub mod kernel;
pub mod layout;
pub mod list;
pub mod lsof;
pub mod mem;
pub mod symbols;
pub mod version;

#[cfg(test)]
mod testutil;

pub use image::{KernelImage, PointerWidth};
pub use kernel::Ramdump;
pub use layout::TypeLayout;
pub use list::{container_of, ListWalker};
pub use lsof::{dump_lsof, LsofConfig, OpenFile};
pub use mem::{DumpMemory, MemflowMemory, SnapshotMemory};
pub use symbols::SymbolTable;
pub use version::KernelVersion;
