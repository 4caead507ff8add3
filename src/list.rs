//! Traversal of kernel style intrusive circular lists (`struct list_head`).
//!
//! A list is anchored at a sentinel link that is not part of any container.
//! Every other link lives `link_offset` bytes into its container, so the
//! container is recovered by subtracting that offset from the link address.
//!
//! Memory images may hold broken lists. All walks share one guard, which
//! stops at the anchor, at a null link, or at the first link seen twice
//! (logged as corruption), so a walk always terminates.

use memflow::prelude::v1::*;

use std::collections::HashSet;

use log::*;

use crate::image::{at_offset, KernelImage};

/// Address of the structure that embeds the field at `link`.
pub fn container_of(link: Address, offset: usize) -> Address {
    Address::from(link.to_umem().wrapping_sub(offset as umem))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Next,
    Prev,
}

/// Offsets of `next` and `prev` within `struct list_head`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkLayout {
    pub next: usize,
    pub prev: usize,
}

impl LinkLayout {
    /// Falls back to the natural `{ next, prev }` layout when the image has
    /// no entry for `list_head`.
    pub fn of<I: KernelImage + ?Sized>(image: &I) -> Self {
        let width = image.pointer_width().bytes();
        Self {
            next: image.field_offset("list_head", "next").unwrap_or(0),
            prev: image.field_offset("list_head", "prev").unwrap_or(width),
        }
    }

    fn offset(&self, dir: Direction) -> usize {
        match dir {
            Direction::Next => self.next,
            Direction::Prev => self.prev,
        }
    }
}

/// Outcome of feeding one successor link to a [`Cursor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// The link was accepted, here is its container.
    Container(Address),
    /// Back at the anchor, at a null link, or the walk already finished.
    End,
    /// The link was already visited in this walk.
    Corrupted(Address),
}

/// Position and history of one walk over one list.
///
/// The cursor does no I/O. Callers read the successor of [`Cursor::current`]
/// and feed it to [`Cursor::step`], which applies the termination rules.
#[derive(Clone, Debug)]
pub struct Cursor {
    anchor: Address,
    link_offset: usize,
    current: Address,
    visited: HashSet<umem>,
    finished: bool,
    corrupted: bool,
}

impl Cursor {
    pub fn new(anchor: Address, link_offset: usize) -> Self {
        Self {
            anchor,
            link_offset,
            current: anchor,
            visited: HashSet::new(),
            finished: false,
            corrupted: false,
        }
    }

    pub fn anchor(&self) -> Address {
        self.anchor
    }

    /// Link most recently accepted, the anchor before the first step.
    pub fn current(&self) -> Address {
        self.current
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted
    }

    pub fn step(&mut self, link: Address) -> Step {
        if self.finished {
            return Step::End;
        }

        if link == self.anchor || link.is_null() {
            self.finished = true;
            return Step::End;
        }

        if !self.visited.insert(link.to_umem()) {
            self.finished = true;
            self.corrupted = true;
            return Step::Corrupted(link);
        }

        self.current = link;
        Step::Container(container_of(link, self.link_offset))
    }
}

/// Walks one list in an image.
///
/// Iterating yields container addresses following `next` from the anchor.
/// [`ListWalker::walk`] and [`ListWalker::walk_prev`] push containers into a
/// callback instead. A walker is single pass: iteration and both walks share
/// the same cursor, so build a new walker to traverse the list again.
pub struct ListWalker<'a, I: ?Sized> {
    image: &'a mut I,
    links: LinkLayout,
    cursor: Cursor,
}

impl<'a, I: KernelImage + ?Sized> ListWalker<'a, I> {
    /// `node_addr` is the anchor link, `link_offset` the offset of the link
    /// field within the container type.
    pub fn new(image: &'a mut I, node_addr: Address, link_offset: usize) -> Self {
        let links = LinkLayout::of(&*image);
        Self {
            image,
            links,
            cursor: Cursor::new(node_addr, link_offset),
        }
    }

    pub fn anchor(&self) -> Address {
        self.cursor.anchor()
    }

    /// Whether this walk stopped on a repeated link.
    pub fn is_corrupted(&self) -> bool {
        self.cursor.is_corrupted()
    }

    /// A list is empty when the anchor points back at itself. A null or
    /// unreadable anchor counts as empty.
    pub fn is_empty(&mut self) -> bool {
        let anchor = self.cursor.anchor();
        if anchor.is_null() {
            return true;
        }

        match self.image.read_word(at_offset(anchor, self.links.next)) {
            Ok(next) => next == anchor,
            Err(e) => {
                debug!("unable to read list anchor {:x}: {}", anchor.to_umem(), e);
                true
            }
        }
    }

    /// Calls `func` with every container from the one holding `start` up to
    /// the anchor. Extra arguments are passed by capturing them in `func`.
    ///
    /// Starting at the anchor itself begins with its successor.
    pub fn walk<F>(&mut self, start: Address, mut func: F)
    where
        F: FnMut(&mut I, Address),
    {
        if self.is_empty() {
            return;
        }

        let first = if start == self.cursor.anchor() {
            self.read_link(start, Direction::Next)
        } else {
            start
        };

        self.run(first, Direction::Next, &mut func);
    }

    /// Calls `func` with every container before `start`, following `prev`
    /// back to the anchor.
    pub fn walk_prev<F>(&mut self, start: Address, mut func: F)
    where
        F: FnMut(&mut I, Address),
    {
        if self.is_empty() || start.is_null() {
            return;
        }

        let first = self.read_link(start, Direction::Prev);
        self.run(first, Direction::Prev, &mut func);
    }

    fn run<F>(&mut self, first: Address, dir: Direction, func: &mut F)
    where
        F: FnMut(&mut I, Address),
    {
        let mut step = self.cursor.step(first);

        loop {
            match step {
                Step::Container(container) => {
                    trace!("list {:x}: {:x}", self.anchor().to_umem(), container.to_umem());
                    func(&mut *self.image, container);
                    let link = self.read_link(self.cursor.current(), dir);
                    step = self.cursor.step(link);
                }
                Step::End => break,
                Step::Corrupted(link) => {
                    self.report_cycle(link);
                    break;
                }
            }
        }
    }

    /// An unreadable link reads as null, which ends the walk.
    fn read_link(&mut self, link: Address, dir: Direction) -> Address {
        self.image
            .read_word(at_offset(link, self.links.offset(dir)))
            .unwrap_or_else(|e| {
                debug!("unable to read list link {:x}: {}", link.to_umem(), e);
                Address::NULL
            })
    }

    fn report_cycle(&self, link: Address) {
        warn!(
            "cycle found at {:x} in list anchored at {:x}, list is corrupted",
            link.to_umem(),
            self.anchor().to_umem()
        );
    }
}

impl<'a, I: KernelImage + ?Sized> Iterator for ListWalker<'a, I> {
    type Item = Address;

    fn next(&mut self) -> Option<Address> {
        if self.cursor.is_finished() || self.cursor.anchor().is_null() {
            return None;
        }

        let link = self.read_link(self.cursor.current(), Direction::Next);

        match self.cursor.step(link) {
            Step::Container(container) => Some(container),
            Step::End => None,
            Step::Corrupted(link) => {
                self.report_cycle(link);
                None
            }
        }
    }
}
