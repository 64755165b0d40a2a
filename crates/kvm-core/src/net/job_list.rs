//! The multiplexer's job list: a doubly linked list of socket jobs with
//! cursor sentinels.
//!
//! # Why cursors? (for beginners)
//!
//! The service thread walks the list while running jobs, and it releases the
//! list's mutex around every job so other threads can add and remove sockets
//! in between.  A plain index or node reference would be invalidated by those
//! edits.  Instead the walker owns a *cursor*: a sentinel node that lives in
//! the list itself.  [`JobList::next_cursor`] finds the next real job after
//! the cursor and moves the cursor behind it.  Other threads only ever touch
//! real entries, so the cursor is always valid, and entries inserted after it
//! are still visited in the same pass.
//!
//! Nodes live in an [`Arena`], so links are generation-checked indices rather
//! than pointers.

use crate::event::EventTarget;
use crate::mt::{Arena, ArenaIndex};

use super::job::SocketJob;

pub(crate) enum Entry {
    /// `job` is `None` while the job is running outside the list.
    Job {
        socket: EventTarget,
        job: Option<Box<dyn SocketJob>>,
    },
    Cursor,
}

struct Node {
    entry: Entry,
    prev: Option<ArenaIndex>,
    next: Option<ArenaIndex>,
}

#[derive(Default)]
pub(crate) struct JobList {
    nodes: Arena<Node>,
    head: Option<ArenaIndex>,
    tail: Option<ArenaIndex>,
    jobs: usize,
}

impl JobList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of real jobs (cursors excluded).
    pub fn len(&self) -> usize {
        self.jobs
    }

    pub fn is_empty(&self) -> bool {
        self.jobs == 0
    }

    pub fn push_back(&mut self, socket: EventTarget, job: Box<dyn SocketJob>) -> ArenaIndex {
        self.jobs += 1;
        let index = self.nodes.acquire(Node {
            entry: Entry::Job {
                socket,
                job: Some(job),
            },
            prev: None,
            next: None,
        });
        self.link_after(self.tail, index);
        index
    }

    /// Unlinks and returns the entry at `index`.
    pub fn erase(&mut self, index: ArenaIndex) -> Option<Entry> {
        self.unlink(index);
        let node = self.nodes.release(index)?;
        if matches!(node.entry, Entry::Job { .. }) {
            self.jobs -= 1;
        }
        Some(node.entry)
    }

    /// Inserts a cursor at the front of the list.
    pub fn new_cursor(&mut self) -> ArenaIndex {
        let index = self.nodes.acquire(Node {
            entry: Entry::Cursor,
            prev: None,
            next: None,
        });
        self.link_after(None, index);
        index
    }

    /// Returns the first real job after `cursor` and moves the cursor behind
    /// it.  `None` once the end of the list is reached.
    pub fn next_cursor(&mut self, cursor: ArenaIndex) -> Option<ArenaIndex> {
        let mut candidate = self.nodes.get(cursor)?.next;
        while let Some(index) = candidate {
            let node = self.nodes.get(index)?;
            if matches!(node.entry, Entry::Job { .. }) {
                self.unlink(cursor);
                self.link_after(Some(index), cursor);
                return Some(index);
            }
            candidate = node.next;
        }
        None
    }

    pub fn delete_cursor(&mut self, cursor: ArenaIndex) {
        if matches!(self.nodes.get(cursor).map(|node| &node.entry), Some(Entry::Cursor)) {
            self.erase(cursor);
        }
    }

    pub fn socket(&self, index: ArenaIndex) -> Option<EventTarget> {
        match self.nodes.get(index).map(|node| &node.entry) {
            Some(Entry::Job { socket, .. }) => Some(*socket),
            _ => None,
        }
    }

    /// Mutable access to the job slot at `index`.
    pub fn job_mut(&mut self, index: ArenaIndex) -> Option<&mut Option<Box<dyn SocketJob>>> {
        match self.nodes.get_mut(index).map(|node| &mut node.entry) {
            Some(Entry::Job { job, .. }) => Some(job),
            _ => None,
        }
    }

    /// Indices of all real jobs in list order.
    #[cfg(test)]
    pub fn job_indices(&self) -> Vec<ArenaIndex> {
        let mut indices = Vec::with_capacity(self.jobs);
        let mut current = self.head;
        while let Some(index) = current {
            let Some(node) = self.nodes.get(index) else { break };
            if matches!(node.entry, Entry::Job { .. }) {
                indices.push(index);
            }
            current = node.next;
        }
        indices
    }

    // ── Linking ───────────────────────────────────────────────────────────────

    /// Links the detached node `index` after `prev` (at the head if `None`).
    fn link_after(&mut self, prev: Option<ArenaIndex>, index: ArenaIndex) {
        let next = match prev {
            Some(prev) => self.nodes.get(prev).and_then(|node| node.next),
            None => self.head,
        };
        if let Some(node) = self.nodes.get_mut(index) {
            node.prev = prev;
            node.next = next;
        }
        match prev.and_then(|prev| self.nodes.get_mut(prev)) {
            Some(node) => node.next = Some(index),
            None => self.head = Some(index),
        }
        match next.and_then(|next| self.nodes.get_mut(next)) {
            Some(node) => node.prev = Some(index),
            None => self.tail = Some(index),
        }
    }

    fn unlink(&mut self, index: ArenaIndex) {
        let Some(node) = self.nodes.get_mut(index) else {
            return;
        };
        let (prev, next) = (node.prev.take(), node.next.take());
        match prev.and_then(|prev| self.nodes.get_mut(prev)) {
            Some(node) => node.next = next,
            None => self.head = next,
        }
        match next.and_then(|next| self.nodes.get_mut(next)) {
            Some(node) => node.prev = prev,
            None => self.tail = prev,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::job::Readiness;
    use mio::event::Source;
    use mio::Interest;

    /// A job that is never polled; only its identity matters here.
    struct Inert(mio::net::UdpSocket);

    impl SocketJob for Inert {
        fn source(&mut self) -> &mut dyn Source {
            &mut self.0
        }

        fn interest(&self) -> Option<Interest> {
            None
        }

        fn run(self: Box<Self>, _ready: Readiness) -> Option<Box<dyn SocketJob>> {
            Some(self)
        }
    }

    fn inert() -> Box<dyn SocketJob> {
        let socket = mio::net::UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        Box::new(Inert(socket))
    }

    fn drain(list: &mut JobList, cursor: ArenaIndex) -> Vec<EventTarget> {
        let mut visited = Vec::new();
        while let Some(index) = list.next_cursor(cursor) {
            visited.push(list.socket(index).unwrap());
        }
        visited
    }

    #[test]
    fn test_cursor_visits_every_job_in_order() {
        // Arrange
        let mut list = JobList::new();
        let sockets: Vec<EventTarget> = (0..4).map(|_| EventTarget::allocate()).collect();
        for &socket in &sockets {
            list.push_back(socket, inert());
        }

        // Act
        let cursor = list.new_cursor();
        let visited = drain(&mut list, cursor);
        list.delete_cursor(cursor);

        // Assert
        assert_eq!(visited, sockets);
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn test_job_added_mid_walk_is_visited() {
        // Arrange
        let mut list = JobList::new();
        let first = EventTarget::allocate();
        let late = EventTarget::allocate();
        list.push_back(first, inert());
        let cursor = list.new_cursor();

        // Act
        let a = list.next_cursor(cursor).and_then(|index| list.socket(index));
        list.push_back(late, inert());
        let b = list.next_cursor(cursor).and_then(|index| list.socket(index));

        // Assert
        assert_eq!(a, Some(first));
        assert_eq!(b, Some(late));
        assert_eq!(list.next_cursor(cursor), None);
    }

    #[test]
    fn test_erased_job_ahead_of_cursor_is_skipped() {
        // Arrange
        let mut list = JobList::new();
        let keep = EventTarget::allocate();
        let gone = EventTarget::allocate();
        let last = EventTarget::allocate();
        list.push_back(keep, inert());
        let doomed = list.push_back(gone, inert());
        list.push_back(last, inert());
        let cursor = list.new_cursor();

        // Act
        list.next_cursor(cursor);
        list.erase(doomed);
        let visited = drain(&mut list, cursor);

        // Assert
        assert_eq!(visited, vec![last]);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_erasing_current_job_keeps_cursor_valid() {
        let mut list = JobList::new();
        let a = EventTarget::allocate();
        let b = EventTarget::allocate();
        list.push_back(a, inert());
        list.push_back(b, inert());
        let cursor = list.new_cursor();

        let current = list.next_cursor(cursor).unwrap();
        list.erase(current);

        assert_eq!(drain(&mut list, cursor), vec![b]);
    }

    #[test]
    fn test_two_cursors_walk_independently() {
        let mut list = JobList::new();
        let sockets: Vec<EventTarget> = (0..3).map(|_| EventTarget::allocate()).collect();
        for &socket in &sockets {
            list.push_back(socket, inert());
        }
        let first = list.new_cursor();
        list.next_cursor(first);
        let second = list.new_cursor();

        assert_eq!(drain(&mut list, second), sockets);
        assert_eq!(drain(&mut list, first), sockets[1..].to_vec());
        assert_eq!(list.job_indices().len(), 3);
    }

    #[test]
    fn test_delete_cursor_ignores_real_jobs() {
        let mut list = JobList::new();
        let job = list.push_back(EventTarget::allocate(), inert());

        list.delete_cursor(job);

        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_list_holding_only_a_cursor_is_empty() {
        // Arrange
        let mut list = JobList::new();
        let job = list.push_back(EventTarget::allocate(), inert());
        let cursor = list.new_cursor();

        // Act
        list.erase(job);

        // Assert
        assert!(list.is_empty());
        list.delete_cursor(cursor);
    }
}
