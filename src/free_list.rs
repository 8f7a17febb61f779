//! Circular doubly linked list of unreferenced buffers, threaded through
//! `Buffer::free`. Front = released longest ago, the next one to recycle.

use super::*;
use buf::{Buffer, RingLinks};
use common::*;

#[derive(Default)]
pub struct FreeList {
    head: Option<SlotId>,
    len: usize,
}

impl FreeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    #[allow(unused)]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn push_back(&mut self, bufs: &mut [Buffer], id: SlotId) {
        assert!(
            !bufs[id].on_free_list(),
            "InvariantViolation: buffer {} already on the free list",
            id
        );
        match self.head {
            None => {
                bufs[id].free = Some(RingLinks { prev: id, next: id });
                self.head = Some(id);
            }
            Some(head) => {
                let tail = Self::links(bufs, head).prev;
                bufs[id].free = Some(RingLinks {
                    prev: tail,
                    next: head,
                });
                Self::links_mut(bufs, tail).next = id;
                Self::links_mut(bufs, head).prev = id;
            }
        }
        self.len += 1;
    }

    /// Queue `id` to be recycled before everything else.
    pub fn push_front(&mut self, bufs: &mut [Buffer], id: SlotId) {
        self.push_back(bufs, id);
        self.head = Some(id);
    }

    pub fn pop_front(&mut self, bufs: &mut [Buffer]) -> Option<SlotId> {
        let head = self.head?;
        self.remove(bufs, head);
        Some(head)
    }

    /// Unlink `id` from anywhere in the ring, no-op if it is not on it.
    pub fn remove(&mut self, bufs: &mut [Buffer], id: SlotId) {
        let Some(links) = bufs[id].free.take() else {
            return;
        };
        if links.next == id {
            self.head = None;
        } else {
            Self::links_mut(bufs, links.prev).next = links.next;
            Self::links_mut(bufs, links.next).prev = links.prev;
            if self.head == Some(id) {
                self.head = Some(links.next);
            }
        }
        self.len -= 1;
    }

    /// Buffers from front to back.
    pub fn ids(&self, bufs: &[Buffer]) -> Vec<SlotId> {
        let mut ids = Vec::with_capacity(self.len);
        if let Some(head) = self.head {
            let mut cur = head;
            loop {
                ids.push(cur);
                cur = Self::links(bufs, cur).next;
                if cur == head {
                    break;
                }
            }
        }
        ids
    }

    fn links(bufs: &[Buffer], id: SlotId) -> RingLinks {
        bufs[id]
            .free
            .unwrap_or_else(|| panic!("InvariantViolation: buffer {} not on the free list", id))
    }

    fn links_mut(bufs: &mut [Buffer], id: SlotId) -> &mut RingLinks {
        bufs[id]
            .free
            .as_mut()
            .unwrap_or_else(|| panic!("InvariantViolation: buffer {} not on the free list", id))
    }
}
