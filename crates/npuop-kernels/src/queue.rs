//! Bounded buffer queues between pipeline stages.

use std::collections::VecDeque;

use crate::error::DeviceFault;

/// A stage queue holding at most `depth` buffers (one or two).
#[derive(Debug)]
pub struct TQueue<T> {
    name: &'static str,
    depth: usize,
    slots: VecDeque<T>,
}

impl<T> TQueue<T> {
    pub fn new(name: &'static str, depth: u64) -> Self {
        let depth = depth.clamp(1, 2) as usize;
        Self { name, depth, slots: VecDeque::with_capacity(depth) }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn enque(&mut self, core: u64, item: T) -> Result<(), DeviceFault> {
        if self.slots.len() == self.depth {
            return Err(DeviceFault::QueueOverflow { core, queue: self.name, depth: self.depth });
        }
        self.slots.push_back(item);
        Ok(())
    }

    pub fn deque(&mut self, core: u64) -> Result<T, DeviceFault> {
        self.slots
            .pop_front()
            .ok_or_else(|| DeviceFault::core(core, format!("{} queue is empty", self.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_is_clamped() {
        assert_eq!(TQueue::<u8>::new("in", 0).depth(), 1);
        assert_eq!(TQueue::<u8>::new("in", 5).depth(), 2);
    }

    #[test]
    fn overflow_and_underflow() {
        let mut q = TQueue::new("out", 2);
        q.enque(4, 1).unwrap();
        q.enque(4, 2).unwrap();
        assert_eq!(q.enque(4, 3), Err(DeviceFault::QueueOverflow { core: 4, queue: "out", depth: 2 }));
        assert_eq!(q.deque(4).unwrap(), 1);
        assert_eq!(q.deque(4).unwrap(), 2);
        assert!(matches!(q.deque(4), Err(DeviceFault::CoreFault { core: 4, .. })));
    }
}
