//! Bounded work-stealing deque (Arora, Blumofe and Plaxton)
//!
//! The owner pushes and pops at `bottom`; thieves take from `top`. `top` and a
//! steal-epoch tag share one 64-bit word (`top` in the low half, tag in the
//! high half) so that every thief and the owner's last-element pop race on a
//! single compare-and-swap. The tag is bumped whenever the owner resets the
//! deque to empty, which defeats ABA on `top`.
//!
//! The array is not circular: once `bottom` reaches capacity, `push` fails
//! until the owner drains the deque and the indices reset.

use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

fn pack(top: usize, tag: u32) -> u64 {
    ((tag as u64) << 32) | (top as u64 & 0xffff_ffff)
}

fn unpack(age: u64) -> (usize, u32) {
    ((age & 0xffff_ffff) as usize, (age >> 32) as u32)
}

struct Inner<T> {
    age: CachePadded<AtomicU64>,
    bottom: CachePadded<AtomicUsize>,
    slots: Box<[AtomicPtr<T>]>,
    _marker: PhantomData<T>,
}

// Items are handed across threads by value; the protocol guarantees each
// slot pointer is reclaimed by exactly one side.
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let (top, _) = unpack(*self.age.get_mut());
        let bottom = *self.bottom.get_mut();
        for slot in &mut self.slots[top.min(bottom)..bottom] {
            let item = *slot.get_mut();
            if !item.is_null() {
                // SAFETY: slots in [top, bottom) hold live boxes nobody took.
                drop(unsafe { Box::from_raw(item) });
            }
        }
    }
}

/// Create a deque holding at most `capacity` items.
pub fn deque<T: Send>(capacity: usize) -> (Worker<T>, Stealer<T>) {
    let capacity = capacity.clamp(1, u32::MAX as usize);
    let slots = (0..capacity)
        .map(|_| AtomicPtr::new(ptr::null_mut()))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let inner = Arc::new(Inner {
        age: CachePadded::new(AtomicU64::new(pack(0, 0))),
        bottom: CachePadded::new(AtomicUsize::new(0)),
        slots,
        _marker: PhantomData,
    });
    (
        Worker {
            inner: inner.clone(),
            _not_sync: PhantomData,
        },
        Stealer { inner },
    )
}

/// Owner end. Not `Sync`: only one thread may touch `bottom`.
pub struct Worker<T> {
    inner: Arc<Inner<T>>,
    _not_sync: PhantomData<Cell<()>>,
}

impl<T: Send> Worker<T> {
    /// Push at the bottom, handing the item back when the array is full.
    pub fn push(&self, item: T) -> Result<(), T> {
        let inner = &*self.inner;
        let bot = inner.bottom.load(Ordering::SeqCst);
        if bot >= inner.slots.len() {
            return Err(item);
        }
        inner.slots[bot].store(Box::into_raw(Box::new(item)), Ordering::SeqCst);
        inner.bottom.store(bot + 1, Ordering::SeqCst);
        Ok(())
    }

    /// Pop the most recently pushed item.
    pub fn pop(&self) -> Option<T> {
        let inner = &*self.inner;
        let mut bot = inner.bottom.load(Ordering::SeqCst);
        if bot == 0 {
            return None;
        }
        bot -= 1;
        inner.bottom.store(bot, Ordering::SeqCst);

        let item = inner.slots[bot].load(Ordering::SeqCst);
        let old_age = inner.age.load(Ordering::SeqCst);
        let (top, tag) = unpack(old_age);
        if bot > top {
            // SAFETY: thieves only take indices below `bottom`.
            return Some(unsafe { take(item) });
        }

        // At most one item left: reset and race any thief for it.
        inner.bottom.store(0, Ordering::SeqCst);
        let new_age = pack(0, tag.wrapping_add(1));
        if bot == top
            && inner
                .age
                .compare_exchange(old_age, new_age, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            // SAFETY: the CAS excluded every thief from this slot.
            return Some(unsafe { take(item) });
        }
        inner.age.store(new_age, Ordering::SeqCst);
        None
    }

    /// Approximate number of queued items.
    pub fn len(&self) -> usize {
        let (top, _) = unpack(self.inner.age.load(Ordering::SeqCst));
        self.inner.bottom.load(Ordering::SeqCst).saturating_sub(top)
    }

    /// Whether the deque looks empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of items.
    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }
}

/// Result of a steal attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Steal<T> {
    /// Nothing to take.
    Empty,
    /// Took an item.
    Success(T),
    /// Lost a race; the caller may try again later.
    Retry,
}

impl<T> Steal<T> {
    /// The stolen item, if any.
    pub fn success(self) -> Option<T> {
        match self {
            Steal::Success(item) => Some(item),
            _ => None,
        }
    }
}

/// Thief end; cheap to clone.
pub struct Stealer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Stealer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send> Stealer<T> {
    /// Try to take the oldest item. Never blocks.
    pub fn steal(&self) -> Steal<T> {
        let inner = &*self.inner;
        let old_age = inner.age.load(Ordering::SeqCst);
        let (top, tag) = unpack(old_age);
        let bot = inner.bottom.load(Ordering::SeqCst);
        if bot <= top {
            return Steal::Empty;
        }
        let item = inner.slots[top].load(Ordering::SeqCst);
        let new_age = pack(top + 1, tag);
        match inner
            .age
            .compare_exchange(old_age, new_age, Ordering::SeqCst, Ordering::SeqCst)
        {
            // SAFETY: advancing `top` gave this thief sole ownership of the slot.
            Ok(_) => Steal::Success(unsafe { take(item) }),
            Err(_) => Steal::Retry,
        }
    }

    /// Whether the deque looks empty.
    pub fn is_empty(&self) -> bool {
        let (top, _) = unpack(self.inner.age.load(Ordering::SeqCst));
        self.inner.bottom.load(Ordering::SeqCst) <= top
    }
}

unsafe fn take<T>(item: *mut T) -> T {
    debug_assert!(!item.is_null());
    // SAFETY: caller guarantees exclusive ownership of a pointer produced by
    // `Box::into_raw` in `push`.
    *unsafe { Box::from_raw(item) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[test]
    fn test_owner_pops_lifo() {
        let (worker, _stealer) = deque(8);
        for i in 0..5 {
            worker.push(i).unwrap();
        }
        let popped: Vec<_> = std::iter::from_fn(|| worker.pop()).collect();
        assert_eq!(popped, vec![4, 3, 2, 1, 0]);
        assert!(worker.is_empty());
    }

    #[test]
    fn test_thieves_take_oldest_first() {
        let (worker, stealer) = deque(8);
        worker.push("a").unwrap();
        worker.push("b").unwrap();
        assert_eq!(stealer.steal(), Steal::Success("a"));
        assert_eq!(worker.pop(), Some("b"));
        assert_eq!(stealer.steal(), Steal::Empty);
    }

    #[test]
    fn test_push_overflow_returns_item() {
        let (worker, _stealer) = deque(2);
        worker.push(1).unwrap();
        worker.push(2).unwrap();
        assert_eq!(worker.push(3), Err(3));
        assert_eq!(worker.pop(), Some(2));
        assert!(worker.push(3).is_ok());
    }

    #[test]
    fn test_steal_from_empty_leaves_deque_usable() {
        let (worker, stealer) = deque::<u32>(4);
        for _ in 0..10 {
            assert_eq!(stealer.steal(), Steal::Empty);
        }
        worker.push(9).unwrap();
        assert_eq!(worker.pop(), Some(9));
        assert_eq!(worker.pop(), None);
    }

    #[test]
    fn test_fully_stolen_deque_resets_on_pop() {
        let (worker, stealer) = deque(3);
        for i in 0..3 {
            worker.push(i).unwrap();
        }
        for _ in 0..3 {
            assert!(stealer.steal().success().is_some());
        }
        assert_eq!(worker.pop(), None);
        for i in 0..3 {
            worker.push(i).unwrap();
        }
        assert_eq!(worker.len(), 3);
    }

    #[test]
    fn test_drop_frees_queued_items() {
        let marker = Arc::new(());
        let (worker, stealer) = deque(4);
        worker.push(marker.clone()).unwrap();
        worker.push(marker.clone()).unwrap();
        drop(worker);
        drop(stealer);
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn test_contended_steals_deliver_each_item_once() {
        const ITEMS: usize = 20_000;
        const THIEVES: usize = 3;

        let (worker, stealer) = deque::<usize>(256);
        let seen: Arc<Vec<AtomicUsize>> =
            Arc::new((0..ITEMS).map(|_| AtomicUsize::new(0)).collect());
        let done = Arc::new(AtomicBool::new(false));

        let thieves: Vec<_> = (0..THIEVES)
            .map(|_| {
                let stealer = stealer.clone();
                let seen = seen.clone();
                let done = done.clone();
                thread::spawn(move || {
                    loop {
                        match stealer.steal() {
                            Steal::Success(item) => {
                                seen[item].fetch_add(1, Ordering::SeqCst);
                            }
                            Steal::Retry => continue,
                            Steal::Empty if done.load(Ordering::SeqCst) => break,
                            Steal::Empty => thread::yield_now(),
                        }
                    }
                })
            })
            .collect();

        let mut next = 0;
        while next < ITEMS {
            match worker.push(next) {
                Ok(()) => next += 1,
                Err(_) => {
                    if let Some(item) = worker.pop() {
                        seen[item].fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
            if next % 3 == 0 {
                if let Some(item) = worker.pop() {
                    seen[item].fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        while let Some(item) = worker.pop() {
            seen[item].fetch_add(1, Ordering::SeqCst);
        }
        done.store(true, Ordering::SeqCst);
        for thief in thieves {
            thief.join().unwrap();
        }

        for (item, count) in seen.iter().enumerate() {
            assert_eq!(count.load(Ordering::SeqCst), 1, "item {} delivered wrongly", item);
        }
    }

    #[derive(Debug, Clone)]
    enum Op {
        Push(u16),
        Pop,
        Steal,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<u16>().prop_map(Op::Push),
            Just(Op::Pop),
            Just(Op::Steal),
        ]
    }

    proptest! {
        #[test]
        fn prop_single_threaded_matches_vecdeque(ops in prop::collection::vec(op(), 0..48)) {
            let (worker, stealer) = deque(64);
            let mut model = VecDeque::new();
            for op in ops {
                match op {
                    Op::Push(x) => {
                        prop_assert!(worker.push(x).is_ok());
                        model.push_back(x);
                    }
                    Op::Pop => prop_assert_eq!(worker.pop(), model.pop_back()),
                    Op::Steal => prop_assert_eq!(stealer.steal().success(), model.pop_front()),
                }
            }
            prop_assert_eq!(worker.len(), model.len());
        }
    }
}
