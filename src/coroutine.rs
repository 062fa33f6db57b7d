// The MIT License (MIT)

// Copyright (c) 2015 Rustcc Developers

//  Permission is hereby granted, free of charge, to any person obtaining a
//  copy of this software and associated documentation files (the "Software"),
//  to deal in the Software without restriction, including without limitation
//  the rights to use, copy, modify, merge, publish, distribute, sublicense,
//  and/or sell copies of the Software, and to permit persons to whom the
//  Software is furnished to do so, subject to the following conditions:
//
//  The above copyright notice and this permission notice shall be included in
//  all copies or substantial portions of the Software.
//
//  THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
//  OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
//  FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
//  AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
//  LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
//  FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
//  DEALINGS IN THE SOFTWARE.

//! Single threaded coroutines over one shared stack
//!
//! ```rust
//! use costack::Scheduler;
//!
//! let mut sch = Scheduler::new();
//!
//! let id = sch.spawn(|sch| {
//!     println!("Before yield");
//!
//!     // Yield back to whoever resumed this coroutine
//!     sch.yield_now();
//!
//!     println!("I am back!");
//! });
//!
//! // Starts the coroutine
//! sch.resume(id).expect("Failed to resume");
//!
//! println!("Back to main");
//!
//! // Resume it
//! sch.resume(id).expect("Failed to resume");
//!
//! println!("Coroutine finished");
//! ```

/* Every transition passes through the scheduler's main context:
 *
 *                        resume(a)
 *                ------------------------>
 *     [ main ]                              [ coroutine a ]
 *                <------------------------
 *                 yield_now() / body return
 *
 * While a coroutine runs it owns the single shared stack; its frames grow
 * down from the high end of the region:
 *
 *     stack.start()                                   stack.end()
 *          | ........ scratch ........ | live frames |
 *                                      ^
 *                                      sp
 *
 * On yield the live bytes [sp, end) are copied into the coroutine's private
 * snapshot buffer. On resume they are copied back to the same addresses, so
 * every pointer into the coroutine's own frames stays valid across
 * suspension. Idle coroutines therefore cost only the bytes they were
 * actually using, while the region itself is reused by whichever coroutine
 * runs next.
 */

use std::any::Any;
use std::hint;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use log::debug;

use crate::context::Context;
use crate::stack::Stack;

/// Size of the shared execution stack, 1 MiB.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Initial number of slots in the coroutine table.
const INIT_CAPACITY: usize = 16;

/// State of a coroutine
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    /// Spawned but never yet run
    Ready,

    /// Currently on the CPU
    Running,

    /// Yielded; its live stack bytes are parked in a private snapshot
    Suspended,

    /// Finished, or never occupied the queried slot
    Dead,
}

/// Return type of resuming.
///
/// An `Err` carries the payload of a panic that tore the coroutine down
/// during this resume.
pub type ResumeResult<T> = Result<T, Box<dyn Any + Send>>;

type Body = Box<dyn FnOnce(&mut Scheduler)>;

/// Per-coroutine record. Boxed inside the table so that references held
/// across a context swap stay valid while the table grows.
struct Coroutine {
    /// Entry closure; taken out of the record on first entry
    body: Option<Body>,

    /// Where to resume execution next
    ctx: Context,

    /// Saved stack bytes while `Suspended`, empty otherwise. The buffer is
    /// replaced only when too small, so its capacity grows monotonically.
    snapshot: Vec<u8>,

    state: State,
}

/// A cooperative scheduler: one shared stack, one main context, and a table
/// of coroutines multiplexed onto them.
///
/// A scheduler belongs to a single carrier of execution; it is neither
/// `Send` nor `Sync`, so two threads can never alias one. Dropping a
/// scheduler frees every remaining record without driving the bodies to
/// completion: a coroutine suspended at a yield point never unwinds, and
/// whatever it owns there is leaked rather than destructed.
pub struct Scheduler {
    stack: Stack,
    main_ctx: Context,
    table: Vec<Option<Box<Coroutine>>>,
    count: usize,
    running: Option<usize>,

    /// Panic payload in flight from a dying coroutine to the resume caller
    panicked: Option<Box<dyn Any + Send>>,
}

impl Scheduler {
    /// Open a scheduler with the default 1 MiB shared stack.
    pub fn new() -> Scheduler {
        Scheduler::with_stack_size(DEFAULT_STACK_SIZE)
    }

    pub(crate) fn with_stack_size(stack_size: usize) -> Scheduler {
        let mut table = Vec::new();
        table.resize_with(INIT_CAPACITY, || None);

        Scheduler {
            stack: Stack::new(stack_size),
            main_ctx: Context::empty(),
            table,
            count: 0,
            running: None,
            panicked: None,
        }
    }

    /// Create a coroutine in `Ready` state and return its id.
    ///
    /// The body is not entered here; it first runs on the shared stack when
    /// the coroutine is resumed. Ids are stable for the coroutine's
    /// lifetime and may be reused after it dies.
    pub fn spawn<F>(&mut self, f: F) -> usize
    where
        F: FnOnce(&mut Scheduler) + 'static,
    {
        let co = Box::new(Coroutine {
            body: Some(Box::new(f)),
            ctx: Context::empty(),
            snapshot: Vec::new(),
            state: State::Ready,
        });

        let id = self.insert(co);
        self.count += 1;
        debug!("spawned coroutine {}", id);
        id
    }

    // Slot policy: while the table has room, scan from offset `count`
    // wrapping around, which biases reuse toward the lowest free id after a
    // burst of deaths. On a full table, double it and take the first slot of
    // the new half.
    fn insert(&mut self, co: Box<Coroutine>) -> usize {
        let cap = self.table.len();
        if self.count < cap {
            for i in 0..cap {
                let id = (self.count + i) % cap;
                if self.table[id].is_none() {
                    self.table[id] = Some(co);
                    return id;
                }
            }
            unreachable!("count below capacity but no free slot");
        }

        self.table.resize_with(cap * 2, || None);
        self.table[cap] = Some(co);
        cap
    }

    /// Transfer control to coroutine `id` until it yields or finishes.
    ///
    /// Only legal from the main context. Resuming a dead id is a no-op.
    /// When the coroutine panics during this resume, its record is
    /// destroyed exactly as on a normal return and the payload comes back
    /// as `Err`.
    pub fn resume(&mut self, id: usize) -> ResumeResult<()> {
        assert!(
            self.running.is_none(),
            "resume is only legal from the main context"
        );
        assert!(id < self.table.len(), "coroutine id {} out of range", id);

        let sch = self as *mut Scheduler as usize;
        let co = match self.table[id].as_mut() {
            Some(co) => co,
            None => return Ok(()), // already dead
        };

        match co.state {
            State::Ready => {
                debug!("first entry into coroutine {}", id);
                co.ctx = Context::new(launch, sch, &self.stack);
                co.state = State::Running;
                self.running = Some(id);
                Context::swap(&mut self.main_ctx, &co.ctx);
            }
            State::Suspended => {
                debug!(
                    "restoring {} snapshot bytes for coroutine {}",
                    co.snapshot.len(),
                    id
                );
                // Frames grow down from stack.end(), so the snapshot goes
                // back to the top of the region, at the addresses it was
                // taken from.
                let len = co.snapshot.len();
                let dst = self.stack.end() as usize - len;
                unsafe {
                    ptr::copy_nonoverlapping(co.snapshot.as_ptr(), dst as *mut u8, len);
                }
                co.state = State::Running;
                self.running = Some(id);
                Context::swap(&mut self.main_ctx, &co.ctx);
            }
            State::Running => panic!("coroutine {} resumed while already running", id),
            State::Dead => unreachable!("dead coroutines have no record"),
        }

        // Back on the main context: the coroutine either suspended itself or
        // died. A payload left behind by the launcher surfaces here.
        match self.panicked.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Suspend the running coroutine and hand control back to the caller of
    /// `resume`.
    ///
    /// Panics when no coroutine is running; yielding from the main context
    /// is a programming error.
    pub fn yield_now(&mut self) {
        let id = self
            .running
            .take()
            .expect("yield_now called outside a running coroutine");
        let base = self.stack.start() as usize;
        let top = self.stack.end() as usize;

        debug!("suspending coroutine {}", id);
        let co = self.table[id]
            .as_mut()
            .expect("running coroutine has no record");
        save_stack(co, base, top);
        // From here to the swap, only the heap may be touched: this frame is
        // already captured in the snapshot, and stack writes would be undone
        // on resume.
        co.state = State::Suspended;

        Context::swap(&mut co.ctx, &self.main_ctx);
    }

    /// Report the lifecycle state of `id`. Empty slots read as `Dead`.
    pub fn state(&self, id: usize) -> State {
        assert!(id < self.table.len(), "coroutine id {} out of range", id);
        match self.table[id] {
            Some(ref co) => co.state,
            None => State::Dead,
        }
    }

    /// Id of the coroutine currently on the CPU, if any.
    #[inline]
    pub fn running(&self) -> Option<usize> {
        self.running
    }

    /// Number of live coroutines.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Current size of the coroutine table.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.table.len()
    }
}

impl Default for Scheduler {
    fn default() -> Scheduler {
        Scheduler::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        debug!("dropping scheduler with {} live coroutine(s)", self.count);
    }
}

/// Copy the running coroutine's live stack into its snapshot buffer.
///
/// Deliberately not inlined: the marker local must sit in a frame *below*
/// the yielding frame, so that every byte the resumed coroutine can still
/// touch lands inside the snapshot. `black_box` keeps the marker out of a
/// register; its address stands in for the stack pointer.
#[inline(never)]
fn save_stack(co: &mut Coroutine, base: usize, top: usize) {
    let mut marker: u8 = 0;
    let sp = hint::black_box(&mut marker) as *mut u8 as usize;
    assert!(sp >= base, "shared stack overflow detected while yielding");

    let used = top - sp;
    if co.snapshot.capacity() < used {
        // Replace rather than grow in place; the old contents are dead.
        co.snapshot = Vec::with_capacity(used);
    }
    unsafe {
        ptr::copy_nonoverlapping(sp as *const u8, co.snapshot.as_mut_ptr(), used);
        co.snapshot.set_len(used);
    }
}

/// First-entry trampoline; runs at the top of the shared stack.
extern "C" fn launch(arg: usize) -> ! {
    let sch = arg as *mut Scheduler;

    unsafe {
        let id = (*sch)
            .running
            .expect("launched with no running coroutine");
        let body = (&mut (*sch).table)[id]
            .as_mut()
            .and_then(|co| co.body.take())
            .expect("launched coroutine has no body");

        // Unwinding across a context switch is undefined behavior; catch the
        // panic here and relay the payload to the resume caller instead.
        let body_sch: &mut Scheduler = &mut *sch;
        if let Err(err) = panic::catch_unwind(AssertUnwindSafe(move || body(body_sch))) {
            (*sch).panicked = Some(err);
        }

        // The body returned or panicked: tear the record down, free the slot
        // for reuse and step back to the main context for good.
        debug!("coroutine {} finished", id);
        (&mut (*sch).table)[id] = None;
        (*sch).count -= 1;
        (*sch).running = None;

        let mut done = Context::empty();
        Context::swap(&mut done, &(*sch).main_ctx);
    }

    unreachable!();
}

#[cfg(test)]
mod test {
    use std::sync::mpsc::channel;

    use super::{Scheduler, State};

    #[test]
    fn test_coroutine_basic() {
        let (tx, rx) = channel();
        let mut sch = Scheduler::new();

        let id = sch.spawn(move |_| {
            tx.send(1).unwrap();
        });
        sch.resume(id).expect("Failed to resume");

        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(sch.state(id), State::Dead);
    }

    #[test]
    fn test_coroutine_yield() {
        let (tx, rx) = channel();
        let mut sch = Scheduler::new();

        let id = sch.spawn(move |sch| {
            tx.send(1).unwrap();

            sch.yield_now();

            tx.send(2).unwrap();
        });

        sch.resume(id).expect("Failed to resume");
        assert_eq!(rx.recv().unwrap(), 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(sch.state(id), State::Suspended);

        sch.resume(id).expect("Failed to resume");
        assert_eq!(rx.recv().unwrap(), 2);
        assert_eq!(sch.state(id), State::Dead);
    }

    #[test]
    fn test_spawn_observable_effects() {
        let mut sch = Scheduler::new();
        let id = sch.spawn(|_| {});

        assert_eq!(sch.state(id), State::Ready);
        assert_eq!(sch.running(), None);
        assert_eq!(sch.count(), 1);
    }

    #[test]
    fn test_coroutine_spawn_inside() {
        let (tx, rx) = channel();
        let mut sch = Scheduler::new();

        let tx2 = tx.clone();
        let id = sch.spawn(move |sch| {
            tx.send(1).unwrap();

            // Spawning is legal from inside a body; only resuming is not.
            let inner = sch.spawn(move |_| {
                tx2.send(2).unwrap();
            });
            assert_eq!(sch.state(inner), State::Ready);
        });

        sch.resume(id).expect("Failed to resume");
        assert_eq!(rx.recv().unwrap(), 1);

        // The outer body is done, the inner coroutine is still waiting.
        assert_eq!(sch.count(), 1);
        assert_eq!(sch.running(), None);

        // Drive the remaining coroutine to completion.
        for id in 0..sch.capacity() {
            sch.resume(id).expect("Failed to resume");
        }
        assert_eq!(rx.recv().unwrap(), 2);
        assert_eq!(sch.count(), 0);
    }

    #[test]
    fn test_coroutine_panic() {
        let mut sch = Scheduler::new();
        let id = sch.spawn(|_| {
            panic!("Panic inside a coroutine!!");
        });

        assert!(sch.resume(id).is_err());
        assert_eq!(sch.state(id), State::Dead);
        assert_eq!(sch.count(), 0);
        assert_eq!(sch.running(), None);
    }

    #[test]
    fn test_coroutine_resume_after_finished() {
        let mut sch = Scheduler::new();
        let id = sch.spawn(|_| {});
        sch.resume(id).expect("Failed to resume");

        // It is already finished, but we try to resume it
        assert!(sch.resume(id).is_ok());

        // Again?
        assert!(sch.resume(id).is_ok());
        assert_eq!(sch.state(id), State::Dead);
    }

    #[test]
    fn test_coroutine_resume_itself() {
        let mut sch = Scheduler::new();
        let id = sch.spawn(move |sch| {
            // Re-entrant resume violates the main-context precondition; the
            // assertion panic is relayed as an error.
            let me = sch.running().unwrap();
            let _ = sch.resume(me);
        });

        assert!(sch.resume(id).is_err());
        assert_eq!(sch.state(id), State::Dead);
    }

    #[test]
    #[should_panic]
    fn test_yield_in_main() {
        let mut sch = Scheduler::new();
        sch.yield_now();
    }

    #[test]
    #[should_panic]
    fn test_state_out_of_range() {
        let sch = Scheduler::new();
        let _ = sch.state(10_000);
    }
}
