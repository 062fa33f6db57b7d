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

//! Stack-copying coroutines
//!
//! Many coroutines, one shared execution stack. When a coroutine yields,
//! its live stack bytes are copied out into a private buffer sized to what
//! it was actually using; resuming copies them back. Suspended coroutines
//! are therefore nearly free to keep around, at the price of a memcpy per
//! switch.
//!
//! Scheduling is strictly cooperative and single threaded: control moves
//! only at `resume` and `yield_now`, always through the scheduler's main
//! context, and a scheduler never leaves the thread that opened it.
//!
//! ```rust
//! use costack::{Scheduler, State};
//!
//! let mut sch = Scheduler::new();
//!
//! let id = sch.spawn(|sch| {
//!     for word in ["the", "quick", "brown", "fox"] {
//!         println!("{}", word);
//!         sch.yield_now();
//!     }
//! });
//!
//! while sch.state(id) != State::Dead {
//!     sch.resume(id).unwrap();
//! }
//! ```

pub use crate::builder::{Builder, Options};
pub use crate::coroutine::{ResumeResult, Scheduler, State, DEFAULT_STACK_SIZE};

pub mod builder;
pub mod coroutine;

mod context;
mod stack;
