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

//! Scheduler configuration

use crate::coroutine::{Scheduler, DEFAULT_STACK_SIZE};

/// Scheduler construction options
#[derive(Debug)]
pub struct Options {
    /// The size of the shared execution stack
    pub stack_size: usize,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

/// Scheduler configuration. Provides control over the properties of a new
/// scheduler.
///
/// ```rust
/// use costack::Builder;
///
/// let mut sch = Builder::new().stack_size(256 * 1024).build();
///
/// let id = sch.spawn(|_| println!("Hello world!!"));
/// sch.resume(id).unwrap();
/// ```
pub struct Builder {
    opts: Options,
}

impl Builder {
    /// Generate the base configuration for opening a scheduler, from which
    /// configuration methods can be chained.
    pub fn new() -> Builder {
        Builder {
            opts: Default::default(),
        }
    }

    /// Set the size of the shared stack. Rounded up to whole pages.
    pub fn stack_size(mut self, size: usize) -> Builder {
        self.opts.stack_size = size;
        self
    }

    /// Open the scheduler.
    pub fn build(self) -> Scheduler {
        Scheduler::with_stack_size(self.opts.stack_size)
    }
}

impl Default for Builder {
    fn default() -> Builder {
        Builder::new()
    }
}

#[cfg(test)]
mod test {
    use super::Builder;
    use crate::coroutine::State;

    #[test]
    fn test_builder_basic() {
        let mut sch = Builder::new().stack_size(64 * 1024).build();

        let id = sch.spawn(|sch| {
            sch.yield_now();
        });

        sch.resume(id).unwrap();
        assert_eq!(sch.state(id), State::Suspended);

        sch.resume(id).unwrap();
        assert_eq!(sch.state(id), State::Dead);
    }
}
