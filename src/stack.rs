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

use std::fmt;
use std::io;
use std::ptr;

/// The shared execution stack.
///
/// One region serves every coroutine of a scheduler. Its contents belong to
/// whichever coroutine is currently running; at every other moment they are
/// scratch, because suspended coroutines keep their live bytes in private
/// snapshots.
pub struct Stack {
    buf: *mut u8,
    len: usize,
}

// Try to use MAP_STACK on platforms that support it (it's what we're doing
// anyway), but some platforms don't define it or give it other meanings.
// FreeBSD's MAP_STACK implies MAP_FIXED, for example:
// http://lists.freebsd.org/pipermail/freebsd-bugs/2011-July/044840.html
#[cfg(any(target_os = "linux", target_os = "android"))]
const STACK_FLAGS: libc::c_int = libc::MAP_STACK | libc::MAP_PRIVATE | libc::MAP_ANON;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const STACK_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;

impl Stack {
    /// Map a stack of at least `size` bytes, rounded up to whole pages.
    ///
    /// There is no guard page below the region: overflow protection is the
    /// caller's overflow assertion at save time, not the MMU's.
    pub fn new(size: usize) -> Stack {
        // There's not much sensible to do when the mapping fails. Failing
        // loudly seems fine (and is what stack allocation has always done).
        let len = round_up(size, page_size());
        let buf = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                STACK_FLAGS,
                -1,
                0,
            )
        };
        if buf == libc::MAP_FAILED {
            panic!(
                "mmap for stack of size {} failed: {}",
                len,
                io::Error::last_os_error()
            );
        }

        Stack {
            buf: buf as *mut u8,
            len,
        }
    }

    /// Point to the low end of the allocated stack
    pub fn start(&self) -> *const u8 {
        self.buf
    }

    /// Point one byte beyond the high end of the allocated stack
    pub fn end(&self) -> *const u8 {
        unsafe { self.buf.add(self.len) }
    }

    /// Usable size of the region in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.len
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stack {{ buf: {:p}, len: {} }}", self.buf, self.len)
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.buf as *mut libc::c_void, self.len);
        }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

// Round up `from` to be divisible by `to`
fn round_up(from: usize, to: usize) -> usize {
    let r = if from % to == 0 {
        from
    } else {
        from + to - (from % to)
    };
    if r == 0 {
        to
    } else {
        r
    }
}

#[cfg(test)]
mod tests {
    use super::{round_up, Stack};

    #[test]
    fn stack_rounds_to_pages() {
        let stk = Stack::new(1);
        assert!(stk.size() >= 1);
        assert_eq!(stk.size() % super::page_size(), 0);
        assert_eq!(stk.end() as usize - stk.start() as usize, stk.size());
    }

    #[test]
    fn stack_is_writable_end_to_end() {
        let stk = Stack::new(16 * 1024);
        unsafe {
            *(stk.start() as *mut u8) = 0xAA;
            *(stk.end().offset(-1) as *mut u8) = 0x55;
        }
    }

    #[test]
    fn round_up_boundaries() {
        assert_eq!(round_up(0, 4096), 4096);
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
    }
}
