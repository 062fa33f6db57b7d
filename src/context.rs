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

use std::arch::naked_asm;

use crate::stack::Stack;

#[cfg(not(all(unix, any(target_arch = "x86_64", target_arch = "aarch64"))))]
compile_error!("costack's context primitive supports x86_64 and aarch64 unix targets only");

/// A suspended execution state: enough callee-saved machine state to pick up
/// exactly where a previous `swap` left off.
#[derive(Debug)]
pub struct Context {
    regs: Registers,
}

/// Entry point installed on a fresh stack. Receives one pointer-sized
/// argument and must never return; the stack it runs on has no caller frame
/// to return into.
pub type InitFn = extern "C" fn(usize) -> !;

impl Context {
    pub fn empty() -> Context {
        Context {
            regs: Registers::new(),
        }
    }

    /// Create a context that will start running `init(arg)` at the top of
    /// `stack` when first swapped in.
    ///
    /// The argument rides in a callee-saved register; a small bootstrap shim
    /// moves it into the ABI argument register before jumping to `init`, so
    /// no stack-based argument marshaling is needed.
    pub fn new(init: InitFn, arg: usize, stack: &Stack) -> Context {
        let mut regs = Registers::new();
        initialize_call_frame(&mut regs, init, arg, stack.end() as *mut u8);
        Context { regs }
    }

    /// Switch contexts
    ///
    /// Suspend the current execution state into `out_context` and resume
    /// whatever `in_context` describes. The call appears to return normally
    /// once some other context swaps back into `out_context`.
    ///
    /// Forced inline: the suspension point must land in the caller's own
    /// frame, not in a wrapper frame below it. A coroutine's snapshot covers
    /// the yielding frame and everything above, so a non-inlined wrapper
    /// would wake up with its frame unrestored.
    #[inline(always)]
    pub fn swap(out_context: &mut Context, in_context: &Context) {
        unsafe {
            swap_registers(&mut out_context.regs, &in_context.regs);
        }
    }
}

// Register blocks used by the supported architectures.
//
// Only the callee-saved set is held here; anything caller-saved is already
// on the stack at every swap site, placed there by the compiler under the
// normal calling convention. The resume address is an explicit field and the
// restore path jumps through a register rather than popping it off the new
// stack: with a stack-copying scheduler the memory at and below the saved
// stack pointer is not covered by a coroutine's snapshot, so a `ret` through
// it would read whatever the stack's next tenant left behind.

#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[derive(Debug)]
struct Registers {
    rip: u64,
    rsp: u64,
    rbp: u64,
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
}

#[cfg(target_arch = "x86_64")]
impl Registers {
    fn new() -> Registers {
        Registers {
            rip: 0,
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Save the SysV callee-saved set plus resume point into `out_regs`, then
/// load `in_regs` and jump. Offsets must match the field layout of
/// `Registers`: rip at 0x00, rsp at 0x08, then rbp, rbx, r12-r15.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
unsafe extern "C" fn swap_registers(out_regs: *mut Registers, in_regs: *const Registers) {
    naked_asm!(
        // rdi = out_regs, rsi = in_regs. The return address sitting at [rsp]
        // is where the suspended world resumes; record it and the post-return
        // stack pointer instead of leaving either on the stack.
        "mov rax, [rsp]",
        "lea rcx, [rsp + 8]",
        "mov [rdi + 0x00], rax",
        "mov [rdi + 0x08], rcx",
        "mov [rdi + 0x10], rbp",
        "mov [rdi + 0x18], rbx",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        "mov rax, [rsi + 0x00]",
        "mov rsp, [rsi + 0x08]",
        "mov rbp, [rsi + 0x10]",
        "mov rbx, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
    )
}

/// Landing pad for first entry. `initialize_call_frame` parks the argument
/// in r12 and the entry function in r14; the shim moves them into the slots
/// an `extern "C" fn(usize)` expects.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
unsafe extern "C" fn bootstrap() {
    naked_asm!("mov rdi, r12", "jmp r14")
}

#[cfg(target_arch = "x86_64")]
fn initialize_call_frame(regs: &mut Registers, fptr: InitFn, arg: usize, sp: *mut u8) {
    let sp = align_down(sp);
    // Mimic the stack state right after a `call`: rsp sits 8 past a 16-byte
    // boundary with a return slot on top. The slot is zero because the entry
    // function never returns through it.
    let sp = unsafe { sp.offset(-8) };
    unsafe { *(sp as *mut usize) = 0 };

    regs.rip = bootstrap as usize as u64;
    regs.rsp = sp as u64;
    regs.r12 = arg as u64;
    regs.r14 = fptr as usize as u64;

    // Last base pointer on the stack is 0
    regs.rbp = 0;
}

#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Debug)]
struct Registers {
    lr: u64,
    sp: u64,
    gpr: [u64; 10], // x19 - x28
    fp: u64,
    fpr: [u64; 8], // low halves of v8 - v15
}

#[cfg(target_arch = "aarch64")]
impl Registers {
    fn new() -> Registers {
        Registers {
            lr: 0,
            sp: 0,
            gpr: [0; 10],
            fp: 0,
            fpr: [0; 8],
        }
    }
}

/// Save the AAPCS64 callee-saved set into `out_regs`, load `in_regs` and
/// `ret` through the restored x30. Offsets must match the field layout of
/// `Registers`: lr at 0x00, sp at 0x08, x19-x28 from 0x10, x29 at 0x60,
/// d8-d15 from 0x68.
#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
unsafe extern "C" fn swap_registers(out_regs: *mut Registers, in_regs: *const Registers) {
    naked_asm!(
        // x0 = out_regs, x1 = in_regs. x30 already holds the resume address.
        "str x30, [x0, 0x00]",
        "mov x9, sp",
        "str x9, [x0, 0x08]",
        "stp x19, x20, [x0, 0x10]",
        "stp x21, x22, [x0, 0x20]",
        "stp x23, x24, [x0, 0x30]",
        "stp x25, x26, [x0, 0x40]",
        "stp x27, x28, [x0, 0x50]",
        "str x29, [x0, 0x60]",
        "stp d8, d9, [x0, 0x68]",
        "stp d10, d11, [x0, 0x78]",
        "stp d12, d13, [x0, 0x88]",
        "stp d14, d15, [x0, 0x98]",
        "ldr x30, [x1, 0x00]",
        "ldr x9, [x1, 0x08]",
        "mov sp, x9",
        "ldp x19, x20, [x1, 0x10]",
        "ldp x21, x22, [x1, 0x20]",
        "ldp x23, x24, [x1, 0x30]",
        "ldp x25, x26, [x1, 0x40]",
        "ldp x27, x28, [x1, 0x50]",
        "ldr x29, [x1, 0x60]",
        "ldp d8, d9, [x1, 0x68]",
        "ldp d10, d11, [x1, 0x78]",
        "ldp d12, d13, [x1, 0x88]",
        "ldp d14, d15, [x1, 0x98]",
        "ret",
    )
}

/// Landing pad for first entry: argument parked in x19, entry function in
/// x20.
#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
unsafe extern "C" fn bootstrap() {
    naked_asm!("mov x0, x19", "br x20")
}

#[cfg(target_arch = "aarch64")]
fn initialize_call_frame(regs: &mut Registers, fptr: InitFn, arg: usize, sp: *mut u8) {
    // sp must stay 16-byte aligned at all times on aarch64
    let sp = align_down(sp);

    regs.lr = bootstrap as usize as u64;
    regs.sp = sp as u64;
    regs.gpr[0] = arg as u64; // x19
    regs.gpr[1] = fptr as usize as u64; // x20

    // Last frame pointer in the chain is 0
    regs.fp = 0;
}

fn align_down(sp: *mut u8) -> *mut u8 {
    let sp = (sp as usize) & !(16 - 1);
    sp as *mut u8
}

#[cfg(test)]
mod test {
    use std::sync::mpsc::{channel, Sender};

    use crate::context::Context;
    use crate::stack::Stack;

    struct SwapEnv {
        main_ctx: Context,
        task_ctx: Context,
        tx: Sender<i32>,
    }

    extern "C" fn once_fn(arg: usize) -> ! {
        let env = unsafe { &mut *(arg as *mut SwapEnv) };
        env.tx.send(1).unwrap();

        let mut dummy = Context::empty();
        Context::swap(&mut dummy, &env.main_ctx);

        unreachable!();
    }

    extern "C" fn pingpong_fn(arg: usize) -> ! {
        let env = unsafe { &mut *(arg as *mut SwapEnv) };

        env.tx.send(1).unwrap();
        Context::swap(&mut env.task_ctx, &env.main_ctx);

        env.tx.send(2).unwrap();

        let mut dummy = Context::empty();
        Context::swap(&mut dummy, &env.main_ctx);

        unreachable!();
    }

    #[test]
    fn test_swap_context() {
        let (tx, rx) = channel();
        let stk = Stack::new(128 * 1024);
        let mut env = Box::new(SwapEnv {
            main_ctx: Context::empty(),
            task_ctx: Context::empty(),
            tx,
        });
        let arg = &mut *env as *mut SwapEnv as usize;
        env.task_ctx = Context::new(once_fn, arg, &stk);

        assert!(rx.try_recv().is_err());

        Context::swap(&mut env.main_ctx, &env.task_ctx);

        assert_eq!(rx.recv().unwrap(), 1);
    }

    #[test]
    fn test_swap_resumes_mid_function() {
        let (tx, rx) = channel();
        let stk = Stack::new(128 * 1024);
        let mut env = Box::new(SwapEnv {
            main_ctx: Context::empty(),
            task_ctx: Context::empty(),
            tx,
        });
        let arg = &mut *env as *mut SwapEnv as usize;
        env.task_ctx = Context::new(pingpong_fn, arg, &stk);

        Context::swap(&mut env.main_ctx, &env.task_ctx);
        assert_eq!(rx.recv().unwrap(), 1);
        assert!(rx.try_recv().is_err());

        Context::swap(&mut env.main_ctx, &env.task_ctx);
        assert_eq!(rx.recv().unwrap(), 2);
    }
}
