/*!
Raw stackful context switch.

[`cross_call`] saves the current `PC`/`SP`/`FP` into `*out`, loads the same
three words from `*in_`, and continues execution at the loaded `PC`. The
callee-saved registers are spilled to the outgoing stack before the switch
and restored when the context is later resumed, so from the caller's point
of view this behaves like an ordinary function call that happens to return
only when someone cross-calls back. The argument travels in the platform's
first argument register and pops out as the return value on the other side.

This is the primitive underneath [`coroutine`](crate::coroutine) and
[`fiber`](crate::fiber); using it directly is possible but easy to get
wrong — a context must never be entered twice without being saved again in
between.
*/

/// Saved execution context: three machine words.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    pub(crate) pc: usize,
    pub(crate) sp: usize,
    pub(crate) fp: usize,
}

impl Context {
    pub const fn new() -> Self {
        Self { pc: 0, sp: 0, fp: 0 }
    }

    /// Prepare a context that will enter `entry(arg)` on the given stack.
    /// The stack grows down from `stack_base + stack_size`, aligned to 16.
    ///
    /// # Safety
    ///
    /// The stack region must stay valid and unused by anything else until
    /// the context ceases.
    pub(crate) unsafe fn prepare(entry: extern "C" fn(usize) -> !, stack_base: *mut u8, stack_size: usize) -> Self {
        let mut sp = (stack_base as usize + stack_size) & !15;
        if cfg!(target_arch = "x86_64") {
            // Entered by jump, not call: compensate for the missing return
            // address so the callee sees the ABI-mandated alignment.
            sp -= 8;
        }
        Self {
            pc: entry as usize,
            sp,
            fp: 0,
        }
    }
}

extern "C" {
    fn manycore_cross_call(arg: usize, out: *mut Context, inp: *const Context) -> usize;
}

/// Switch from the current context (saved into `*out`) to `*in_`.
///
/// Returns the argument supplied by whichever context later cross-calls
/// back into `*out`.
///
/// # Safety
///
/// `in_` must hold a context that is suspended (saved by a previous
/// cross-call) or freshly prepared; `out` must stay valid until re-entered.
#[inline(always)]
pub unsafe fn cross_call(arg: usize, out: *mut Context, in_: *const Context) -> usize {
    unsafe { manycore_cross_call(arg, out, in_) }
}

#[cfg(target_arch = "x86_64")]
std::arch::global_asm!(
    ".text",
    ".globl manycore_cross_call",
    ".p2align 4",
    "manycore_cross_call:",
    // Spill callee-saved registers to the outgoing stack.
    "push rbx",
    "push rbp",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    // Save old PC (the resume label), SP and FP.
    "lea rax, [rip + 2f]",
    "mov qword ptr [rsi + 0], rax",
    "mov qword ptr [rsi + 8], rsp",
    "mov qword ptr [rsi + 16], rbp",
    // Load the new context and jump; the argument stays in rdi.
    "mov rax, qword ptr [rdx + 0]",
    "mov rsp, qword ptr [rdx + 8]",
    "mov rbp, qword ptr [rdx + 16]",
    "jmp rax",
    "2:",
    // Resumed: restore callee-saved registers, return the incoming arg.
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbp",
    "pop rbx",
    "mov rax, rdi",
    "ret",
);

#[cfg(target_arch = "aarch64")]
std::arch::global_asm!(
    ".text",
    ".globl manycore_cross_call",
    ".p2align 4",
    "manycore_cross_call:",
    // Spill callee-saved registers to the outgoing stack.
    "stp x29, x30, [sp, #-176]!",
    "stp x19, x20, [sp, #16]",
    "stp x21, x22, [sp, #32]",
    "stp x23, x24, [sp, #48]",
    "stp x25, x26, [sp, #64]",
    "stp x27, x28, [sp, #80]",
    "stp d8,  d9,  [sp, #96]",
    "stp d10, d11, [sp, #112]",
    "stp d12, d13, [sp, #128]",
    "stp d14, d15, [sp, #144]",
    // Save old PC (the resume label), SP and FP.
    "adr x3, 2f",
    "mov x4, sp",
    "stp x3, x4, [x1]",
    "str x29, [x1, #16]",
    // Load the new context and branch; the argument stays in x0.
    "ldp x3, x4, [x2]",
    "ldr x29, [x2, #16]",
    "mov sp, x4",
    "br x3",
    "2:",
    "hint #36", // BTI j landing pad for the indirect branch.
    "ldp x19, x20, [sp, #16]",
    "ldp x21, x22, [sp, #32]",
    "ldp x23, x24, [sp, #48]",
    "ldp x25, x26, [sp, #64]",
    "ldp x27, x28, [sp, #80]",
    "ldp d8,  d9,  [sp, #96]",
    "ldp d10, d11, [sp, #112]",
    "ldp d12, d13, [sp, #128]",
    "ldp d14, d15, [sp, #144]",
    "ldp x29, x30, [sp], #176",
    "ret",
);
