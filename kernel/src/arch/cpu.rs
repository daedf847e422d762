// src/arch/cpu.rs
// CPU 命令ラッパ。unsafe は最小限。

pub fn halt_loop() -> ! {
    loop {
        // Safety: hlt は状態を壊さない
        unsafe {
            core::arch::asm!("cli", "hlt", options(nomem, nostack));
        }
    }
}

/// スタックを ring0 スタックの先頭に戻し、割り込みを許可して hlt で待つ。
/// 次の割り込みは trap 入口から改めて kernel に入る（ここへは戻らない）。
pub fn idle_on_kernel_stack(stack_top: u64) -> ! {
    // Safety: stack_top は TSS.rsp0 と同じ静的領域。ここから先は何も積まない
    unsafe {
        core::arch::asm!(
            "mov rsp, {top}",
            "xor ebp, ebp",
            "sti",
            "2:",
            "hlt",
            "jmp 2b",
            top = in(reg) stack_top,
            options(noreturn)
        );
    }
}
