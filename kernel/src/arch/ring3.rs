// kernel/src/arch/ring3.rs
//
// 役割:
// - 保存された TrapFrame から user（ring3）へ戻る唯一の出口。
// - unsafe asm はここに閉じ込め、上位は「frame を渡すだけ」にする。
//
// やること:
// - es/ds を復元 → 汎用レジスタ 15 本を pop → trapno/err を捨てて iretq
//
// やらないこと:
// - frame の検査（Kernel 側で user セグメント / IF=1 に揃えてある前提）
// - CR3 の切替（Kernel::env_run が済ませている）

use core::mem::offset_of;

use crate::types::TrapFrame;

const OFF_ES: usize = offset_of!(TrapFrame, es);
const OFF_DS: usize = offset_of!(TrapFrame, ds);
const OFF_RIP: usize = offset_of!(TrapFrame, rip);

static_assertions::const_assert_eq!(OFF_ES, 120);
static_assertions::const_assert_eq!(OFF_DS, 128);
static_assertions::const_assert_eq!(OFF_RIP, 152);

/// frame の状態で user に戻る（戻らない）。
///
/// # Safety
/// - tf は user セグメント・IF=1 の frame であること
/// - 現在の CR3 が、その環境のアドレス空間であること
pub unsafe fn env_pop_tf(tf: &TrapFrame) -> ! {
    core::arch::asm!(
        "mov rsp, {tf}",
        "mov rax, [rsp + {es}]",
        "mov es, ax",
        "mov rax, [rsp + {ds}]",
        "mov ds, ax",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rdi",
        "pop rsi",
        "pop rbp",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        // es, ds, trapno, err
        "add rsp, 32",
        "iretq",
        tf = in(reg) tf as *const TrapFrame,
        es = const OFF_ES,
        ds = const OFF_DS,
        options(noreturn)
    );
}
