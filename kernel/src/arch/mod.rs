// kernel/src/arch/mod.rs
//
// アーキ依存部。unsafe をできるだけここに閉じ込める方針。
// - cpu: hlt / idle ループなど CPU 固有処理
// - gdt: GDT / TSS（user セグメントと ring0 スタック）
// - interrupts: IDT、trap 入口 stub、8259 PIC
// - ring3: 保存 TrapFrame から user へ戻る（iretq）
// - machine: Kernel が要求する Hal の実機実装

pub mod cpu;
pub mod gdt;
pub mod interrupts;
pub mod machine;
pub mod ring3;

use crate::kernel::Dispatch;

/// アーキ依存初期化処理（GDT → IDT → PIC の順）
pub fn init() {
    gdt::init();
    interrupts::init();
}

/// CPU を停止させるループ
pub fn halt_loop() -> ! {
    cpu::halt_loop()
}

/// trap 処理の結論に従う。ロックは解放済みであること。
pub fn follow(dispatch: Dispatch) -> ! {
    match dispatch {
        // Safety: Resume の frame は sanitize 済み（user セグメント / IF=1）で、
        //         CR3 は Kernel がその環境の root をロード済み
        Dispatch::Resume(tf) => unsafe { ring3::env_pop_tf(&tf) },
        Dispatch::Idle => cpu::idle_on_kernel_stack(gdt::kernel_stack_top()),
    }
}
