// kernel/src/panic.rs
//
// 実機の panic ハンドラ。
// - BKL を持ったまま来ることがあるので、logging（Mutex 付き）ではなく debugcon / COM1 へ直接書く
// - PANICKED を立てる。trap 入口はこれを見て、他の CPU を kernel に入れずに止める
// - 2 度目の panic は何も出さずに止まる

use core::fmt::{self, Write};
use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, Ordering};

use x86_64::instructions::interrupts;
use x86_64::instructions::port::Port;

use crate::arch;

static PANICKED: AtomicBool = AtomicBool::new(false);

const DEBUGCON: u16 = 0xE9;
const COM1: u16 = 0x3F8;
const COM1_LSR: u16 = COM1 + 5;
const LSR_THR_EMPTY: u8 = 0x20;

pub fn in_progress() -> bool {
    PANICKED.load(Ordering::Acquire)
}

/// ロックを取らない出力先。COM1 の送信待ちは有限回で諦める
struct RawConsole;

impl RawConsole {
    fn put(&mut self, b: u8) {
        // Safety: 固定 I/O ポートへの読み書きのみ
        unsafe {
            Port::<u8>::new(DEBUGCON).write(b);

            let mut lsr = Port::<u8>::new(COM1_LSR);
            let mut spins = 0u32;
            while lsr.read() & LSR_THR_EMPTY == 0 && spins < 10_000 {
                spins += 1;
            }
            Port::<u8>::new(COM1).write(b);
        }
    }
}

impl Write for RawConsole {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        s.bytes().for_each(|b| self.put(b));
        Ok(())
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    interrupts::disable();
    if PANICKED.swap(true, Ordering::AcqRel) {
        arch::halt_loop();
    }

    let mut out = RawConsole;
    let _ = match info.location() {
        Some(loc) => writeln!(out, "kernel panic at {}:{}: {}", loc.file(), loc.line(), info.message()),
        None => writeln!(out, "kernel panic: {}", info.message()),
    };
    arch::halt_loop()
}
