// kernel/src/kernel/hal.rs
//
// 役割:
// - カーネル本体（環境管理 / trap / syscall）が使うハードウェア境界。
//
// やること:
// - CR3 切替、TLB 無効化、CR2 読み出し、コンソール、割り込み ACK、デバッガ入口
//
// やらないこと:
// - 実装（実機は arch::machine、host は hosted::SimHal）
//
// 設計方針:
// - Kernel<H: Hal> だけがこの境界を所有する。&mut Kernel を持つ = big kernel lock を持つ。

use crate::mem::addr::{PhysFrame, VirtAddr};
use crate::mm::PhysMemory;
use crate::types::{TrapFrame, NCPU};

/// CPU 番号（0..NCPU）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuId(pub usize);

impl CpuId {
    pub const BOOT: CpuId = CpuId(0);

    pub fn index(self) -> usize {
        debug_assert!(self.0 < NCPU);
        self.0
    }
}

pub trait Platform {
    /// この CPU のアクティブなアドレス空間を切り替える（CR3）
    fn load_root(&mut self, cpu: CpuId, root: PhysFrame);

    /// root が現在ロード中なら va の TLB エントリを捨てる
    fn invalidate_page(&mut self, root: PhysFrame, va: VirtAddr);

    /// 直近の #PF の fault アドレス（CR2）
    fn fault_address(&self) -> u64;

    fn console_write(&mut self, bytes: &[u8]);

    /// 入力が無ければ None（ブロックしない）
    fn console_getc(&mut self) -> Option<u8>;

    /// 外部割り込みの EOI
    fn end_of_interrupt(&mut self, irq: u8);

    /// breakpoint で入る対話デバッガ（戻ったら環境を再開する）
    fn monitor(&mut self, tf: &TrapFrame);
}

pub trait Hal: PhysMemory + Platform {}

impl<T: PhysMemory + Platform> Hal for T {}
