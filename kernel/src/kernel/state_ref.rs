// kernel/src/kernel/state_ref.rs
//
// 役割:
// - arch(割り込み) 側から Kernel にアクセスするための “唯一の入口” を提供する。
// - この Mutex が big kernel lock そのもの。
//
// やること:
// - 起動時に Kernel を install する（entry.rs から）
// - 呼び出し側は with_kernel() 経由でのみ &mut Kernel を得る
//
// やらないこと:
// - ロックを持ったままの iretq / hlt（with_kernel のクロージャが返ってから行う）

use spin::Mutex;

use crate::arch::machine::X86Hal;

use super::Kernel;

static KERNEL: Mutex<Option<Kernel<X86Hal>>> = Mutex::new(None);

/// Kernel を登録する（entry.rs から一度だけ呼ぶ）
pub fn install(kernel: Kernel<X86Hal>) {
    let mut guard = KERNEL.lock();
    if guard.is_some() {
        panic!("state_ref: kernel installed twice");
    }
    *guard = Some(kernel);
}

/// ロックを取って Kernel を借りる。未登録なら None。
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel<X86Hal>) -> R) -> Option<R> {
    let mut guard = KERNEL.lock();
    guard.as_mut().map(f)
}
